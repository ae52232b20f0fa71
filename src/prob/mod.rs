mod multinormal;

pub use multinormal::*;

/// Orthant and rectangle probabilities of multivariate normals (Genz integration).
mod orthant;

pub use orthant::*;
