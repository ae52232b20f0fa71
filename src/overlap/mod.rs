use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Serialize, Deserialize};
use std::fmt::{self, Display};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};
use crate::approx::{Contour, RegionError};
use crate::hypervolume::{check_dimensions, HypervolumeDescriptor};
use crate::prob::{IntegrationError, OrthantSettings};

/// Draws point sets from hypervolume descriptors.
pub mod sampler;

pub use sampler::*;

/// Per-point inclusion scores against a target hypervolume.
pub mod inclusion;

pub use inclusion::*;

/// Below this many null draws a candidate's score can never fall to the inclusion
/// threshold (1 / (ndraws + 1) > 0.05), so every point counts as included.
const MIN_DISCRIMINATING_DRAWS : usize = 19;

#[derive(Debug, Error)]
pub enum OverlapError {

    #[error("Hypervolumes have different dimensions: {left:?} vs. {right:?}")]
    DimensionMismatch { left : Vec<String>, right : Vec<String> },

    #[error("Only {drawn} points were sampled from '{label}' but ndraws = {ndraws}; increase proppoints or decrease ndraws")]
    InsufficientSample { label : String, drawn : usize, ndraws : usize },

    #[error("Tail probability under '{label}' failed: {source}")]
    Integration { label : String, source : IntegrationError },

    #[error("Invalid hypervolume '{label}': {reason}")]
    InvalidDescriptor { label : String, reason : String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Region(#[from] RegionError),

    #[error("Overlap estimation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error)

}

/// Which point set is being tested against which hypervolume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {

    /// Points sampled from the first hypervolume, tested against the second.
    FirstInSecond,

    /// Points sampled from the second hypervolume, tested against the first.
    SecondInFirst

}

impl Display for Direction {

    fn fmt(&self, f : &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::FirstInSecond => write!(f, "hv1 in hv2"),
            Direction::SecondInFirst => write!(f, "hv2 in hv1")
        }
    }

}

/// Receives progress of the estimation. Each direction reports one unit per tail
/// statistic evaluated: first the target's own points, then the candidates. Calls
/// may arrive concurrently from worker threads.
pub trait Progress : Sync {

    fn start(&self, _direction : Direction, _total : usize) { }

    fn advance(&self, _direction : Direction, _n : usize) { }

    fn finish(&self, _direction : Direction) { }

}

/// Silent progress.
impl Progress for () { }

/// Shared flag that aborts a running estimation. Clones refer to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {

    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), OverlapError> {
        if self.is_cancelled() {
            Err(OverlapError::Cancelled)
        } else {
            Ok(())
        }
    }

}

/// Options of an overlap comparison. Every field has a default, so configuration
/// files only need to carry the fields they change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OverlapConfig {

    /// Whether to estimate the overlap.
    pub overlap : bool,

    /// Whether to compute the confidence ellipses of both hypervolumes.
    pub plot : bool,

    /// Pair of dimension indices the ellipses are projected on.
    pub dims : (usize, usize),

    /// Points sampled per unit of volume.
    pub proppoints : f64,

    /// Null draws per inclusion test.
    pub ndraws : usize,

    /// Seed of the master generator. Entropy-seeded when absent.
    pub seed : Option<u64>,

    /// Worker threads; zero uses the global rayon pool.
    pub threads : usize,

    /// Confidence level of the ellipses.
    pub level : f64,

    pub integration : OrthantSettings

}

impl Default for OverlapConfig {

    fn default() -> Self {
        Self {
            overlap : true,
            plot : true,
            dims : (0, 1),
            proppoints : 1.0,
            ndraws : 100,
            seed : None,
            threads : 0,
            level : 0.95,
            integration : OrthantSettings::default()
        }
    }

}

impl OverlapConfig {

    pub fn load_from_path<P : AsRef<Path>>(path : P) -> Result<Self, OverlapError> {
        let f = File::open(path.as_ref())?;
        let config : Self = serde_json::from_reader(BufReader::new(f))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), OverlapError> {
        if !(self.proppoints.is_finite() && self.proppoints > 0.0) {
            return Err(OverlapError::InvalidConfig(format!("proppoints must be positive (got {})", self.proppoints)));
        }
        if self.ndraws == 0 {
            return Err(OverlapError::InvalidConfig(String::from("ndraws must be at least 1")));
        }
        if self.plot && self.dims.0 == self.dims.1 {
            return Err(OverlapError::InvalidConfig(format!("dims must be two distinct indices (got {:?})", self.dims)));
        }
        if !(self.level > 0.0 && self.level < 1.0) {
            return Err(OverlapError::InvalidConfig(format!("level must lie in (0, 1) (got {})", self.level)));
        }
        if !(self.integration.abs_tol > 0.0) || self.integration.max_evals == 0 {
            return Err(OverlapError::InvalidConfig(String::from("integration needs a positive tolerance and evaluation budget")));
        }
        Ok(())
    }

    fn master_rng(&self) -> ChaCha8Rng {
        match self.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy()
        }
    }

    fn thread_pool(&self) -> Result<Option<rayon::ThreadPool>, OverlapError> {
        if self.threads == 0 {
            return Ok(None);
        }
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .build()
            .map(Some)
            .map_err(|e| OverlapError::InvalidConfig(format!("cannot build thread pool: {}", e)) )
    }

}

/// Generator for one unit of work: the seed selects the direction, the stream the point.
pub(crate) fn stream_rng(seed : u64, stream : u64) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(stream);
    rng
}

/// Overlap estimate with the counts it was computed from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OverlapEstimate {

    /// (included_in_second + included_in_first) / (volume of first + volume of second).
    pub value : f64,

    /// Points sampled from the first hypervolume judged to belong to the second.
    pub included_in_second : usize,

    /// Points sampled from the second hypervolume judged to belong to the first.
    pub included_in_first : usize,

    pub points_first : usize,

    pub points_second : usize,

    pub volume_sum : f64

}

/// Estimates the overlap between two hypervolumes. Points are sampled from both normals
/// (proportionally to their volumes), then every point of each set is scored against the
/// other hypervolume, with that hypervolume's own point set as the null sample.
pub fn estimate_overlap(
    first : &HypervolumeDescriptor,
    second : &HypervolumeDescriptor,
    config : &OverlapConfig,
    progress : &dyn Progress,
    cancel : &CancelToken
) -> Result<OverlapEstimate, OverlapError> {
    check_dimensions(first, second)?;
    config.validate()?;

    let mut rng = config.master_rng();
    let points_first = sample(first, config.proppoints, &mut rng);
    let points_second = sample(second, config.proppoints, &mut rng);
    info!(
        first = first.label(),
        second = second.label(),
        points_first = points_first.len(),
        points_second = points_second.len(),
        "sampled hypervolumes"
    );
    for (descr, points) in [(first, &points_first), (second, &points_second)].iter() {
        if points.len() < config.ndraws {
            return Err(OverlapError::InsufficientSample {
                label : descr.label().to_string(),
                drawn : points.len(),
                ndraws : config.ndraws
            });
        }
    }
    if config.ndraws < MIN_DISCRIMINATING_DRAWS {
        warn!(ndraws = config.ndraws, "too few null draws to ever exclude a point");
    }

    let seeds : (u64, u64) = (rng.gen(), rng.gen());
    let run = || {
        rayon::join(
            || count_included(&points_first, second, &points_second, config, seeds.0, Direction::FirstInSecond, progress, cancel),
            || count_included(&points_second, first, &points_first, config, seeds.1, Direction::SecondInFirst, progress, cancel)
        )
    };
    let (in_second, in_first) = match config.thread_pool()? {
        Some(pool) => pool.install(run),
        None => run()
    };
    let (in_second, in_first) = (in_second?, in_first?);

    let volume_sum = first.volume() + second.volume();
    let estimate = OverlapEstimate {
        value : (in_second + in_first) as f64 / volume_sum,
        included_in_second : in_second,
        included_in_first : in_first,
        points_first : points_first.len(),
        points_second : points_second.len(),
        volume_sum
    };
    info!(value = estimate.value, in_second, in_first, "overlap estimated");
    Ok(estimate)
}

/// Counts how many candidates score above the inclusion threshold against the target.
fn count_included(
    candidates : &SampledPointSet,
    target : &HypervolumeDescriptor,
    null_sample : &SampledPointSet,
    config : &OverlapConfig,
    seed : u64,
    direction : Direction,
    progress : &dyn Progress,
    cancel : &CancelToken
) -> Result<usize, OverlapError> {
    progress.start(direction, null_sample.len() + candidates.len());
    let tester = InclusionTester::new(target, config.integration)?;
    let null = tester.null_distribution(null_sample, seed, direction, progress, cancel)?;
    debug!(%direction, nulls = null.len(), "null distribution ready");

    // Candidate streams follow the null streams under the same seed.
    let offset = null_sample.len() as u64;
    let included = (0..candidates.len()).into_par_iter()
        .map(|i| -> Result<usize, OverlapError> {
            cancel.check()?;
            let mut rng = stream_rng(seed, offset + i as u64);
            let stat = tester.statistic(&candidates.point(i), &mut rng)?;
            let score = null.score(stat, config.ndraws, &mut rng)?;
            progress.advance(direction, 1);
            Ok(usize::from(score > INCLUSION_THRESHOLD))
        })
        .try_reduce(|| 0, |a, b| Ok(a + b) )?;
    progress.finish(direction);
    debug!(%direction, included, candidates = candidates.len(), "direction done");
    Ok(included)
}

/// Everything a comparison produces, according to the overlap/plot switches.
#[derive(Debug, Clone, Serialize)]
pub struct Comparison {

    pub overlap : Option<OverlapEstimate>,

    /// Confidence ellipses of the first and second hypervolume.
    pub contours : Option<(Contour, Contour)>

}

/// Runs whatever the configuration asks for: the overlap estimate, the projected
/// confidence ellipses, or both. Dimension names are checked first in every case.
/// Univariate hypervolumes have no ellipses.
pub fn compare(
    first : &HypervolumeDescriptor,
    second : &HypervolumeDescriptor,
    config : &OverlapConfig,
    progress : &dyn Progress,
    cancel : &CancelToken
) -> Result<Comparison, OverlapError> {
    check_dimensions(first, second)?;
    config.validate()?;
    let contours = if config.plot && first.dim() < 2 {
        warn!(dim = first.dim(), "ellipses need at least two dimensions, skipping them");
        None
    } else if config.plot {
        Some((
            Contour::new(first.normal(), config.dims, config.level)?,
            Contour::new(second.normal(), config.dims, config.level)?
        ))
    } else {
        None
    };
    let overlap = if config.overlap {
        Some(estimate_overlap(first, second, config, progress, cancel)?)
    } else {
        None
    };
    Ok(Comparison { overlap, contours })
}

#[cfg(test)]
use nalgebra::*;

#[cfg(test)]
fn isotropic(label : &str, center : f64, var : f64, volume : f64) -> HypervolumeDescriptor {
    HypervolumeDescriptor::new(
        label.into(),
        vec!["x".into(), "y".into()],
        DVector::from_element(2, center),
        DMatrix::from_diagonal_element(2, 2, var),
        volume
    ).unwrap()
}

#[test]
fn config_defaults_and_validation() {
    let config : OverlapConfig = serde_json::from_str(r#"{ "ndraws" : 20, "seed" : 3 }"#).unwrap();
    assert_eq!(config.ndraws, 20);
    assert_eq!(config.seed, Some(3));
    assert_eq!(config.proppoints, 1.0);
    assert_eq!(config.dims, (0, 1));
    assert!(config.overlap && config.plot);
    assert!(config.validate().is_ok());

    let bad = OverlapConfig { proppoints : 0.0, ..OverlapConfig::default() };
    assert!(matches!(bad.validate(), Err(OverlapError::InvalidConfig(_))));
    let bad = OverlapConfig { ndraws : 0, ..OverlapConfig::default() };
    assert!(matches!(bad.validate(), Err(OverlapError::InvalidConfig(_))));
    let bad = OverlapConfig { dims : (1, 1), ..OverlapConfig::default() };
    assert!(matches!(bad.validate(), Err(OverlapError::InvalidConfig(_))));
    let unplotted = OverlapConfig { dims : (1, 1), plot : false, ..OverlapConfig::default() };
    assert!(unplotted.validate().is_ok());
}

#[test]
fn seeded_estimate_is_repeatable() {
    let a = isotropic("a", 0.0, 1.0, 60.0);
    let b = isotropic("b", 1.0, 1.0, 40.0);
    let config = OverlapConfig { ndraws : 30, seed : Some(5), ..OverlapConfig::default() };
    let e1 = estimate_overlap(&a, &b, &config, &(), &CancelToken::new()).unwrap();
    let config = OverlapConfig { threads : 2, ..config };
    let e2 = estimate_overlap(&a, &b, &config, &(), &CancelToken::new()).unwrap();
    assert_eq!(e1, e2);
    assert_eq!(e1.points_first, 60);
    assert_eq!(e1.points_second, 40);
    assert_eq!(e1.volume_sum, 100.0);
    assert_eq!(e1.value, (e1.included_in_first + e1.included_in_second) as f64 / 100.0);
}

#[test]
fn progress_reports_every_evaluation() {
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counter {
        total : AtomicUsize,
        done : AtomicUsize,
        finished : AtomicUsize
    }

    impl Progress for Counter {

        fn start(&self, _direction : Direction, total : usize) {
            self.total.fetch_add(total, Ordering::SeqCst);
        }

        fn advance(&self, _direction : Direction, n : usize) {
            self.done.fetch_add(n, Ordering::SeqCst);
        }

        fn finish(&self, _direction : Direction) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }

    }

    let a = isotropic("a", 0.0, 1.0, 25.0);
    let b = isotropic("b", 0.5, 1.0, 35.0);
    let config = OverlapConfig { ndraws : 20, seed : Some(8), ..OverlapConfig::default() };
    let counter = Counter::default();
    estimate_overlap(&a, &b, &config, &counter, &CancelToken::new()).unwrap();
    assert_eq!(counter.total.load(Ordering::SeqCst), 2 * (25 + 35));
    assert_eq!(counter.done.load(Ordering::SeqCst), 2 * (25 + 35));
    assert_eq!(counter.finished.load(Ordering::SeqCst), 2);
}

#[test]
fn cancelled_estimate() {
    let a = isotropic("a", 0.0, 1.0, 30.0);
    let cancel = CancelToken::new();
    let clone = cancel.clone();
    clone.cancel();
    let config = OverlapConfig { ndraws : 20, seed : Some(1), ..OverlapConfig::default() };
    let err = estimate_overlap(&a, &a, &config, &(), &cancel).unwrap_err();
    assert!(matches!(err, OverlapError::Cancelled));
}

#[test]
fn compare_follows_switches() {
    let a = isotropic("a", 0.0, 1.0, 30.0);
    let b = isotropic("b", 0.0, 2.0, 30.0);
    let only_plot = OverlapConfig { overlap : false, seed : Some(2), ..OverlapConfig::default() };
    let cmp = compare(&a, &b, &only_plot, &(), &CancelToken::new()).unwrap();
    assert!(cmp.overlap.is_none());
    let (ca, cb) = cmp.contours.unwrap();
    assert!(cb.axes.0 > ca.axes.0);

    let only_overlap = OverlapConfig { plot : false, ndraws : 20, seed : Some(2), ..OverlapConfig::default() };
    let cmp = compare(&a, &b, &only_overlap, &(), &CancelToken::new()).unwrap();
    assert!(cmp.overlap.is_some());
    assert!(cmp.contours.is_none());

    let out_of_range = OverlapConfig { overlap : false, dims : (0, 5), ..OverlapConfig::default() };
    let err = compare(&a, &b, &out_of_range, &(), &CancelToken::new()).unwrap_err();
    assert!(matches!(err, OverlapError::Region(RegionError::DimOutOfRange(5, 2))));
}

#[test]
fn univariate_comparison_skips_ellipses() {
    let line = |label : &str, center : f64| HypervolumeDescriptor::new(
        label.into(),
        vec!["x".into()],
        DVector::from_element(1, center),
        DMatrix::from_element(1, 1, 1.0),
        40.0
    ).unwrap();
    let config = OverlapConfig { ndraws : 20, seed : Some(6), ..OverlapConfig::default() };
    assert!(config.plot);
    let cmp = compare(&line("a", 0.0), &line("b", 0.5), &config, &(), &CancelToken::new()).unwrap();
    assert!(cmp.contours.is_none());
    assert!(cmp.overlap.unwrap().value > 0.0);
}
