use nalgebra::*;
use serde::{Serialize, Deserialize};
use std::fmt::{self, Display};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use crate::prob::MultiNormal;
use crate::overlap::OverlapError;

/// Location of a fitted hypervolume, as stored by the model. Deserialized untagged:
/// a flat JSON array is a single mean, a triply-nested array is a group stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MeanSpec {

    /// One location per dimension.
    Single(Vec<f64>),

    /// One matrix per group, each with one row per observation (or posterior draw)
    /// and one column per dimension.
    Stacked(Vec<Vec<Vec<f64>>>)

}

/// Hypervolume as produced by the (external) model-fitting step. Observations (`Y`) and
/// any other field the fitting step writes are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypervolumeModel {

    #[serde(default)]
    pub name : Option<String>,

    pub dimensions : Vec<String>,

    #[serde(alias = "group_means")]
    pub mean : MeanSpec,

    pub covariance : Vec<Vec<f64>>,

    pub volume : f64

}

impl HypervolumeModel {

    pub fn load_from_path<P : AsRef<Path>>(path : P) -> Result<Self, OverlapError> {
        let f = File::open(path.as_ref())?;
        let model : Self = serde_json::from_reader(BufReader::new(f))?;
        Ok(model)
    }

    pub fn from_json(src : &str) -> Result<Self, OverlapError> {
        Ok(serde_json::from_str(src)?)
    }

    /// Flattens this model into a descriptor. Group stacks are collapsed into a single
    /// pooled mean by averaging every row of every group, which discards between-group
    /// separation. The label is the model name, or the fallback when the model has none.
    pub fn descriptor(&self, fallback_label : &str) -> Result<HypervolumeDescriptor, OverlapError> {
        let label = self.name.clone().unwrap_or_else(|| fallback_label.to_string() );
        let invalid = |reason : String| OverlapError::InvalidDescriptor { label : label.clone(), reason };
        let p = self.dimensions.len();
        let mean = match &self.mean {
            MeanSpec::Single(mu) => {
                if mu.len() != p {
                    return Err(invalid(format!("mean has {} entries for {} dimensions", mu.len(), p)));
                }
                DVector::from_column_slice(mu)
            },
            MeanSpec::Stacked(groups) => pooled_mean(groups, p).map_err(invalid)?
        };
        if self.covariance.len() != p || self.covariance.iter().any(|row| row.len() != p ) {
            return Err(invalid(format!("covariance is not a {}x{} matrix", p, p)));
        }
        let cov = DMatrix::from_fn(p, p, |i, j| self.covariance[i][j] );
        HypervolumeDescriptor::new(label.clone(), self.dimensions.clone(), mean, cov, self.volume)
    }

}

/// Column-wise average over all rows of all groups.
fn pooled_mean(groups : &[Vec<Vec<f64>>], p : usize) -> Result<DVector<f64>, String> {
    let mut sum = DVector::zeros(p);
    let mut n = 0;
    for (g, group) in groups.iter().enumerate() {
        for row in group.iter() {
            if row.len() != p {
                return Err(format!("group {} has a row with {} entries for {} dimensions", g, row.len(), p));
            }
            for (s, v) in sum.iter_mut().zip(row.iter()) {
                *s += v;
            }
            n += 1;
        }
    }
    if n == 0 {
        return Err(String::from("group mean stack is empty"));
    }
    Ok(sum / n as f64)
}

/// Flat summary of one hypervolume: a normal approximation over named dimensions and an
/// externally computed volume. Fields are private so the covariance can't change after
/// extraction.
#[derive(Debug, Clone)]
pub struct HypervolumeDescriptor {

    label : String,

    names : Vec<String>,

    normal : MultiNormal,

    volume : f64

}

impl HypervolumeDescriptor {

    pub fn new(
        label : String,
        names : Vec<String>,
        mean : DVector<f64>,
        cov : DMatrix<f64>,
        volume : f64
    ) -> Result<Self, OverlapError> {
        let invalid = |reason : String| OverlapError::InvalidDescriptor { label : label.clone(), reason };
        if names.is_empty() {
            return Err(invalid(String::from("no dimensions")));
        }
        if let Some(dup) = names.iter().enumerate().find(|(i, n)| names[..*i].contains(*n) ) {
            return Err(invalid(format!("dimension '{}' repeated", dup.1)));
        }
        if mean.nrows() != names.len() {
            return Err(invalid(format!("mean has {} entries for {} dimensions", mean.nrows(), names.len())));
        }
        if !(volume.is_finite() && volume > 0.0) {
            return Err(invalid(format!("volume must be positive and finite (got {})", volume)));
        }
        let normal = MultiNormal::new(mean, cov).map_err(|e| invalid(e.to_string()) )?;
        Ok(Self { label, names, normal, volume })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn dimension_names(&self) -> &[String] {
        &self.names
    }

    pub fn dim(&self) -> usize {
        self.names.len()
    }

    pub fn mean(&self) -> &DVector<f64> {
        self.normal.mean()
    }

    pub fn cov(&self) -> &DMatrix<f64> {
        self.normal.cov()
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    pub fn normal(&self) -> &MultiNormal {
        &self.normal
    }

}

impl Display for HypervolumeDescriptor {

    fn fmt(&self, f : &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] (volume = {})", self.label, self.names.join(", "), self.volume)
    }

}

/// Both descriptors must name the same dimensions in the same order.
pub fn check_dimensions(a : &HypervolumeDescriptor, b : &HypervolumeDescriptor) -> Result<(), OverlapError> {
    if a.names != b.names {
        return Err(OverlapError::DimensionMismatch { left : a.names.clone(), right : b.names.clone() });
    }
    Ok(())
}

#[cfg(test)]
const SINGLE : &'static str = r#"{
    "name" : "forest",
    "dimensions" : ["x", "y"],
    "mean" : [1.0, 2.0],
    "covariance" : [[1.0, 0.2], [0.2, 2.0]],
    "volume" : 25.0,
    "Y" : [[0.5, 1.5], [1.5, 2.5]]
}"#;

#[test]
fn single_mean_descriptor() {
    let model = HypervolumeModel::from_json(SINGLE).unwrap();
    let d = model.descriptor("hv1").unwrap();
    assert_eq!(d.label(), "forest");
    assert_eq!(d.dimension_names(), &["x".to_string(), "y".to_string()][..]);
    assert_eq!(d.mean(), &DVector::from_column_slice(&[1.0, 2.0]));
    assert_eq!(d.cov()[(1, 0)], 0.2);
    assert_eq!(d.volume(), 25.0);
}

#[test]
fn group_means_are_pooled() {
    let src = r#"{
        "dimensions" : ["x", "y"],
        "group_means" : [
            [[0.0, 0.0], [2.0, 2.0]],
            [[4.0, 10.0]]
        ],
        "covariance" : [[1.0, 0.0], [0.0, 1.0]],
        "volume" : 3.0
    }"#;
    let model = HypervolumeModel::from_json(src).unwrap();
    assert!(matches!(model.mean, MeanSpec::Stacked(_)));
    let d = model.descriptor("hv2").unwrap();
    assert_eq!(d.label(), "hv2");
    assert_eq!(d.mean(), &DVector::from_column_slice(&[2.0, 4.0]));
}

#[test]
fn malformed_models_rejected() {
    let mut model = HypervolumeModel::from_json(SINGLE).unwrap();
    model.volume = 0.0;
    assert!(matches!(model.descriptor("a"), Err(OverlapError::InvalidDescriptor { .. })));
    model.volume = 1.0;
    model.covariance = vec![vec![1.0, 0.0]];
    assert!(matches!(model.descriptor("a"), Err(OverlapError::InvalidDescriptor { .. })));
    model.covariance = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
    model.mean = MeanSpec::Stacked(vec![vec![vec![1.0, 2.0, 3.0]]]);
    assert!(matches!(model.descriptor("a"), Err(OverlapError::InvalidDescriptor { .. })));
    model.mean = MeanSpec::Single(vec![0.0, 0.0]);
    model.dimensions = vec!["x".into(), "x".into()];
    assert!(matches!(model.descriptor("a"), Err(OverlapError::InvalidDescriptor { .. })));
}

#[test]
fn dimension_order_matters() {
    let cov = DMatrix::identity(2, 2);
    let xy = HypervolumeDescriptor::new("a".into(), vec!["x".into(), "y".into()], DVector::zeros(2), cov.clone(), 1.0).unwrap();
    let yx = HypervolumeDescriptor::new("b".into(), vec!["y".into(), "x".into()], DVector::zeros(2), cov, 1.0).unwrap();
    assert!(check_dimensions(&xy, &xy).is_ok());
    assert!(matches!(check_dimensions(&xy, &yx), Err(OverlapError::DimensionMismatch { .. })));
}
