use nalgebra::*;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use hvoverlap::*;
use hvoverlap::overlap::*;
use hvoverlap::prob::{IntegrationError, OrthantSettings};

fn hypervolume(label : &str, names : &[&str], center : f64, var : f64, volume : f64) -> HypervolumeDescriptor {
    let p = names.len();
    HypervolumeDescriptor::new(
        label.into(),
        names.iter().map(|n| n.to_string() ).collect(),
        DVector::from_element(p, center),
        DMatrix::from_diagonal_element(p, p, var),
        volume
    ).unwrap()
}

fn seeded(ndraws : usize, seed : u64) -> OverlapConfig {
    OverlapConfig { ndraws, seed : Some(seed), ..OverlapConfig::default() }
}

#[test]
fn overlap_is_symmetric_up_to_sampling_noise() {
    let a = hypervolume("a", &["x", "y"], 0.0, 1.0, 150.0);
    let b = hypervolume("b", &["x", "y"], 1.0, 1.0, 150.0);
    let config = seeded(50, 21);
    let ab = estimate_overlap(&a, &b, &config, &(), &CancelToken::new()).unwrap();
    let ba = estimate_overlap(&b, &a, &config, &(), &CancelToken::new()).unwrap();
    assert!(ab.value >= 0.0 && ba.value >= 0.0);
    assert!(ab.value > 0.0);
    assert!((ab.value - ba.value).abs() < 0.15, "{} vs. {}", ab.value, ba.value);
}

#[test]
fn identical_hypervolumes_mostly_overlap() {
    let a = hypervolume("a", &["x", "y"], 0.0, 1.0, 150.0);
    let est = estimate_overlap(&a, &a.clone(), &seeded(50, 4), &(), &CancelToken::new()).unwrap();
    let included = (est.included_in_first + est.included_in_second) as f64;
    let sampled = (est.points_first + est.points_second) as f64;
    assert!(est.value * est.volume_sum >= 0.8 * sampled, "{} of {} included", included, sampled);
}

#[test]
fn distant_hypervolumes_do_not_overlap() {
    let a = hypervolume("a", &["x", "y"], 0.0, 0.01, 100.0);
    let b = hypervolume("b", &["x", "y"], 10.0, 0.01, 100.0);
    let est = estimate_overlap(&a, &b, &seeded(50, 9), &(), &CancelToken::new()).unwrap();
    assert_eq!(est.included_in_first, 0);
    assert_eq!(est.included_in_second, 0);
    assert_eq!(est.value, 0.0);
}

#[test]
fn dimension_order_mismatch() {
    let a = hypervolume("a", &["x", "y"], 0.0, 1.0, 100.0);
    let b = hypervolume("b", &["y", "x"], 0.0, 1.0, 100.0);
    let err = estimate_overlap(&a, &b, &seeded(20, 1), &(), &CancelToken::new()).unwrap_err();
    match err {
        OverlapError::DimensionMismatch { left, right } => {
            assert_eq!(left, vec!["x".to_string(), "y".to_string()]);
            assert_eq!(right, vec!["y".to_string(), "x".to_string()]);
        },
        other => panic!("Unexpected error: {}", other)
    }
    let c = hypervolume("c", &["x", "y", "z"], 0.0, 1.0, 100.0);
    assert!(matches!(
        compare(&a, &c, &seeded(20, 1), &(), &CancelToken::new()),
        Err(OverlapError::DimensionMismatch { .. })
    ));
}

#[test]
fn too_few_points_for_ndraws() {
    let small = hypervolume("small", &["x", "y"], 0.0, 1.0, 10.0);
    let large = hypervolume("large", &["x", "y"], 0.0, 1.0, 100.0);
    let config = OverlapConfig { proppoints : 0.5, ..seeded(10, 2) };
    let err = estimate_overlap(&large, &small, &config, &(), &CancelToken::new()).unwrap_err();
    match &err {
        OverlapError::InsufficientSample { label, drawn, ndraws } => {
            assert_eq!(label, "small");
            assert_eq!(*drawn, 5);
            assert_eq!(*ndraws, 10);
        },
        other => panic!("Unexpected error: {}", other)
    }
    let msg = err.to_string();
    assert!(msg.contains("increase proppoints") && msg.contains("decrease ndraws"));
}

#[test]
fn mean_point_scores_above_threshold() {
    let target = hypervolume("target", &["x", "y", "z"], 2.0, 0.5, 120.0);
    let tester = InclusionTester::new(&target, OrthantSettings::default()).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(33);
    let null_sample = sample(&target, 1.0, &mut rng);
    let score = tester.score(target.mean(), &null_sample, 100, &mut rng).unwrap();
    assert!(score > INCLUSION_THRESHOLD, "score = {}", score);
}

#[test]
fn seeded_sampler_is_idempotent() {
    let d = hypervolume("d", &["x", "y"], 1.0, 2.0, 80.0);
    let first = sample(&d, 0.5, &mut ChaCha8Rng::seed_from_u64(100));
    let second = sample(&d, 0.5, &mut ChaCha8Rng::seed_from_u64(100));
    assert_eq!(first.len(), 40);
    assert_eq!(first, second);
}

#[test]
fn json_models_end_to_end() {
    let first = HypervolumeModel::from_json(r#"{
        "dimensions" : ["length", "width"],
        "mean" : [0.0, 0.0],
        "covariance" : [[1.0, 0.3], [0.3, 1.0]],
        "volume" : 60.0
    }"#).unwrap().descriptor("hv1").unwrap();
    let second = HypervolumeModel::from_json(r#"{
        "dimensions" : ["length", "width"],
        "group_means" : [[[0.0, 0.5]], [[1.0, 0.5]]],
        "covariance" : [[1.0, 0.0], [0.0, 1.0]],
        "volume" : 60.0
    }"#).unwrap().descriptor("hv2").unwrap();
    assert_eq!(second.mean(), &DVector::from_column_slice(&[0.5, 0.5]));
    let cmp = compare(&first, &second, &seeded(30, 12), &(), &CancelToken::new()).unwrap();
    let est = cmp.overlap.unwrap();
    assert!(est.value > 0.5);
    let (c1, c2) = cmp.contours.unwrap();
    assert_eq!(c1.center, (0.0, 0.0));
    assert_eq!(c2.center, (0.5, 0.5));
}

#[test]
fn twelve_dimensional_hypervolumes_compare() {
    let names : Vec<String> = (0..12).map(|i| format!("trait{}", i) ).collect();
    let equicorrelated = DMatrix::from_fn(12, 12, |i, j| if i == j { 1.0 } else { 0.5 } );
    let a = HypervolumeDescriptor::new("a".into(), names.clone(), DVector::zeros(12), equicorrelated.clone(), 30.0).unwrap();
    let b = HypervolumeDescriptor::new("b".into(), names, DVector::from_element(12, 0.5), equicorrelated, 30.0).unwrap();
    let est = estimate_overlap(&a, &b, &seeded(20, 1), &(), &CancelToken::new()).unwrap();
    assert_eq!(est.points_first + est.points_second, 60);
    assert!(est.value > 0.0);
}

#[test]
fn singular_target_fails_instead_of_excluding() {
    let a = hypervolume("a", &["x", "y"], 0.0, 1.0, 40.0);
    let b = HypervolumeDescriptor::new(
        "b".into(),
        vec!["x".into(), "y".into()],
        DVector::zeros(2),
        DMatrix::from_element(2, 2, 1.0),
        40.0
    ).unwrap();
    let err = estimate_overlap(&a, &b, &seeded(20, 3), &(), &CancelToken::new()).unwrap_err();
    match err {
        OverlapError::Integration { label, source } => {
            assert_eq!(label, "b");
            assert_eq!(source, IntegrationError::NotPositiveDefinite);
        },
        other => panic!("Unexpected error: {}", other)
    }
}
