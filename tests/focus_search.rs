use std::time::Duration;

use nalgebra::{Point2, Vector3};
use tipcal::synthetic::{MemoryAxes, NoSettle, ScriptedMatcher, StaticCamera};
use tipcal::{
    CalibError, FocusConfig, FocusSearcher, Rig, SweepDirection, Template, TemplateConfig,
    TemplateSeries,
};

struct Bench {
    arm: MemoryAxes,
    stage: MemoryAxes,
    camera: StaticCamera,
    matcher: ScriptedMatcher,
    settle: NoSettle,
}

impl Bench {
    fn new(matcher: ScriptedMatcher) -> Self {
        Self {
            arm: MemoryAxes::default(),
            stage: MemoryAxes::at(Vector3::new(0.0, 0.0, 50.0)),
            camera: StaticCamera::default(),
            matcher,
            settle: NoSettle,
        }
    }

    fn rig(&mut self) -> Rig<'_> {
        Rig {
            arm: &mut self.arm,
            stage: &mut self.stage,
            camera: &mut self.camera,
            matcher: &mut self.matcher,
            settle: &mut self.settle,
        }
    }
}

fn template() -> Template {
    Template::new((0u8..16).collect(), 4, 4).unwrap()
}

#[test]
fn early_exit_stops_after_first_sharp_sample() {
    let mut bench = Bench::new(ScriptedMatcher::new([0.97], 0.1).at(Point2::new(12.0, 7.0)));
    let searcher = FocusSearcher::default();

    let outcome = searcher
        .search(&mut bench.rig(), &template(), SweepDirection::Forward)
        .unwrap();
    assert_eq!(outcome.samples, 1);
    assert_eq!(bench.matcher.calls(), 1);
    assert!((outcome.score - 0.97).abs() < 1e-12);
    assert!((outcome.height_offset + 4.0).abs() < 1e-12);
    assert_eq!(outcome.location, Point2::new(12.0, 7.0));
    assert!((bench.stage.position.z - 46.0).abs() < 1e-12);
}

#[test]
fn full_sweep_keeps_best_sample() {
    let scores = [0.1, 0.2, 0.5, 0.9, 0.4, 0.3, 0.2, 0.1, 0.05];
    let mut bench = Bench::new(ScriptedMatcher::new(scores, 0.0));
    let searcher = FocusSearcher::default();

    let outcome = searcher
        .search(&mut bench.rig(), &template(), SweepDirection::Forward)
        .unwrap();
    assert_eq!(outcome.samples, 9);
    assert_eq!(bench.matcher.calls(), 9);
    assert!((outcome.score - 0.9).abs() < 1e-12);
    assert!((outcome.height_offset + 1.0).abs() < 1e-12);
    assert!((bench.stage.position.z - 49.0).abs() < 1e-12);
}

#[test]
fn backward_sweep_visits_highest_first() {
    let scores = [0.1, 0.2, 0.5, 0.9, 0.4, 0.3, 0.2, 0.1, 0.05];
    let mut bench = Bench::new(ScriptedMatcher::new(scores, 0.0));
    let searcher = FocusSearcher::default();

    let outcome = searcher
        .search(&mut bench.rig(), &template(), SweepDirection::Backward)
        .unwrap();
    assert!((outcome.height_offset - 1.0).abs() < 1e-12);
    assert!((bench.stage.position.z - 51.0).abs() < 1e-12);
    let first_z = bench.stage.commands[0];
    assert_eq!(first_z, (2, 54.0, true));
}

#[test]
fn ties_keep_the_first_sample() {
    let mut bench = Bench::new(ScriptedMatcher::new(std::iter::empty(), 0.5));
    let outcome = FocusSearcher::default()
        .search(&mut bench.rig(), &template(), SweepDirection::Forward)
        .unwrap();
    assert!((outcome.height_offset + 4.0).abs() < 1e-12);
}

#[test]
fn unmatched_sweep_is_tracking_lost() {
    let mut bench = Bench::new(ScriptedMatcher::new(std::iter::empty(), 0.0));
    let err = FocusSearcher::default()
        .search(&mut bench.rig(), &template(), SweepDirection::Forward)
        .err()
        .unwrap();
    assert_eq!(err, CalibError::TrackingLost);
    assert_eq!(bench.matcher.calls(), 9);
}

#[test]
fn single_match_in_sweep_is_not_lost() {
    let scores = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.2];
    let mut bench = Bench::new(ScriptedMatcher::new(scores, 0.0));
    let outcome = FocusSearcher::default()
        .search(&mut bench.rig(), &template(), SweepDirection::Forward)
        .unwrap();
    assert!((outcome.height_offset - 4.0).abs() < 1e-12);
}

#[test]
fn early_exit_threshold_is_strict() {
    let cfg = FocusConfig {
        early_exit_score: 0.5,
        ..FocusConfig::default()
    };
    let mut bench = Bench::new(ScriptedMatcher::new([0.5, 0.6], 0.0));
    let outcome = FocusSearcher::new(cfg)
        .search(&mut bench.rig(), &template(), SweepDirection::Forward)
        .unwrap();
    assert_eq!(outcome.samples, 2);
}

#[test]
fn device_failure_propagates() {
    let mut bench = Bench::new(ScriptedMatcher::new(std::iter::empty(), 0.5));
    bench.stage.fail_after = Some(3);
    let err = FocusSearcher::default()
        .search(&mut bench.rig(), &template(), SweepDirection::Forward)
        .err()
        .unwrap();
    assert!(matches!(err, CalibError::Device { .. }));
    assert_eq!(bench.matcher.calls(), 3);
}

#[test]
fn template_capture_sweeps_and_restores_height() {
    let mut bench = Bench::new(ScriptedMatcher::new(std::iter::empty(), 1.0));
    let cfg = TemplateConfig::default();
    let series = TemplateSeries::capture(&mut bench.rig(), &cfg, Duration::ZERO).unwrap();

    assert_eq!(series.len(), 9);
    assert_eq!(series.central().height_offset(), 0.0);
    assert_eq!(series.central().view().width(), 4);
    assert_eq!(bench.camera.frames, 9);
    // Sweep -4..=4 around z = 50, then back.
    let heights: Vec<f64> = bench.stage.commands.iter().map(|c| c.1).collect();
    assert_eq!(
        heights,
        vec![46.0, 47.0, 48.0, 49.0, 50.0, 51.0, 52.0, 53.0, 54.0, 50.0]
    );
    assert!((bench.stage.position.z - 50.0).abs() < 1e-12);
}

#[test]
fn even_template_count_is_rejected() {
    let err = TemplateSeries::new(vec![template(), template()])
        .err()
        .unwrap();
    assert!(matches!(err, CalibError::InvalidInput(_)));
}
