use nalgebra::{Matrix2, Point2, Vector2, Vector3};
use tipcal::synthetic::{MemoryAxes, NoSettle, ScriptedMatcher, SimConfig, SimRig, StaticCamera};
use tipcal::{
    Anchor, CalibError, Calibrator, FocusConfig, FocusSearcher, PlatformCalibration, Progress,
    RecalConfig, RecalProgress, Recalibration, Rig, SettleConfig, Template, TemplateConfig,
    TemplateSeries, TrackingContext, VisionMatcher, ZnccMatcher,
};

fn calibrated(sim: &mut SimRig) -> Calibrator {
    let mut calibrator = Calibrator::default();
    calibrator.begin_calibration();
    for _ in 0..100 {
        if calibrator.tick(&mut sim.rig()).unwrap() == Progress::Calibrated {
            return calibrator;
        }
    }
    panic!("calibration did not finish");
}

#[test]
fn refocus_repeats_until_score_is_trusted() {
    let mut arm = MemoryAxes::default();
    let mut stage = MemoryAxes::default();
    let mut camera = StaticCamera::default();
    // Zone check, then three single-sample refocus searches.
    let mut matcher =
        ScriptedMatcher::new([0.5, 0.9, 0.95, 0.99], 0.0).at(Point2::new(110.0, 95.0));
    let mut settle = NoSettle;

    let template = Template::new((0u8..16).collect(), 4, 4).unwrap();
    let platform = PlatformCalibration {
        alpha: Matrix2::identity(),
        um_px: 2.0,
    };
    let anchor = Anchor {
        arm: Vector3::zeros(),
        stage: Vector3::zeros(),
        pixel: Point2::new(100.0, 100.0),
    };
    let focus = FocusSearcher::new(FocusConfig {
        samples: 1,
        ..FocusConfig::default()
    });
    let settle_cfg = SettleConfig::default();
    let ctx = TrackingContext {
        template: &template,
        platform: &platform,
        anchor: &anchor,
        focus: &focus,
        settle: &settle_cfg,
    };

    let progress = {
        let mut rig = Rig {
            arm: &mut arm,
            stage: &mut stage,
            camera: &mut camera,
            matcher: &mut matcher,
            settle: &mut settle,
        };
        let (mut recal, _) =
            Recalibration::trigger(&mut rig, RecalConfig::default(), &ctx).unwrap();
        recal.resume(&mut rig, &ctx).unwrap();
        recal.tick(&mut rig, &ctx).unwrap()
    };

    assert_eq!(matcher.calls(), 4);
    let RecalProgress::Done { correction, anchor } = progress else {
        panic!("expected the swap to finish, got {progress:?}");
    };
    assert!((correction - Vector2::new(-20.0, 10.0)).norm() < 1e-12);
    assert_eq!(anchor.arm, Vector3::new(-1900.0, 0.0, 0.0));
    assert_eq!(anchor.stage, Vector3::new(-20.0, 10.0, 0.0));
    assert_eq!(anchor.pixel, Point2::new(100.0, 100.0));
    // Retract and advance on axis 0, then one approach step.
    assert_eq!(
        &arm.commands[..3],
        &[(0, -5000.0, false), (0, 3000.0, false), (0, 100.0, false)]
    );
}

#[test]
fn refocus_gives_up_after_attempt_limit() {
    let mut arm = MemoryAxes::default();
    let mut stage = MemoryAxes::default();
    let mut camera = StaticCamera::default();
    let mut matcher = ScriptedMatcher::new([0.5], 0.9);
    let mut settle = NoSettle;

    let template = Template::new((0u8..16).collect(), 4, 4).unwrap();
    let platform = PlatformCalibration {
        alpha: Matrix2::identity(),
        um_px: 1.0,
    };
    let anchor = Anchor {
        arm: Vector3::zeros(),
        stage: Vector3::zeros(),
        pixel: Point2::origin(),
    };
    let focus = FocusSearcher::new(FocusConfig {
        samples: 1,
        ..FocusConfig::default()
    });
    let settle_cfg = SettleConfig::default();
    let ctx = TrackingContext {
        template: &template,
        platform: &platform,
        anchor: &anchor,
        focus: &focus,
        settle: &settle_cfg,
    };
    let cfg = RecalConfig {
        max_refocus_attempts: 3,
        ..RecalConfig::default()
    };

    let mut rig = Rig {
        arm: &mut arm,
        stage: &mut stage,
        camera: &mut camera,
        matcher: &mut matcher,
        settle: &mut settle,
    };
    let (mut recal, _) = Recalibration::trigger(&mut rig, cfg, &ctx).unwrap();
    recal.resume(&mut rig, &ctx).unwrap();
    let err = recal.tick(&mut rig, &ctx).err().unwrap();
    assert_eq!(
        err,
        CalibError::FocusNotConverged {
            threshold: 0.98,
            attempts: 3
        }
    );
}

#[test]
fn recalibration_requires_calibration() {
    let mut sim = SimRig::new(SimConfig::default());
    let mut calibrator = Calibrator::default();
    let err = calibrator.trigger_recalibration(&mut sim.rig()).err();
    assert_eq!(err, Some(CalibError::NotCalibrated));
    assert!(sim.world().arm_targets.is_empty());
    assert_eq!(sim.world().arm, Vector3::zeros());
}

#[test]
fn pipette_swap_reanchors_on_new_tip() {
    let mut sim = SimRig::new(SimConfig::default());
    let mut calibrator = calibrated(&mut sim);
    let before = calibrator.status();

    calibrator.trigger_recalibration(&mut sim.rig()).unwrap();
    assert!(calibrator.status().recalibrating);
    sim.world_mut().tip_offset = Vector3::new(30.0, -20.0, 2.0);
    calibrator.confirm_swap(&mut sim.rig()).unwrap();
    assert!((sim.world().arm.x + 2000.0).abs() < 1e-9);

    let mut approaching = 0;
    let finished = (0..60).any(|_| match calibrator.tick(&mut sim.rig()).unwrap() {
        Progress::Recalibrating { .. } => {
            approaching += 1;
            false
        }
        Progress::Recalibrated => true,
        other => panic!("unexpected progress {other:?}"),
    });
    assert!(finished);
    // The tip enters the search window at arm x = -100.
    assert_eq!(approaching, 18);

    let after = calibrator.status();
    assert!(!after.recalibrating);
    assert!(after.calibrated);
    assert_eq!(after.matrix, before.matrix);
    let anchor = after.anchor.unwrap();
    assert!((anchor.arm - Vector3::new(-100.0, 0.0, 0.0)).norm() < 1e-6);
    assert!((anchor.stage - Vector3::new(-70.0, -20.0, 2.0)).norm() < 1e-6);

    let world = sim.world();
    assert!((world.tip_pixel() - Point2::new(160.0, 120.0)).norm() < 1e-6);
    assert!(world.defocus().abs() < 1e-9);
}

#[test]
fn tip_never_seen_aborts_recalibration() {
    let mut sim = SimRig::new(SimConfig::default());
    let mut calibrator = calibrated(&mut sim);
    sim.world_mut().blind = true;
    calibrator.trigger_recalibration(&mut sim.rig()).unwrap();
    calibrator.confirm_swap(&mut sim.rig()).unwrap();

    let err = (0..100)
        .find_map(|_| calibrator.tick(&mut sim.rig()).err())
        .unwrap();
    assert_eq!(err, CalibError::TrackingLost);
    let status = calibrator.status();
    assert!(!status.recalibrating);
    assert!(status.calibrated);
}

#[test]
fn arm_waits_at_retract_until_swap_is_confirmed() {
    let mut sim = SimRig::new(SimConfig::default());
    let mut calibrator = calibrated(&mut sim);
    assert_eq!(
        calibrator.confirm_swap(&mut sim.rig()).err(),
        Some(CalibError::InvalidInput("no pipette swap in progress"))
    );

    let inspection = calibrator.trigger_recalibration(&mut sim.rig()).unwrap();
    assert_eq!((inspection.width(), inspection.height()), (320, 240));
    assert!((sim.world().arm.x + 5000.0).abs() < 1e-9);
    assert!(calibrator.status().awaiting_swap);

    let targets = sim.world().arm_targets.len();
    for _ in 0..5 {
        assert_eq!(
            calibrator.tick(&mut sim.rig()).unwrap(),
            Progress::AwaitingSwap
        );
    }
    assert!((sim.world().arm.x + 5000.0).abs() < 1e-9);
    assert_eq!(sim.world().arm_targets.len(), targets);

    calibrator.confirm_swap(&mut sim.rig()).unwrap();
    assert!(!calibrator.status().awaiting_swap);
    assert!((sim.world().arm.x + 2000.0).abs() < 1e-9);
    assert_eq!(
        calibrator.confirm_swap(&mut sim.rig()).err(),
        Some(CalibError::InvalidInput("pipette swap already confirmed"))
    );
    assert!(calibrator.status().recalibrating);
    assert_eq!(
        calibrator.tick(&mut sim.rig()).unwrap(),
        Progress::Recalibrating { steps: 1 }
    );
}

#[test]
fn zncc_matcher_drives_swap_with_default_config() {
    let mut sim = SimRig::new(SimConfig {
        frame_size: (160, 120),
        image_centre: Point2::new(80.0, 60.0),
        ..SimConfig::default()
    });
    let mut matcher = ZnccMatcher::new();
    let settle = SettleConfig::default();
    let focus = FocusSearcher::default();

    let (templates, tip) = {
        let mut rig = sim.rig_with_matcher(&mut matcher);
        let templates =
            TemplateSeries::capture(&mut rig, &TemplateConfig::default(), settle.after_move)
                .unwrap();
        let frame = rig.camera.frame().unwrap();
        let tip = rig.matcher.locate(frame.view(), templates.central()).unwrap();
        (templates, tip)
    };
    assert!(tip.found);
    assert_eq!(tip.location, Point2::new(80.0, 60.0));

    let platform = PlatformCalibration {
        alpha: -Matrix2::identity(),
        um_px: 2.0,
    };
    let anchor = Anchor {
        arm: Vector3::zeros(),
        stage: Vector3::zeros(),
        pixel: tip.location,
    };
    let ctx = TrackingContext {
        template: templates.central(),
        platform: &platform,
        anchor: &anchor,
        focus: &focus,
        settle: &settle,
    };

    let mut rig = sim.rig_with_matcher(&mut matcher);
    let (mut recal, inspection) =
        Recalibration::trigger(&mut rig, RecalConfig::default(), &ctx).unwrap();
    drop(rig);
    // Retracted far out of view: nothing but background.
    let first = inspection.data()[0];
    assert!(inspection.data().iter().all(|&v| v == first));

    sim.world_mut().tip_offset = Vector3::new(30.0, -20.0, 0.0);
    let mut rig = sim.rig_with_matcher(&mut matcher);
    recal.resume(&mut rig, &ctx).unwrap();

    let done = (0..40)
        .find_map(|_| match recal.tick(&mut rig, &ctx).unwrap() {
            RecalProgress::Done { correction, anchor } => Some((correction, anchor)),
            _ => None,
        })
        .unwrap();
    drop(rig);

    let (correction, new_anchor) = done;
    assert!((correction - Vector2::new(30.0, -20.0)).norm() < 1e-9);
    assert_eq!(new_anchor.pixel, Point2::new(80.0, 60.0));
    assert!((sim.world().tip_pixel() - Point2::new(80.0, 60.0)).norm() < 1e-9);
}
