//! Sequence engine against the mock axis: tick execution, looping, failure,
//! stop and manual control.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{actuator_config, motion_rig};
use tokio::sync::broadcast;
use tokio_test::{assert_err, assert_ok};
use tosca_daq::config::ActuatorConfig;
use tosca_daq::diagnostics::Diagnostic;
use tosca_daq::hardware::mock::{AxisCall, MockAxis};
use tosca_daq::motion::{
    self, Direction, EngineState, MotionEvent, MotionProgram, MotionStep, SequenceEngine, TickOutcome, Unit,
};
use tosca_daq::session::{AccessMode, DeviceRegistry};
use tosca_daq::DaqError;

const TICK: Duration = Duration::from_millis(5);

fn fast_axis() -> Arc<MockAxis> {
    Arc::new(MockAxis::new("AXIS0").with_time_scale(0.0))
}

fn raster() -> MotionProgram {
    MotionProgram::from_steps(vec![
        MotionStep::MoveAbsolute {
            position: 2.0,
            speed: 5.0,
            unit: Unit::Millimeter,
        },
        MotionStep::MoveRelative {
            distance: -500.0,
            speed: 1000.0,
            unit: Unit::Micrometer,
        },
        MotionStep::Home { speed: 2.0 },
    ])
    .expect("valid program")
}

fn long_move() -> MotionProgram {
    MotionProgram::from_steps(vec![MotionStep::MoveAbsolute {
        position: 100.0,
        speed: 1.0,
        unit: Unit::Millimeter,
    }])
    .expect("valid program")
}

fn collect(rx: &mut broadcast::Receiver<MotionEvent>) -> Vec<MotionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn wait_for_step_start(rx: &mut broadcast::Receiver<MotionEvent>) {
    let started = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(MotionEvent::StepStarted { .. }) = rx.recv().await {
                return;
            }
        }
    })
    .await;
    assert!(started.is_ok(), "no step started");
}

#[tokio::test]
async fn test_program_runs_every_pass_in_order() {
    let axis = fast_axis();
    let (engine, _) = motion_rig(Arc::clone(&axis), &actuator_config());
    let mut events = engine.subscribe();

    let cursor = assert_ok!(engine.run(raster(), true, 2));
    assert_eq!(cursor.loop_total, 2);
    assert_eq!(engine.state(), EngineState::Running);

    let outcome = assert_ok!(motion::run_to_completion(&engine, TICK).await);
    assert_eq!(outcome, TickOutcome::Completed);
    assert_eq!(engine.state(), EngineState::Idle);
    assert!(engine.cursor().is_none());

    let started: Vec<(usize, u32)> = collect(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            MotionEvent::StepStarted { index, loop_index } => Some((index, loop_index)),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec![(0, 0), (1, 0), (2, 0), (0, 1), (1, 1), (2, 1)]);

    let pass = vec![
        AxisCall::SetSpeed {
            speed: 5.0,
            unit: Unit::Millimeter,
        },
        AxisCall::MoveAbsolute {
            position: 2.0,
            unit: Unit::Millimeter,
        },
        AxisCall::SetSpeed {
            speed: 1000.0,
            unit: Unit::Micrometer,
        },
        AxisCall::MoveRelative {
            distance: -500.0,
            unit: Unit::Micrometer,
        },
        AxisCall::SetSpeed {
            speed: 2.0,
            unit: Unit::Millimeter,
        },
        AxisCall::Home,
    ];
    assert_eq!(axis.calls(), [pass.clone(), pass].concat());
}

#[tokio::test]
async fn test_program_complete_is_last_event() {
    let (engine, _) = motion_rig(fast_axis(), &actuator_config());
    let mut events = engine.subscribe();
    engine.run(raster(), false, 1).expect("run");
    let outcome = motion::spawn_ticker(Arc::clone(&engine), TICK)
        .await
        .expect("ticker task")
        .expect("ticker");
    assert_eq!(outcome, TickOutcome::Completed);
    assert_eq!(collect(&mut events).last(), Some(&MotionEvent::ProgramComplete));
}

#[tokio::test]
async fn test_loop_disabled_runs_once_whatever_the_count() {
    let axis = fast_axis();
    let (engine, _) = motion_rig(Arc::clone(&axis), &actuator_config());
    let cursor = engine.run(raster(), false, 5).expect("run");
    assert_eq!(cursor.loop_total, 1);
    motion::run_to_completion(&engine, TICK).await.expect("ticker");
    assert_eq!(axis.calls().iter().filter(|c| **c == AxisCall::Home).count(), 1);
}

#[tokio::test]
async fn test_failed_step_halts_run() {
    let axis = fast_axis();
    axis.fail_on_command(2);
    let (engine, diagnostics) = motion_rig(Arc::clone(&axis), &actuator_config());
    let mut diag_rx = diagnostics.subscribe();
    let mut events = engine.subscribe();

    engine.run(raster(), true, 3).expect("run");
    let outcome = motion::run_to_completion(&engine, TICK).await.expect("ticker");
    match outcome {
        TickOutcome::Failed { index, cause } => {
            assert_eq!(index, 0);
            assert!(cause.contains("injected failure"), "cause: {cause}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(engine.state(), EngineState::Faulted);
    assert!(engine.cursor().is_none());
    assert!(matches!(
        collect(&mut events).last(),
        Some(MotionEvent::StepFailed { index: 0, .. })
    ));
    assert!(matches!(
        diag_rx.try_recv(),
        Ok(Diagnostic::StepFailed { index: 0, .. })
    ));

    // Nothing after the failing step reached the axis.
    assert_eq!(axis.calls().len(), 2);
    assert_eq!(engine.advance_tick().await.expect("tick"), TickOutcome::Idle);

    // A faulted engine can run again.
    engine.run_current().expect("rerun");
    assert_eq!(
        motion::run_to_completion(&engine, TICK).await.expect("ticker"),
        TickOutcome::Completed
    );
}

#[tokio::test]
async fn test_hung_step_times_out_and_stops_axis() {
    let axis = fast_axis();
    axis.hang_on_command(2);
    let config = ActuatorConfig {
        command_timeout: Duration::from_millis(100),
        ..actuator_config()
    };
    let (engine, _) = motion_rig(Arc::clone(&axis), &config);

    engine.run(raster(), false, 1).expect("run");
    let outcome = engine.advance_tick().await.expect("tick");
    match outcome {
        TickOutcome::Failed { index: 0, cause } => assert!(cause.contains("timed out"), "cause: {cause}"),
        other => panic!("expected timeout failure, got {other:?}"),
    }
    assert_eq!(axis.stop_count(), 1);
    assert_eq!(engine.state(), EngineState::Faulted);
}

#[tokio::test]
async fn test_stop_interrupts_step_in_progress() {
    let axis = Arc::new(MockAxis::new("AXIS0"));
    let config = ActuatorConfig {
        command_timeout: Duration::from_secs(300),
        ..actuator_config()
    };
    let (engine, _) = motion_rig(Arc::clone(&axis), &config);
    let mut events = engine.subscribe();

    engine.run(long_move(), false, 1).expect("run");
    let ticker = motion::spawn_ticker(Arc::clone(&engine), TICK);
    wait_for_step_start(&mut events).await;

    assert!(assert_ok!(engine.stop().await), "a run was active");
    let outcome = tokio::time::timeout(Duration::from_secs(1), ticker)
        .await
        .expect("ticker ends promptly")
        .expect("ticker task")
        .expect("ticker");
    assert_eq!(outcome, TickOutcome::Stopped);
    assert_eq!(engine.state(), EngineState::Idle);
    assert!(engine.cursor().is_none());
    assert_eq!(axis.stop_count(), 1);

    let after: Vec<MotionEvent> = collect(&mut events);
    assert_eq!(after, vec![MotionEvent::Stopped]);

    let position = engine.position(Unit::Millimeter).await.expect("position");
    assert!(position < 100.0, "stage stopped short of the target: {position}");
}

#[tokio::test]
async fn test_stop_when_idle_still_halts_axis() {
    let axis = fast_axis();
    let (engine, _) = motion_rig(Arc::clone(&axis), &actuator_config());
    assert!(!assert_ok!(engine.stop().await));
    assert_eq!(axis.stop_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_handle_from_plain_thread() {
    let axis = Arc::new(MockAxis::new("AXIS0"));
    let config = ActuatorConfig {
        command_timeout: Duration::from_secs(300),
        ..actuator_config()
    };
    let (engine, _) = motion_rig(Arc::clone(&axis), &config);
    let mut events = engine.subscribe();
    let handle = engine.stop_handle().expect("inside a runtime");

    engine.run(long_move(), false, 1).expect("run");
    let ticker = motion::spawn_ticker(Arc::clone(&engine), TICK);
    wait_for_step_start(&mut events).await;

    let stopped = std::thread::spawn(move || handle.stop())
        .join()
        .expect("stop thread");
    assert!(stopped);
    let outcome = tokio::time::timeout(Duration::from_secs(1), ticker)
        .await
        .expect("ticker ends promptly")
        .expect("ticker task")
        .expect("ticker");
    assert_eq!(outcome, TickOutcome::Stopped);
}

#[tokio::test]
async fn test_overlapping_ticks_are_rejected() {
    let (engine, _) = motion_rig(fast_axis(), &actuator_config());
    let program = MotionProgram::from_steps(vec![MotionStep::Pause { duration: 0.1 }]).expect("program");
    engine.run(program, false, 1).expect("run");

    let (first, second) = tokio::join!(engine.advance_tick(), async {
        tokio::task::yield_now().await;
        engine.advance_tick().await
    });
    assert_eq!(assert_ok!(first), TickOutcome::Completed);
    assert!(matches!(second, Err(DaqError::TickInProgress)));
}

#[tokio::test]
async fn test_pause_waits_its_duration() {
    let (engine, _) = motion_rig(fast_axis(), &actuator_config());
    let program = MotionProgram::from_steps(vec![MotionStep::Pause { duration: 0.05 }]).expect("program");
    engine.run(program, false, 1).expect("run");
    let started = tokio::time::Instant::now();
    assert_eq!(engine.advance_tick().await.expect("tick"), TickOutcome::Completed);
    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[tokio::test]
async fn test_scan_moves_for_its_duration() {
    let axis = Arc::new(MockAxis::new("AXIS0"));
    let (engine, _) = motion_rig(Arc::clone(&axis), &actuator_config());
    let program = MotionProgram::from_steps(vec![MotionStep::Scan {
        speed: 2.0,
        direction: Direction::Negative,
        duration: 0.02,
        unit: Unit::Millimeter,
    }])
    .expect("program");
    engine.run(program, false, 1).expect("run");
    assert_eq!(engine.advance_tick().await.expect("tick"), TickOutcome::Completed);

    let position = engine.position(Unit::Millimeter).await.expect("position");
    assert!((position + 0.04).abs() < 1e-9, "position {position}");
    assert!(matches!(
        axis.calls().last(),
        Some(AxisCall::Scan {
            direction: Direction::Negative,
            ..
        })
    ));
}

#[tokio::test]
async fn test_edits_and_manual_moves_wait_for_idle() {
    let (engine, _) = motion_rig(fast_axis(), &actuator_config());
    engine.run(raster(), false, 1).expect("run");

    assert!(matches!(engine.reorder(0, 1), Err(DaqError::ProgramBusy)));
    assert!(matches!(engine.remove_step(0), Err(DaqError::ProgramBusy)));
    assert!(matches!(engine.set_looping(true, 2), Err(DaqError::ProgramBusy)));
    assert!(matches!(engine.run_current(), Err(DaqError::ProgramBusy)));
    assert!(matches!(engine.move_to(1.0, Unit::Millimeter).await, Err(DaqError::ProgramBusy)));
    assert!(matches!(engine.jog(1.0, Unit::Millimeter).await, Err(DaqError::ProgramBusy)));

    motion::run_to_completion(&engine, TICK).await.expect("ticker");
    assert_eq!(engine.program(), raster(), "the run program stays editable afterwards");
    engine.reorder(2, 0).expect("reorder");
    assert!(matches!(engine.program().get(0), Some(MotionStep::Home { .. })));
    engine.remove_step(0).expect("remove");
    assert_eq!(engine.program().len(), 2);
    assert_err!(engine.set_looping(true, 0));
    engine.clear().expect("clear");
    assert!(matches!(engine.run_current(), Err(DaqError::InvalidProgram(_))));
}

#[tokio::test]
async fn test_manual_control() {
    let (engine, _) = motion_rig(fast_axis(), &actuator_config());
    assert_ok!(engine.move_to(3.0, Unit::Millimeter).await);
    assert_ok!(engine.jog(250.0, Unit::Micrometer).await);
    let position = engine.position(Unit::Millimeter).await.expect("position");
    assert!((position - 3.25).abs() < 1e-9);

    // 1250 nm per encoder count: 800 counts per millimetre.
    assert_ok!(engine.move_to(800.0, Unit::Encoder).await);
    let position = engine.position(Unit::Millimeter).await.expect("position");
    assert!((position - 1.0).abs() < 1e-9);

    assert_ok!(engine.home().await);
    assert_eq!(engine.position(Unit::Millimeter).await.expect("position"), 0.0);

    assert!(matches!(
        engine.set_speed(0.0, Unit::Millimeter).await,
        Err(DaqError::InvalidStep(_))
    ));
    assert_ok!(engine.set_speed(4.0, Unit::Millimeter).await);
}

#[tokio::test]
async fn test_program_files_through_engine() {
    let (engine, _) = motion_rig(fast_axis(), &actuator_config());
    engine.replace_program(raster()).expect("replace");
    engine.set_looping(true, 4).expect("looping");

    let dir = tempfile::tempdir().expect("tempdir");
    let saved = engine.save_program(&dir.path().join("raster")).expect("save");
    assert_eq!(saved.extension().and_then(|e| e.to_str()), Some("json"));

    engine.clear().expect("clear");
    engine.load_program(&saved).expect("load");
    let program = engine.program();
    assert_eq!(program.steps(), raster().steps());
    assert!(program.loop_enabled());
    assert_eq!(program.loop_count(), 4);

    let cursor = engine.run_current().expect("run");
    assert_eq!(cursor.loop_total, 4);
    assert_eq!(
        motion::run_to_completion(&engine, TICK).await.expect("ticker"),
        TickOutcome::Completed
    );
}

#[tokio::test]
async fn test_disconnect_closes_session() {
    let axis = fast_axis();
    let registry = DeviceRegistry::new();
    let engine = SequenceEngine::connect(
        &registry,
        Arc::clone(&axis) as Arc<dyn tosca_daq::hardware::MotionAxis>,
        &actuator_config(),
        Arc::new(tosca_daq::diagnostics::NullDiagnostics),
    )
    .expect("connect");
    assert_eq!(registry.holders("AXIS0"), vec![AccessMode::Full]);

    engine.run(raster(), false, 1).expect("run");
    engine.disconnect().await;
    assert_eq!(engine.state(), EngineState::Idle);
    assert_eq!(axis.stop_count(), 1, "active run halted on disconnect");
    assert!(registry.holders("AXIS0").is_empty());

    assert!(matches!(engine.run(raster(), false, 1), Err(DaqError::SessionClosed(_))));
    assert!(matches!(engine.clear(), Err(DaqError::SessionClosed(_))));
    assert!(matches!(engine.home().await, Err(DaqError::SessionClosed(_))));
}

#[tokio::test]
async fn test_axis_access_is_arbitrated() {
    let axis = fast_axis();
    let registry = DeviceRegistry::new();
    let diagnostics = Arc::new(tosca_daq::diagnostics::NullDiagnostics);

    let _owner = SequenceEngine::connect(&registry, axis.clone(), &actuator_config(), diagnostics.clone())
        .expect("first connect");
    assert!(matches!(
        SequenceEngine::connect(&registry, axis.clone(), &actuator_config(), diagnostics.clone()),
        Err(DaqError::AccessDenied { .. })
    ));

    let read_only = ActuatorConfig {
        access_mode: AccessMode::Read,
        ..actuator_config()
    };
    assert!(matches!(
        SequenceEngine::connect(&DeviceRegistry::new(), axis, &read_only, diagnostics),
        Err(DaqError::AccessDenied { .. })
    ));
}
