//! Program documents on disk.

use std::fs;

use serde_json::{json, Value};
use tosca_daq::motion::{self, Direction, MotionProgram, MotionStep, ProgramDocument, Unit};
use tosca_daq::DaqError;

fn every_step_kind() -> MotionProgram {
    let mut program = MotionProgram::from_steps(vec![
        MotionStep::Home { speed: 2.5 },
        MotionStep::SetSpeed {
            speed: 0.1 + 0.2,
            unit: Unit::Millimeter,
        },
        MotionStep::MoveAbsolute {
            position: 12.345_678_901_234_5,
            speed: 3.0,
            unit: Unit::Millimeter,
        },
        MotionStep::MoveRelative {
            distance: -1.0 / 3.0,
            speed: 250.0,
            unit: Unit::Micrometer,
        },
        MotionStep::Pause { duration: 0.75 },
        MotionStep::Scan {
            speed: 1.5,
            direction: Direction::Negative,
            duration: 2.0,
            unit: Unit::Inch,
        },
        MotionStep::MoveAbsolute {
            position: 4096.0,
            speed: 800.0,
            unit: Unit::Encoder,
        },
    ])
    .expect("valid steps");
    program.set_looping(true, 3).expect("looping");
    program
}

#[test]
fn test_save_and_load_preserve_every_step_exactly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let program = every_step_kind();
    let path = motion::save_program(&program, &dir.path().join("everything.json")).expect("save");
    let loaded = motion::load_program(&path).expect("load");
    assert_eq!(loaded, program);
}

#[test]
fn test_extension_added_only_when_missing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let program = every_step_kind();

    let bare = motion::save_program(&program, &dir.path().join("scan")).expect("save");
    assert_eq!(bare, dir.path().join("scan.json"));
    assert!(bare.exists());

    let custom = motion::save_program(&program, &dir.path().join("scan.prog")).expect("save");
    assert_eq!(custom, dir.path().join("scan.prog"));
    assert!(custom.exists());
}

#[test]
fn test_document_layout() {
    let dir = tempfile::tempdir().expect("tempdir");
    let program = MotionProgram::from_steps(vec![
        MotionStep::Pause { duration: 1.0 },
        MotionStep::Scan {
            speed: 1.0,
            direction: Direction::Positive,
            duration: 0.5,
            unit: Unit::Millimeter,
        },
    ])
    .expect("valid steps");
    let path = motion::save_program(&program, &dir.path().join("layout")).expect("save");

    let text = fs::read_to_string(path).expect("read");
    let value: Value = serde_json::from_str(&text).expect("json");
    assert_eq!(
        value,
        json!({
            "sequence": [
                { "type": "pause", "params": { "duration": 1.0 } },
                {
                    "type": "scan",
                    "params": { "speed": 1.0, "direction": "positive", "duration": 0.5, "unit": "mm" }
                }
            ],
            "loop_enabled": false,
            "loop_count": 1
        })
    );
}

#[test]
fn test_hand_written_document_loads() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("hand.json");
    fs::write(
        &path,
        r#"{
            "sequence": [
                {"type": "home", "params": {"speed": 1.0}},
                {"type": "move_relative", "params": {"distance": 2.0, "speed": 0.5, "unit": "um"}}
            ]
        }"#,
    )
    .expect("write");

    let program = motion::load_program(&path).expect("load");
    assert_eq!(program.len(), 2);
    assert!(!program.loop_enabled());
    assert_eq!(program.loop_count(), 1);
    assert_eq!(
        program.get(1),
        Some(&MotionStep::MoveRelative {
            distance: 2.0,
            speed: 0.5,
            unit: Unit::Micrometer,
        })
    );
}

#[test]
fn test_malformed_documents_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");

    let unknown = dir.path().join("unknown.json");
    fs::write(&unknown, r#"{"sequence": [{"type": "teleport", "params": {}}]}"#).expect("write");
    assert!(matches!(motion::load_program(&unknown), Err(DaqError::Json(_))));

    let negative = dir.path().join("negative.json");
    fs::write(
        &negative,
        r#"{"sequence": [{"type": "pause", "params": {"duration": 1.0}},
                         {"type": "home", "params": {"speed": -1.0}}]}"#,
    )
    .expect("write");
    match motion::load_program(&negative) {
        Err(DaqError::InvalidProgram(msg)) => assert!(msg.starts_with("step 1"), "{msg}"),
        other => panic!("expected invalid program, got {other:?}"),
    }

    assert!(matches!(
        motion::load_program(&dir.path().join("absent.json")),
        Err(DaqError::Io(_))
    ));
}

#[test]
fn test_document_conversion_matches_program() {
    let program = every_step_kind();
    let document = ProgramDocument::from(&program);
    assert_eq!(document.sequence.len(), program.len());
    assert!(document.loop_enabled);
    assert_eq!(document.loop_count, 3);
    let back = MotionProgram::try_from(ProgramDocument::from_json(&document.to_json().expect("json")).expect("parse"))
        .expect("convert");
    assert_eq!(back, program);
}
