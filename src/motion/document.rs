//! On-disk program documents.
//!
//! ```json
//! {
//!   "sequence": [
//!     {"type": "move_absolute", "params": {"position": 10.0, "speed": 1.0, "unit": "mm"}},
//!     {"type": "pause", "params": {"duration": 0.2}}
//!   ],
//!   "loop_enabled": false,
//!   "loop_count": 1
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use super::program::MotionProgram;
use super::step::MotionStep;
use crate::error::{AppResult, DaqError};

/// File extension appended by [`save_program`] when missing.
pub const PROGRAM_EXTENSION: &str = "json";

/// Serialized form of a [`MotionProgram`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramDocument {
    /// Steps in execution order
    pub sequence: Vec<MotionStep>,
    /// Whether the program repeats
    #[serde(default)]
    pub loop_enabled: bool,
    /// Number of passes when looping
    #[serde(default = "default_loop_count")]
    pub loop_count: u32,
}

fn default_loop_count() -> u32 {
    1
}

impl From<&MotionProgram> for ProgramDocument {
    fn from(program: &MotionProgram) -> Self {
        Self {
            sequence: program.steps().to_vec(),
            loop_enabled: program.loop_enabled(),
            loop_count: program.loop_count(),
        }
    }
}

impl TryFrom<ProgramDocument> for MotionProgram {
    type Error = DaqError;

    fn try_from(document: ProgramDocument) -> AppResult<Self> {
        let mut program = MotionProgram::new();
        program.set_looping(document.loop_enabled, document.loop_count)?;
        for (index, step) in document.sequence.into_iter().enumerate() {
            program
                .append(step)
                .map_err(|e| DaqError::InvalidProgram(format!("step {index}: {e}")))?;
        }
        Ok(program)
    }
}

impl ProgramDocument {
    /// Pretty-printed JSON.
    pub fn to_json(&self) -> AppResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse JSON text.
    pub fn from_json(text: &str) -> AppResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Write `program` to `path`, adding `.json` when the path has no extension.
///
/// Returns the path actually written.
pub fn save_program(program: &MotionProgram, path: &Path) -> AppResult<PathBuf> {
    let path = if path.extension().is_some() {
        path.to_path_buf()
    } else {
        path.with_extension(PROGRAM_EXTENSION)
    };
    let text = ProgramDocument::from(program).to_json()?;
    std::fs::write(&path, text)?;
    info!(path = %path.display(), steps = program.len(), "Motion program saved");
    Ok(path)
}

/// Read a program from `path`.
pub fn load_program(path: &Path) -> AppResult<MotionProgram> {
    let text = std::fs::read_to_string(path)?;
    let program = MotionProgram::try_from(ProgramDocument::from_json(&text)?)?;
    info!(
        path = %path.display(),
        steps = program.len(),
        loop_enabled = program.loop_enabled(),
        loop_count = program.loop_count(),
        "Motion program loaded"
    );
    Ok(program)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn loop_fields_default_when_missing() {
        let doc: ProgramDocument =
            serde_json::from_value(json!({"sequence": [{"type": "home", "params": {"speed": 2.0}}]}))
                .unwrap();
        assert!(!doc.loop_enabled);
        assert_eq!(doc.loop_count, 1);
    }

    #[test]
    fn zero_loop_count_is_invalid() {
        let doc = ProgramDocument {
            sequence: vec![],
            loop_enabled: true,
            loop_count: 0,
        };
        assert!(matches!(
            MotionProgram::try_from(doc),
            Err(DaqError::InvalidProgram(_))
        ));
    }

    #[test]
    fn invalid_step_names_its_index() {
        let doc = ProgramDocument {
            sequence: vec![MotionStep::Pause { duration: 0.1 }, MotionStep::Home { speed: -1.0 }],
            loop_enabled: false,
            loop_count: 1,
        };
        let err = MotionProgram::try_from(doc).unwrap_err();
        assert!(err.to_string().contains("step 1"));
    }
}
