//! Ordered motion programs.

use std::fmt;

use super::step::MotionStep;
use crate::error::{AppResult, DaqError};

/// An ordered list of steps plus loop settings.
///
/// Steps are validated on the way in, so a program never holds a step with
/// non-finite or negative parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionProgram {
    steps: Vec<MotionStep>,
    loop_enabled: bool,
    loop_count: u32,
}

impl Default for MotionProgram {
    fn default() -> Self {
        Self::new()
    }
}

impl MotionProgram {
    /// Empty program, one pass.
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            loop_enabled: false,
            loop_count: 1,
        }
    }

    /// Program from `steps`, each validated.
    pub fn from_steps(steps: Vec<MotionStep>) -> AppResult<Self> {
        let mut program = Self::new();
        for step in steps {
            program.append(step)?;
        }
        Ok(program)
    }

    /// Steps in execution order.
    pub fn steps(&self) -> &[MotionStep] {
        &self.steps
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the program has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Step at `index`.
    pub fn get(&self, index: usize) -> Option<&MotionStep> {
        self.steps.get(index)
    }

    /// Whether looping is enabled.
    pub fn loop_enabled(&self) -> bool {
        self.loop_enabled
    }

    /// Configured loop count (always at least 1).
    pub fn loop_count(&self) -> u32 {
        self.loop_count
    }

    /// Passes a run will make: `loop_count` when looping, else 1.
    pub fn effective_loops(&self) -> u32 {
        if self.loop_enabled {
            self.loop_count
        } else {
            1
        }
    }

    /// Add `step` at the end.
    pub fn append(&mut self, step: MotionStep) -> AppResult<()> {
        step.validate()?;
        self.steps.push(step);
        Ok(())
    }

    /// Remove and return the step at `index`.
    pub fn remove(&mut self, index: usize) -> AppResult<MotionStep> {
        self.check_index(index)?;
        Ok(self.steps.remove(index))
    }

    /// Move the step at `from` so it ends up at `to`.
    pub fn reorder(&mut self, from: usize, to: usize) -> AppResult<()> {
        self.check_index(from)?;
        self.check_index(to)?;
        let step = self.steps.remove(from);
        self.steps.insert(to, step);
        Ok(())
    }

    /// Remove every step. Loop settings are kept.
    pub fn clear(&mut self) {
        self.steps.clear();
    }

    /// Set loop settings. `count` must be at least 1.
    pub fn set_looping(&mut self, enabled: bool, count: u32) -> AppResult<()> {
        if count == 0 {
            return Err(DaqError::InvalidProgram("loop_count must be at least 1".to_string()));
        }
        self.loop_enabled = enabled;
        self.loop_count = count;
        Ok(())
    }

    /// Re-check every step and the loop settings.
    pub fn validate(&self) -> AppResult<()> {
        if self.loop_count == 0 {
            return Err(DaqError::InvalidProgram("loop_count must be at least 1".to_string()));
        }
        for (index, step) in self.steps.iter().enumerate() {
            step.validate()
                .map_err(|e| DaqError::InvalidProgram(format!("step {index}: {e}")))?;
        }
        Ok(())
    }

    fn check_index(&self, index: usize) -> AppResult<()> {
        if index < self.steps.len() {
            Ok(())
        } else {
            Err(DaqError::InvalidProgram(format!(
                "step index {index} out of range (program has {} steps)",
                self.steps.len()
            )))
        }
    }
}

impl fmt::Display for MotionProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, step) in self.steps.iter().enumerate() {
            writeln!(f, "{index:>3}: {step}")?;
        }
        if self.loop_enabled {
            write!(f, "loop x{}", self.loop_count)
        } else {
            write!(f, "single pass")
        }
    }
}
