//! Regex-based classification of captured session output.

use regex::Regex;

use crate::models::state::{AgentState, DetectedState};
use crate::Result;

/// Lines from the bottom of the sample that may show a waiting prompt.
const WAITING_WINDOW: usize = 5;

/// Pattern sets for each classification.
#[derive(Debug, Clone)]
pub struct PatternClassifier {
    idle: Vec<Regex>,
    waiting: Vec<Regex>,
    busy: Vec<Regex>,
    error: Vec<Regex>,
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| Regex::new(pattern).map_err(Into::into))
        .collect()
}

impl PatternClassifier {
    /// Compile the four pattern lists.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if any pattern is not a valid regex.
    pub fn new(
        idle: &[String],
        waiting: &[String],
        busy: &[String],
        error: &[String],
    ) -> Result<Self> {
        Ok(Self {
            idle: compile(idle)?,
            waiting: compile(waiting)?,
            busy: compile(busy)?,
            error: compile(error)?,
        })
    }

    /// Classify a sample of output.
    ///
    /// Busy markers anywhere in the sample beat an idle prompt on the last
    /// line; waiting markers are only honoured near the bottom.
    #[must_use]
    pub fn classify(&self, sample: &str) -> DetectedState {
        let lines: Vec<&str> = sample.lines().filter(|l| !l.trim().is_empty()).collect();
        let Some(last) = lines.last() else {
            return DetectedState::of(AgentState::Unknown);
        };
        let tail = &lines[lines.len().saturating_sub(WAITING_WINDOW)..];

        let matches_any = |set: &[Regex], text: &str| set.iter().any(|re| re.is_match(text));

        let status = if lines.iter().any(|line| matches_any(&self.busy, line)) {
            AgentState::Busy
        } else if matches_any(&self.idle, last) {
            AgentState::Idle
        } else {
            AgentState::Unknown
        };

        DetectedState {
            status,
            is_waiting: tail.iter().any(|line| matches_any(&self.waiting, line)),
            has_error: tail.iter().any(|line| matches_any(&self.error, line)),
        }
    }
}
