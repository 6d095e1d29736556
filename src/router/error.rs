//! Routing errors and the decision trail attached to them

use crate::api::ProviderError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("Request rejected by rule '{rule}': {reason}")]
    PolicyRejected {
        rule: String,
        reason: String,
        trail: DecisionTrail,
    },

    #[error("No eligible provider [{trail}]")]
    NoEligibleProvider { trail: DecisionTrail },

    #[error("Primary and fallback attempts failed, last error: {last_error} [{trail}]")]
    FallbackExhausted {
        #[source]
        last_error: ProviderError,
        trail: DecisionTrail,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl RoutingError {
    /// Decisions made before the failure, if the router got that far
    pub fn trail(&self) -> Option<&DecisionTrail> {
        match self {
            RoutingError::PolicyRejected { trail, .. }
            | RoutingError::NoEligibleProvider { trail }
            | RoutingError::FallbackExhausted { trail, .. } => Some(trail),
            RoutingError::InvalidRequest(_) => None,
        }
    }
}

/// Step recorded in the decision trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailStep {
    Rule,
    Cache,
    Skipped,
    Selected,
    Failed,
    Succeeded,
    Fallback,
}

impl fmt::Display for TrailStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrailStep::Rule => "rule",
            TrailStep::Cache => "cache",
            TrailStep::Skipped => "skipped",
            TrailStep::Selected => "selected",
            TrailStep::Failed => "failed",
            TrailStep::Succeeded => "succeeded",
            TrailStep::Fallback => "fallback",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrailEntry {
    pub step: TrailStep,
    /// Model id or rule name the step concerns
    pub subject: String,
    pub detail: String,
}

/// Ordered record of which models were considered, tried or skipped, and why
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DecisionTrail {
    entries: Vec<TrailEntry>,
}

impl DecisionTrail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: TrailStep, subject: impl Into<String>, detail: impl Into<String>) {
        self.entries.push(TrailEntry {
            step,
            subject: subject.into(),
            detail: detail.into(),
        });
    }

    pub fn entries(&self) -> &[TrailEntry] {
        &self.entries
    }

    /// Subjects of every entry with the given step, in order
    pub fn subjects(&self, step: TrailStep) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.step == step)
            .map(|e| e.subject.as_str())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for DecisionTrail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            if entry.detail.is_empty() {
                write!(f, "{} {}", entry.step, entry.subject)?;
            } else {
                write!(f, "{} {}: {}", entry.step, entry.subject, entry.detail)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trail_display_and_filtering() {
        let mut trail = DecisionTrail::new();
        trail.push(TrailStep::Skipped, "m1", "deprecated");
        trail.push(TrailStep::Selected, "m2", "");
        trail.push(TrailStep::Failed, "m2", "timeout");

        assert_eq!(
            trail.to_string(),
            "skipped m1: deprecated; selected m2; failed m2: timeout"
        );
        assert_eq!(trail.subjects(TrailStep::Failed), vec!["m2"]);
    }

    #[test]
    fn test_error_exposes_trail() {
        let mut trail = DecisionTrail::new();
        trail.push(TrailStep::Skipped, "m1", "over budget");
        let err = RoutingError::NoEligibleProvider { trail };

        assert_eq!(err.trail().map(|t| t.entries().len()), Some(1));
        assert!(err.to_string().contains("over budget"));
        assert!(RoutingError::InvalidRequest("x".into()).trail().is_none());
    }
}
