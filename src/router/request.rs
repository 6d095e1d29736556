//! Routing request structures

use super::RoutingError;
use crate::api::Payload;
use crate::catalog::Capability;
use serde::{Deserialize, Serialize};

/// Kind of AI operation requested. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Chat,
    Completion,
    Analysis,
    Creative,
    Code,
    Reasoning,
    ToolCall,
}

impl OperationKind {
    pub const ALL: [OperationKind; 7] = [
        OperationKind::Chat,
        OperationKind::Completion,
        OperationKind::Analysis,
        OperationKind::Creative,
        OperationKind::Code,
        OperationKind::Reasoning,
        OperationKind::ToolCall,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Chat => "chat",
            OperationKind::Completion => "completion",
            OperationKind::Analysis => "analysis",
            OperationKind::Creative => "creative",
            OperationKind::Code => "code",
            OperationKind::Reasoning => "reasoning",
            OperationKind::ToolCall => "tool_call",
        }
    }

    /// Tool calls have side effects and are never served from or written to the cache
    pub fn is_cacheable(&self) -> bool {
        !matches!(self, OperationKind::ToolCall)
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.to_lowercase().replace('-', "_");
        OperationKind::ALL
            .into_iter()
            .find(|op| op.as_str() == normalized)
            .ok_or_else(|| format!("unknown operation kind: {}", s))
    }
}

/// Optional per-request routing context
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingContext {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    /// Caller priority; higher is more important
    pub priority: Option<i32>,
    /// Maximum cost (USD) of the reference workload
    pub budget: Option<f64>,
    /// Advisory latency ceiling used during selection; never cancels a call
    pub max_latency_ms: Option<u64>,
    pub required_capabilities: Vec<Capability>,
    pub preferred_provider: Option<String>,
    pub preferred_model: Option<String>,
    pub fallback_provider: Option<String>,
}

/// One unit of work to route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRequest {
    pub input: Payload,
    pub operation: OperationKind,
    pub context: RoutingContext,
    /// Upper bound on generated tokens; router default when absent
    pub max_output_tokens: Option<u32>,
}

impl RoutingRequest {
    pub fn new(input: impl Into<Payload>, operation: OperationKind) -> Self {
        Self {
            input: input.into(),
            operation,
            context: RoutingContext::default(),
            max_output_tokens: None,
        }
    }

    pub fn with_context(mut self, context: RoutingContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.context.user_id = Some(user_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.context.session_id = Some(session_id.into());
        self
    }

    pub fn with_budget(mut self, budget: f64) -> Self {
        self.context.budget = Some(budget);
        self
    }

    pub fn with_capabilities(mut self, capabilities: &[Capability]) -> Self {
        self.context.required_capabilities = capabilities.to_vec();
        self
    }

    pub fn with_preferred_provider(mut self, provider: impl Into<String>) -> Self {
        self.context.preferred_provider = Some(provider.into());
        self
    }

    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = Some(tokens);
        self
    }

    /// Reject requests that break construction-time invariants
    pub fn validate(&self) -> Result<(), RoutingError> {
        if self.input.is_empty() {
            return Err(RoutingError::InvalidRequest("input is empty".into()));
        }
        if let Some(budget) = self.context.budget {
            if !budget.is_finite() || budget < 0.0 {
                return Err(RoutingError::InvalidRequest(format!(
                    "budget must be a non-negative number, got {}",
                    budget
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_kind_parses_both_spellings() {
        assert_eq!("tool-call".parse::<OperationKind>(), Ok(OperationKind::ToolCall));
        assert_eq!("Analysis".parse::<OperationKind>(), Ok(OperationKind::Analysis));
        assert!("dance".parse::<OperationKind>().is_err());
    }

    #[test]
    fn test_negative_budget_is_invalid() {
        let request = RoutingRequest::new("ping", OperationKind::Chat).with_budget(-1.0);
        assert!(matches!(request.validate(), Err(RoutingError::InvalidRequest(_))));

        let request = RoutingRequest::new("ping", OperationKind::Chat).with_budget(0.0);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_empty_input_is_invalid() {
        let request = RoutingRequest::new("   ", OperationKind::Chat);
        assert!(request.validate().is_err());
    }
}
