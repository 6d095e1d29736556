//! Routing rules applied before model selection
//!
//! Predicates and actions are closed, tagged enums so rules can be written in
//! the TOML config:
//!
//! ```toml
//! [[rules]]
//! name = "block-secrets"
//! priority = 100
//! condition = { type = "input_contains", pattern = "BEGIN PRIVATE KEY" }
//! action = { type = "reject", reason = "request contains key material" }
//! ```

use super::error::{DecisionTrail, TrailStep};
use super::{RoutingError, RoutingRequest};
use crate::api::Payload;
use crate::catalog::Capability;
use crate::router::OperationKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A policy evaluated against every request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Higher runs first
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub condition: RuleCondition,
    pub action: RuleAction,
}

fn default_enabled() -> bool {
    true
}

impl RoutingRule {
    pub fn new(
        name: impl Into<String>,
        priority: i32,
        condition: RuleCondition,
        action: RuleAction,
    ) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            priority,
            condition,
            action,
        }
    }
}

/// Predicate over a request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleCondition {
    #[default]
    Always,
    Operation { operations: Vec<OperationKind> },
    HasUser,
    User { user_ids: Vec<String> },
    RequiresCapability { capability: Capability },
    InputContains {
        pattern: String,
        #[serde(default)]
        case_sensitive: bool,
    },
    InputLongerThan { chars: usize },
    BudgetBelow { max: f64 },
    PriorityAtLeast { min: i32 },
    All { conditions: Vec<RuleCondition> },
    Any { conditions: Vec<RuleCondition> },
    Not { condition: Box<RuleCondition> },
}

impl RuleCondition {
    pub fn matches(&self, request: &RoutingRequest) -> bool {
        let ctx = &request.context;
        match self {
            RuleCondition::Always => true,
            RuleCondition::Operation { operations } => operations.contains(&request.operation),
            RuleCondition::HasUser => ctx.user_id.is_some(),
            RuleCondition::User { user_ids } => ctx
                .user_id
                .as_ref()
                .is_some_and(|id| user_ids.contains(id)),
            RuleCondition::RequiresCapability { capability } => {
                ctx.required_capabilities.contains(capability)
            }
            RuleCondition::InputContains {
                pattern,
                case_sensitive,
            } => {
                let text = input_text(&request.input);
                if *case_sensitive {
                    text.contains(pattern.as_str())
                } else {
                    text.to_lowercase().contains(&pattern.to_lowercase())
                }
            }
            RuleCondition::InputLongerThan { chars } => {
                input_text(&request.input).chars().count() > *chars
            }
            RuleCondition::BudgetBelow { max } => ctx.budget.is_some_and(|b| b < *max),
            RuleCondition::PriorityAtLeast { min } => ctx.priority.is_some_and(|p| p >= *min),
            RuleCondition::All { conditions } => conditions.iter().all(|c| c.matches(request)),
            RuleCondition::Any { conditions } => conditions.iter().any(|c| c.matches(request)),
            RuleCondition::Not { condition } => !condition.matches(request),
        }
    }
}

fn input_text(payload: &Payload) -> String {
    match payload {
        Payload::Text(text) => text.clone(),
        Payload::Chat(messages) => messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// What a matching rule does
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    /// Pin a preferred provider (and optionally model)
    Route {
        provider: String,
        #[serde(default)]
        model: Option<String>,
    },
    /// Patch the routing context
    Modify {
        #[serde(default)]
        priority: Option<i32>,
        #[serde(default)]
        budget: Option<f64>,
        #[serde(default)]
        max_latency_ms: Option<u64>,
        #[serde(default)]
        add_capabilities: Vec<Capability>,
    },
    /// Abort the request
    Reject { reason: String },
    /// Cache the response regardless of its cost
    ForceCache {
        #[serde(default)]
        ttl_secs: Option<u64>,
    },
}

/// Side effects of rule evaluation that are not part of the request context
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleEffects {
    pub force_cache: bool,
    pub cache_ttl: Option<Duration>,
    /// Name of the rule that pinned the provider, if any
    pub pinned_by: Option<String>,
}

/// Evaluate enabled rules by descending priority, mutating the request context.
///
/// Ties keep their configured order. The first matching reject aborts.
pub fn apply_rules(
    rules: &[RoutingRule],
    request: &mut RoutingRequest,
    trail: &mut DecisionTrail,
) -> Result<RuleEffects, RoutingError> {
    let mut ordered: Vec<&RoutingRule> = rules.iter().filter(|r| r.enabled).collect();
    ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

    let mut effects = RuleEffects::default();

    for rule in ordered {
        if !rule.condition.matches(request) {
            continue;
        }

        match &rule.action {
            RuleAction::Reject { reason } => {
                trail.push(TrailStep::Rule, rule.name.as_str(), format!("rejected: {}", reason));
                return Err(RoutingError::PolicyRejected {
                    rule: rule.name.clone(),
                    reason: reason.clone(),
                    trail: trail.clone(),
                });
            }
            RuleAction::Route { provider, model } => {
                if let Some(earlier) = &effects.pinned_by {
                    trail.push(
                        TrailStep::Rule,
                        rule.name.as_str(),
                        format!("route ignored, already pinned by '{}'", earlier),
                    );
                    continue;
                }
                request.context.preferred_provider = Some(provider.clone());
                if model.is_some() {
                    request.context.preferred_model = model.clone();
                }
                effects.pinned_by = Some(rule.name.clone());
                trail.push(TrailStep::Rule, rule.name.as_str(), format!("route to {}", provider));
            }
            RuleAction::Modify {
                priority,
                budget,
                max_latency_ms,
                add_capabilities,
            } => {
                let ctx = &mut request.context;
                if priority.is_some() {
                    ctx.priority = *priority;
                }
                if budget.is_some() {
                    ctx.budget = *budget;
                }
                if max_latency_ms.is_some() {
                    ctx.max_latency_ms = *max_latency_ms;
                }
                for capability in add_capabilities {
                    if !ctx.required_capabilities.contains(capability) {
                        ctx.required_capabilities.push(*capability);
                    }
                }
                trail.push(TrailStep::Rule, rule.name.as_str(), "modified context");
            }
            RuleAction::ForceCache { ttl_secs } => {
                effects.force_cache = true;
                if effects.cache_ttl.is_none() {
                    effects.cache_ttl = ttl_secs.map(Duration::from_secs);
                }
                trail.push(TrailStep::Rule, rule.name.as_str(), "force cache");
            }
        }
    }

    Ok(effects)
}
