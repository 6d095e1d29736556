//! Token and cost estimation
//!
//! Token counts here are approximations used for budgeting and eligibility
//! checks before a call is made. Once a provider reports real usage, the router
//! prices that instead.
//!
//! The counting strategy is a trait so the heuristic default can be replaced by
//! an exact tokenizer ([`TiktokenEstimator`]) without touching the router.

use crate::api::Payload;
use crate::catalog::ModelCatalog;
use std::sync::Arc;
use tiktoken_rs::CoreBPE;

/// Per-message structure overhead (role marker and separators)
const MESSAGE_OVERHEAD: usize = 4;
/// Start/end framing for a whole conversation
const CONVERSATION_OVERHEAD: usize = 2;

/// Strategy for approximating token counts
pub trait TokenEstimator: Send + Sync {
    fn estimate_tokens(&self, text: &str) -> usize;

    /// Estimate tokens for a full payload, including chat framing
    fn estimate_payload_tokens(&self, payload: &Payload) -> usize {
        match payload {
            Payload::Text(text) => self.estimate_tokens(text),
            Payload::Chat(messages) => {
                messages
                    .iter()
                    .map(|m| self.estimate_tokens(&m.content) + MESSAGE_OVERHEAD)
                    .sum::<usize>()
                    + CONVERSATION_OVERHEAD
            }
        }
    }
}

/// Length-based approximation: roughly four characters per token
///
/// Deterministic and allocation-free. Not exact for any real tokenizer.
#[derive(Debug, Clone, Copy)]
pub struct HeuristicEstimator {
    pub chars_per_token: usize,
}

impl Default for HeuristicEstimator {
    fn default() -> Self {
        Self { chars_per_token: 4 }
    }
}

impl TokenEstimator for HeuristicEstimator {
    fn estimate_tokens(&self, text: &str) -> usize {
        let chars = text.chars().count();
        if chars == 0 {
            return 0;
        }
        chars.div_ceil(self.chars_per_token.max(1))
    }
}

/// Exact counts using the cl100k_base BPE
#[derive(Clone)]
pub struct TiktokenEstimator {
    bpe: Arc<CoreBPE>,
}

impl TiktokenEstimator {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            bpe: Arc::new(tiktoken_rs::cl100k_base()?),
        })
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn estimate_tokens(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

/// Cost of `input_tokens`/`output_tokens` on `model_id`, from catalog pricing
///
/// Returns `None` when the model is not in the catalog. Callers treat that as
/// "cannot verify budget".
pub fn estimate_cost(
    catalog: &ModelCatalog,
    model_id: &str,
    input_tokens: usize,
    output_tokens: usize,
) -> Option<f64> {
    let pricing = catalog.get(model_id)?.pricing;
    Some(
        (input_tokens as f64 / 1000.0) * pricing.input_per_1k
            + (output_tokens as f64 / 1000.0) * pricing.output_per_1k,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Message;
    use crate::catalog::{Model, Pricing};

    #[test]
    fn test_heuristic_is_length_based() {
        let estimator = HeuristicEstimator::default();
        assert_eq!(estimator.estimate_tokens(""), 0);
        assert_eq!(estimator.estimate_tokens("ping"), 1);
        assert_eq!(estimator.estimate_tokens("hello"), 2);
        assert_eq!(estimator.estimate_tokens(&"x".repeat(4000)), 1000);
    }

    #[test]
    fn test_chat_payload_includes_overhead() {
        let estimator = HeuristicEstimator::default();
        let payload = Payload::Chat(vec![Message::system("abcd"), Message::user("abcd")]);
        // 2 * (1 + 4) + 2
        assert_eq!(estimator.estimate_payload_tokens(&payload), 12);
    }

    #[test]
    fn test_estimate_cost_from_catalog() {
        let catalog = ModelCatalog::from_models([Model::new("m1", "p", Pricing::new(0.01, 0.03))]);

        let cost = estimate_cost(&catalog, "m1", 2000, 1000).unwrap();
        assert!((cost - 0.05).abs() < 1e-9);
        assert_eq!(estimate_cost(&catalog, "missing", 1000, 1000), None);
    }
}
