//! Usage ledger: where successful calls are accounted
//!
//! The router writes one [`UsageRecord`] per provider-served response. Storage
//! belongs to the embedding application; [`InMemoryLedger`] is the default and
//! what the CLI uses.

use crate::router::OperationKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    #[error("Record rejected: {0}")]
    Rejected(String),
}

/// One accounted call. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub request_id: Uuid,
    pub model_id: String,
    pub provider: String,
    pub operation: OperationKind,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// USD
    pub cost: f64,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Sink for usage records
#[async_trait]
pub trait UsageLedger: Send + Sync {
    async fn record(&self, record: UsageRecord) -> Result<(), LedgerError>;
}

/// Append-only in-process ledger
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    records: RwLock<Vec<UsageRecord>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<UsageRecord> {
        self.records.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn total_cost(&self) -> f64 {
        self.records.read().await.iter().map(|r| r.cost).sum()
    }

    /// Records attributed to `user_id`
    pub async fn for_user(&self, user_id: &str) -> Vec<UsageRecord> {
        self.records
            .read()
            .await
            .iter()
            .filter(|r| r.user_id.as_deref() == Some(user_id))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl UsageLedger for InMemoryLedger {
    async fn record(&self, record: UsageRecord) -> Result<(), LedgerError> {
        self.records.write().await.push(record);
        Ok(())
    }
}
