//! Stage operation trait and its input/output types.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::stage::Stage;
use crate::Result;
use crate::resilience::REMOTE_API;

/// Output of one operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialResult {
    /// Number of records produced (frames, captions, segments...).
    pub count: u64,
    pub data: serde_json::Value,
}

impl PartialResult {
    pub fn new(count: u64, data: serde_json::Value) -> Self {
        Self { count, data }
    }
}

/// Everything an operation sees. Also the serialized input of a dead letter,
/// so a replay runs with exactly the original context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationContext {
    pub job_id: String,
    pub item_id: String,
    pub stage: Stage,
    /// Caller-supplied submission metadata.
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Results of earlier stages, by operation name.
    #[serde(default)]
    pub prior: BTreeMap<String, PartialResult>,
}

impl OperationContext {
    pub fn result(&self, operation: &str) -> Option<&PartialResult> {
        self.prior.get(operation)
    }

    pub fn count(&self, operation: &str) -> u64 {
        self.result(operation).map(|r| r.count).unwrap_or(0)
    }
}

/// One named unit of work inside a stage (captioning, transcription, ...).
///
/// Implementations hold no mutable state shared with sibling operations;
/// operations of the same stage run concurrently.
#[async_trait]
pub trait StageOperation: Send + Sync {
    /// Unique operation name; also the dead letter replay key.
    fn name(&self) -> &str;

    fn stage(&self) -> Stage;

    /// Circuit breaker guarding this operation's dependency.
    fn dependency(&self) -> String {
        format!("{REMOTE_API}:{}", self.name())
    }

    fn cache_namespace(&self) -> &str {
        self.name()
    }

    fn cache_key(&self, ctx: &OperationContext) -> String {
        ctx.item_id.clone()
    }

    /// Cache TTL; `None` uses the cache default.
    fn cache_ttl(&self) -> Option<Duration> {
        None
    }

    /// False when this item lacks the operation's input (e.g. no audio track).
    fn inputs_available(&self, _ctx: &OperationContext) -> bool {
        true
    }

    async fn execute(&self, ctx: &OperationContext) -> Result<PartialResult>;
}
