//! Adapter plugin contract and the registry that dispatches on `action_type`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::action::{Action, ActionType};
use crate::config::Config;
use crate::control::Mode;
use crate::error::Result;

pub mod proof;
pub mod webhook;

pub use proof::ProofAdapter;
pub use webhook::WebhookAdapter;

// ---------------------------------------------------------------------------
// AdapterError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Worth retrying: timeouts, rate limits, upstream 5xx.
    Transient,
    /// Retrying cannot help; the action goes straight to dead letter.
    Permanent,
    /// Unclassified, including adapter panics. Retried like `Transient`.
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{kind}] {message}")]
pub struct AdapterError {
    pub kind: ErrorKind,
    pub message: String,
}

impl AdapterError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind != ErrorKind::Permanent
    }
}

// ---------------------------------------------------------------------------
// Request / output
// ---------------------------------------------------------------------------

/// What an adapter is asked to do. Carries the idempotency key so real
/// integrations can deduplicate on their side too.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionRequest {
    pub action_id: Uuid,
    pub action_type: ActionType,
    pub idempotency_key: String,
    pub payload: serde_json::Value,
}

impl From<&Action> for ExecutionRequest {
    fn from(action: &Action) -> Self {
        Self {
            action_id: action.id,
            action_type: action.action_type,
            idempotency_key: action.idempotency_key.clone(),
            payload: action.payload.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionOutput {
    /// Stored on the action and echoed into the execution log.
    pub artifact_ref: String,
    /// Hex SHA-256 of the canonical request, when the adapter computes one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub artifact: serde_json::Value,
}

#[async_trait]
pub trait ActionAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Perform (or, in proof mode, simulate) one action.
    async fn execute(
        &self,
        request: &ExecutionRequest,
        mode: Mode,
    ) -> std::result::Result<ExecutionOutput, AdapterError>;
}

// ---------------------------------------------------------------------------
// AdapterRegistry
// ---------------------------------------------------------------------------

pub struct AdapterRegistry {
    adapters: HashMap<ActionType, Arc<dyn ActionAdapter>>,
    proof: Arc<dyn ActionAdapter>,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterRegistry {
    /// An empty registry. Every type still resolves in proof mode through
    /// the built-in [`ProofAdapter`].
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
            proof: Arc::new(ProofAdapter),
        }
    }

    pub fn proof_only() -> Self {
        Self::new()
    }

    /// Registry with a [`WebhookAdapter`] for each configured webhook target.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Self::new();
        for (action_type, target) in &config.webhooks {
            registry.register(*action_type, Arc::new(WebhookAdapter::new(target)?));
            tracing::debug!(%action_type, url = %target.url, "webhook adapter registered");
        }
        Ok(registry)
    }

    pub fn register(&mut self, action_type: ActionType, adapter: Arc<dyn ActionAdapter>) {
        self.adapters.insert(action_type, adapter);
    }

    pub fn is_registered(&self, action_type: ActionType) -> bool {
        self.adapters.contains_key(&action_type)
    }

    /// The adapter for `action_type` under `mode`. An unregistered type is a
    /// permanent failure in real mode.
    pub fn resolve(
        &self,
        action_type: ActionType,
        mode: Mode,
    ) -> std::result::Result<Arc<dyn ActionAdapter>, AdapterError> {
        if let Some(adapter) = self.adapters.get(&action_type) {
            return Ok(Arc::clone(adapter));
        }
        match mode {
            Mode::Proof => Ok(Arc::clone(&self.proof)),
            Mode::Real => Err(AdapterError::permanent(format!(
                "no adapter registered for {action_type}"
            ))),
        }
    }
}
