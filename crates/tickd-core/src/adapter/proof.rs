//! Proof mode: deterministic artifacts instead of external effects.
//!
//! The artifact is keyed by a SHA-256 over the canonical JSON of
//! `{"action_type", "payload"}` with object keys sorted at every depth, so the
//! same logical action always yields the same hash regardless of how its
//! payload was serialized on the way in.

use async_trait::async_trait;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::{ActionAdapter, AdapterError, ExecutionOutput, ExecutionRequest};
use crate::action::ActionType;
use crate::control::Mode;

pub const ARTIFACT_PREFIX: &str = "proof:sha256:";

/// Rebuild `value` with every object's keys in sorted order.
fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::with_capacity(map.len());
            for key in keys {
                out.insert(key.clone(), sorted(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

/// Compact JSON with sorted keys.
pub fn canonical_json(value: &Value) -> String {
    sorted(value).to_string()
}

/// Hex SHA-256 of the canonical `(action_type, payload)` pair.
pub fn content_hash(action_type: ActionType, payload: &Value) -> String {
    let doc = serde_json::json!({
        "action_type": action_type.as_str(),
        "payload": payload,
    });
    let digest = Sha256::digest(canonical_json(&doc).as_bytes());
    hex::encode(digest)
}

/// The proof artifact for `request`. Also used by real adapters when the
/// control row is in proof mode.
pub fn synthesize(request: &ExecutionRequest) -> ExecutionOutput {
    let hash = content_hash(request.action_type, &request.payload);
    ExecutionOutput {
        artifact_ref: format!("{ARTIFACT_PREFIX}{hash}"),
        artifact: serde_json::json!({
            "mode": "proof",
            "action_type": request.action_type,
            "idempotency_key": request.idempotency_key,
            "content_hash": hash,
        }),
        content_hash: Some(hash),
    }
}

pub struct ProofAdapter;

#[async_trait]
impl ActionAdapter for ProofAdapter {
    fn name(&self) -> &str {
        "proof"
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
        mode: Mode,
    ) -> Result<ExecutionOutput, AdapterError> {
        match mode {
            Mode::Proof => Ok(synthesize(request)),
            Mode::Real => Err(AdapterError::permanent(format!(
                "no real-mode integration for {}",
                request.action_type
            ))),
        }
    }
}
