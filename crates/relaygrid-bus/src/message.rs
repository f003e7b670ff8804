//! RPC wire messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A call published to the callee's queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallMessage {
    pub method: String,
    #[serde(default)]
    pub args: Value,
    pub correlation_id: u64,
    /// Queue the reply must be published to.
    pub reply_to: String,
}

/// A reply published to the caller's `reply_to` queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyMessage {
    #[serde(default)]
    pub data: Value,
    pub correlation_id: u64,
}
