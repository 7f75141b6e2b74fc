//! Wire frames exchanged with the remote authority.
//!
//! Every frame is a JSON text message tagged by `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event sent by the daemon every keepalive interval.
pub const EVENT_MACHINE_ALIVE: &str = "machine-alive";
/// Optimistic write of the `daemonState` field.
pub const EVENT_UPDATE_STATE: &str = "machine-update-state";
/// Optimistic write of the `metadata` field.
pub const EVENT_UPDATE_METADATA: &str = "machine-update-metadata";

/// A single channel frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Frame {
    /// Named event, optionally expecting an ack.
    Event {
        /// Event name.
        event: String,
        /// Correlates the ack, when one is expected.
        #[serde(rename = "ackId", default, skip_serializing_if = "Option::is_none")]
        ack_id: Option<u64>,
        /// Event payload.
        data: Value,
    },
    /// Reply to an event that carried an `ackId`.
    Ack {
        /// Id of the acknowledged event.
        #[serde(rename = "ackId")]
        ack_id: u64,
        /// Ack payload.
        #[serde(default)]
        data: Value,
    },
    /// Offer to serve an RPC method.
    RpcRegister {
        /// Fully qualified method (`<machineId>:<name>`).
        method: String,
    },
    /// Remote invocation of a registered method.
    RpcRequest {
        /// Correlation id echoed in the response.
        id: String,
        /// Fully qualified method.
        method: String,
        /// Base64 of encrypted JSON parameters.
        params: String,
    },
    /// Result of an RPC request.
    RpcResponse {
        /// Correlation id from the request.
        id: String,
        /// Base64 of encrypted JSON result.
        result: String,
    },
}

/// Payload of `machine-alive`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineAlive {
    /// Machine identity.
    pub machine_id: String,
    /// Milliseconds since the Unix epoch.
    pub time: i64,
}

/// Reply to an optimistic update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum UpdateAck {
    /// Write accepted at `version`.
    Success {
        /// New version of the field.
        version: u64,
        /// Value the authority now holds, sealed.
        #[serde(default, alias = "metadata", alias = "daemonState")]
        value: Value,
    },
    /// Write rejected; the authority holds `value` at `version`.
    VersionMismatch {
        /// Current version of the field.
        version: u64,
        /// Current value of the field, sealed.
        #[serde(default, alias = "metadata", alias = "daemonState")]
        value: Value,
    },
    /// Write failed for another reason.
    Error {
        /// Reason given by the authority.
        #[serde(default)]
        message: Option<String>,
    },
}
