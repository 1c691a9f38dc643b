//! Client-facing wire payloads. Internal fan-out uses
//! [`crate::hello::HelloResponse`]; these types are what a real client
//! sends to/receives from root.

use serde::{Deserialize, Serialize};

use crate::idset::Idset;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecStartRequest {
    pub id: u64,
    pub userid: u32,
    pub ranks: Idset,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecKillRequest {
    pub id: u64,
    pub signal: i32,
    pub ranks: Idset,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PingRequest {
    pub ranks: Idset,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PingResponse {
    pub ranks: Idset,
}

/// One streamed frame of an `exec.start` response.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecStartFrame {
    Start {
        id: u64,
    },
    Finish {
        id: u64,
        status: u32,
    },
    Exception {
        id: u64,
        severity: u32,
        // `type` names both the outer frame tag and the exception kind;
        // that collides under `#[serde(tag = "type")]` internal tagging,
        // so the wire field is named distinctly here.
        exception_type: String,
        note: String,
    },
    Release {
        id: u64,
    },
}

impl ExecStartFrame {
    /// Wrap in the transport-level envelope, using the variant's own tag
    /// as the routing type.
    pub fn into_reply(self) -> crate::transport::ReplyFrame {
        let type_ = match &self {
            ExecStartFrame::Start { .. } => "start",
            ExecStartFrame::Finish { .. } => "finish",
            ExecStartFrame::Exception { .. } => "exception",
            ExecStartFrame::Release { .. } => "release",
        };
        crate::transport::ReplyFrame::new(
            type_,
            serde_json::to_value(&self).expect("ExecStartFrame always serializes"),
        )
    }
}
