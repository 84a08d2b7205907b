//! Signal protocol messages

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

/// Messages pushed to a peer over its realtime connection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "message", rename_all = "snake_case")]
pub enum RelayMessage {
    /// A single candidate relayed as soon as it was uploaded
    Candidate { candidate: IceCandidate },

    /// Buffered candidates delivered in one batch on connect
    Candidates { candidates: Vec<IceCandidate> },

    /// The counterpart's session description
    Description { description: SessionDescription },
}

/// An ICE candidate as uploaded by a peer
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    /// SDP m-line index, rendered as a decimal string (empty when unknown)
    pub sdp_m_line_index: String,
    pub sdp_mid: String,
    pub username_fragment: String,
}

/// A session description (offer or answer)
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    /// Description type code as carried by the RPC schema
    #[serde(rename = "type")]
    pub kind: i32,
}

/// Error codes
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Room not found
    RoomNotFound,

    /// Peer not found in the room
    PeerNotFound,

    /// Room already has two peers
    RoomFull,

    /// Malformed request
    InvalidRequest,

    /// Origin not allowed
    Forbidden,

    /// Unknown route
    NotFound,

    /// Internal server error
    InternalError,
}

impl ErrorCode {
    /// HTTP status used when this error answers an RPC
    pub fn http_status(self) -> StatusCode {
        match self {
            ErrorCode::RoomNotFound | ErrorCode::PeerNotFound | ErrorCode::NotFound => {
                StatusCode::NOT_FOUND
            }
            ErrorCode::RoomFull => StatusCode::CONFLICT,
            ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Body of an RPC error response
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl RelayMessage {
    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
