//! RPC operations exposed to clients
//!
//! Requests and responses are camelCase JSON. Each call is addressed by
//! method name, mirroring the `app.v1.AppService` unary methods.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::datastore::Datastore;
use crate::error::RelayError;
use crate::messages::{ErrorBody, ErrorCode, IceCandidate, SessionDescription};

/// Path prefix of every RPC route
pub const SERVICE_PATH: &str = "/app.v1.AppService/";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateRoomRequest {}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomResponse {
    pub room_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomRequest {
    pub room_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomResponse {
    pub peer_id: String,
}

/// Candidate fields as a browser's `RTCIceCandidateInit` carries them
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInit {
    pub candidate: Option<String>,
    pub sdp_m_line_index: Option<u32>,
    pub sdp_mid: Option<String>,
    pub username_fragment: Option<String>,
}

impl From<IceCandidateInit> for IceCandidate {
    fn from(init: IceCandidateInit) -> Self {
        Self {
            candidate: init.candidate.unwrap_or_default(),
            sdp_m_line_index: init
                .sdp_m_line_index
                .map(|i| i.to_string())
                .unwrap_or_default(),
            sdp_mid: init.sdp_mid.unwrap_or_default(),
            username_fragment: init.username_fragment.unwrap_or_default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadIceCandidateRequest {
    pub room_id: String,
    pub peer_id: String,
    #[serde(default)]
    pub ice_candidate: IceCandidateInit,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionDescriptionInit {
    pub sdp: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: i32,
}

impl From<SessionDescriptionInit> for SessionDescription {
    fn from(init: SessionDescriptionInit) -> Self {
        Self {
            sdp: init.sdp.unwrap_or_default(),
            kind: init.kind,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSessionDescriptionRequest {
    pub room_id: String,
    pub peer_id: String,
    #[serde(default)]
    pub session_description: SessionDescriptionInit,
}

/// Empty acknowledgement
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Ack {}

/// Errors answering an RPC
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("invalid request: {0}")]
    InvalidRequest(serde_json::Error),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl RpcError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RpcError::UnknownMethod(_) => ErrorCode::NotFound,
            RpcError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            RpcError::Relay(e) => ErrorCode::from(e),
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody::new(self.code(), self.to_string())
    }
}

/// The four signaling operations over a shared [`Datastore`]
#[derive(Clone)]
pub struct SignalService {
    store: Arc<Datastore>,
}

impl SignalService {
    pub fn new(store: Arc<Datastore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<Datastore> {
        &self.store
    }

    pub fn create_room(&self, _req: CreateRoomRequest) -> Result<CreateRoomResponse, RelayError> {
        Ok(CreateRoomResponse {
            room_id: self.store.create_room()?,
        })
    }

    pub fn join_room(&self, req: JoinRoomRequest) -> Result<JoinRoomResponse, RelayError> {
        Ok(JoinRoomResponse {
            peer_id: self.store.add_new_peer_to_room(&req.room_id)?,
        })
    }

    pub async fn upload_ice_candidate(&self, req: UploadIceCandidateRequest) -> Result<Ack, RelayError> {
        self.store
            .store_or_send_ice_candidate(&req.room_id, &req.peer_id, req.ice_candidate.into())
            .await?;
        Ok(Ack {})
    }

    pub async fn upload_session_description(
        &self,
        req: UploadSessionDescriptionRequest,
    ) -> Result<Ack, RelayError> {
        self.store
            .set_or_send_session_description(
                &req.room_id,
                &req.peer_id,
                req.session_description.into(),
            )
            .await?;
        Ok(Ack {})
    }

    /// Decode `body`, run `method` and encode the response as JSON
    pub async fn call(&self, method: &str, body: &[u8]) -> Result<String, RpcError> {
        let json = match method {
            "CreateRoom" => to_json(&self.create_room(decode(body)?)?),
            "JoinRoom" => to_json(&self.join_room(decode(body)?)?),
            "UploadIceCandidate" => to_json(&self.upload_ice_candidate(decode(body)?).await?),
            "UploadSessionDescription" => {
                to_json(&self.upload_session_description(decode(body)?).await?)
            }
            other => return Err(RpcError::UnknownMethod(other.to_string())),
        };
        Ok(json?)
    }
}

fn decode<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, RpcError> {
    let body = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}".as_slice()
    } else {
        body
    };
    serde_json::from_slice(body).map_err(RpcError::InvalidRequest)
}

fn to_json<T: Serialize>(value: &T) -> Result<String, RpcError> {
    serde_json::to_string(value).map_err(|e| RpcError::Relay(RelayError::Serialization(e)))
}
