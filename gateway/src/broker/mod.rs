//! Broker-session termination.
//!
//! Revoking credentials must also evict the subject's long-lived
//! publish/subscribe session. The broker offers no admin API for this;
//! instead the gateway opens a clean-session CONNECT whose client id
//! carries the entity pair and reason code, and the broker is configured
//! to reject that connect with a well-known return code once the session
//! has been taken over. An *accepted* connect means the broker is
//! misconfigured and is reported as an error.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::auth::BrokerCredentials;
use crate::config::MqttSettings;
use crate::metrics_defs::BROKER_DISCONNECTS;
use crate::types::{DisconnectRequest, entity_supported};
use crate::util::is_blank;

pub mod packet;

/// Highest reason code the broker accepts.
const MAX_BROKER_REASON_CODE: u8 = 163;

/// Cap on dialing the broker and waiting for its CONNACK. The handler
/// deadline still dominates.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

const KEEP_ALIVE_SECS: u16 = 5;

#[derive(thiserror::Error, Debug)]
pub enum DisconnectError {
    #[error("entity type is not supported")]
    UnsupportedEntity,
    #[error("entity ID is empty")]
    EmptyEntityId,
    #[error("reason code is not valid")]
    InvalidReasonCode,
    #[error("could not reach broker at {0}: {1}")]
    Connect(String, String),
    #[error("broker handshake failed: {0}")]
    Handshake(#[from] std::io::Error),
    #[error("broker accepted the control-channel connect")]
    UnexpectedAccept,
    #[error("unexpected broker return code {0:#04x}")]
    UnexpectedReturnCode(u8),
    #[error("timed out waiting for the broker")]
    Timeout,
}

#[async_trait]
pub trait Disconnecter: Send + Sync {
    async fn disconnect(&self, request: &DisconnectRequest) -> Result<(), DisconnectError>;
}

/// Builds the control-channel client id: entity, entity ID, and decimal
/// reason code joined with hyphens, with the next server appended when
/// one is given.
pub fn build_client_id(request: &DisconnectRequest) -> Result<String, DisconnectError> {
    if !entity_supported(&request.entity) {
        return Err(DisconnectError::UnsupportedEntity);
    }
    if is_blank(&request.entity_id) {
        return Err(DisconnectError::EmptyEntityId);
    }
    if request.reason_code.as_u8() > MAX_BROKER_REASON_CODE {
        return Err(DisconnectError::InvalidReasonCode);
    }
    let mut parts = vec![
        request.entity.clone(),
        request.entity_id.clone(),
        request.reason_code.as_u8().to_string(),
    ];
    if !is_blank(&request.next_server) {
        parts.push(request.next_server.clone());
    }
    Ok(parts.join("-"))
}

pub struct MqttDisconnecter {
    server: String,
    success_code: u8,
    credentials: BrokerCredentials,
}

impl MqttDisconnecter {
    pub fn new(settings: &MqttSettings, credentials: BrokerCredentials) -> Self {
        Self {
            server: settings.server.clone(),
            success_code: settings.success_code,
            credentials,
        }
    }

    async fn handshake(&self, client_id: &str) -> Result<packet::ConnAck, DisconnectError> {
        let mut stream = TcpStream::connect(&self.server)
            .await
            .map_err(|err| DisconnectError::Connect(self.server.clone(), err.to_string()))?;

        let connect = packet::Connect {
            client_id: client_id.to_string(),
            clean_session: true,
            username: (!self.credentials.user.is_empty())
                .then(|| self.credentials.user.clone()),
            password: (!self.credentials.password.is_empty())
                .then(|| self.credentials.password.clone()),
            keep_alive_secs: KEEP_ALIVE_SECS,
        };
        stream.write_all(&packet::encode_connect(&connect)).await?;
        let ack = packet::read_connack(&mut stream).await?;

        if ack.return_code == packet::ACCEPTED {
            // never expected on this channel; back out of the session
            let _ = stream.write_all(&packet::encode_disconnect()).await;
        }
        Ok(ack)
    }
}

#[async_trait]
impl Disconnecter for MqttDisconnecter {
    async fn disconnect(&self, request: &DisconnectRequest) -> Result<(), DisconnectError> {
        let client_id = build_client_id(request)?;
        tracing::debug!(client_id = %client_id, "starting broker disconnect");

        let result = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.handshake(&client_id))
            .await
            .unwrap_or(Err(DisconnectError::Timeout));

        let outcome = match &result {
            Ok(ack) if ack.return_code == self.success_code => "success",
            Ok(ack) if ack.return_code == packet::ACCEPTED => "accepted",
            Ok(_) => "rejected",
            Err(_) => "error",
        };
        metrics::counter!(BROKER_DISCONNECTS.name, "outcome" => outcome).increment(1);

        let ack = result?;
        if ack.return_code == self.success_code {
            return Ok(());
        }
        if ack.return_code == packet::ACCEPTED {
            return Err(DisconnectError::UnexpectedAccept);
        }
        Err(DisconnectError::UnexpectedReturnCode(ack.return_code))
    }
}
