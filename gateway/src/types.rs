//! Request bodies accepted by the gateway and the entity identity they
//! all carry.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::util::is_blank;

/// Entity labels the gateway recognizes, compared case-insensitively.
pub const SUPPORTED_ENTITIES: &[&str] = &["veh", "sw", "admin"];

/// Returns whether `entity` is one of the supported entity labels.
pub fn entity_supported(entity: &str) -> bool {
    SUPPORTED_ENTITIES
        .iter()
        .any(|known| entity.eq_ignore_ascii_case(known))
}

/// Why a broker session is being terminated. The wire value is a single
/// byte from a closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReasonCode(pub u8);

impl ReasonCode {
    pub const REAUTHENTICATE: ReasonCode = ReasonCode(0x8C);
    pub const EXPIRATION: ReasonCode = ReasonCode(0xA0);
    pub const HANDOVER: ReasonCode = ReasonCode(0x9C);
    pub const RATE_TOO_HIGH: ReasonCode = ReasonCode(0x96);
    pub const NOT_AUTHORIZED: ReasonCode = ReasonCode(0x98);
    pub const IDLE: ReasonCode = ReasonCode(0x87);

    pub fn is_known(self) -> bool {
        self.name().is_some()
    }

    pub fn name(self) -> Option<&'static str> {
        match self {
            ReasonCode::REAUTHENTICATE => Some("reauthenticate"),
            ReasonCode::EXPIRATION => Some("expiration"),
            ReasonCode::HANDOVER => Some("handover"),
            ReasonCode::RATE_TOO_HIGH => Some("rate-too-high"),
            ReasonCode::NOT_AUTHORIZED => Some("not-authorized"),
            ReasonCode::IDLE => Some("idle"),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self.0
    }
}

/// The `(entity, entityID)` tuple identifying a subject. Also the shape
/// of the conflict body CAS returns when a binding already exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityPair {
    pub entity: String,
    #[serde(rename = "entityid")]
    pub entity_id: String,
}

impl EntityPair {
    pub fn is_valid(&self) -> bool {
        !is_blank(&self.entity) && !is_blank(&self.entity_id) && entity_supported(&self.entity)
    }

    /// Derives the cache/lock key. The entity label is normalized to
    /// lowercase; the entity ID is used verbatim.
    pub fn cache_key(&self) -> String {
        format!("{}-{}", self.entity.to_ascii_lowercase(), self.entity_id)
    }
}

/// Decoded request body the pipeline can validate and lock on.
pub trait RequestBody: DeserializeOwned + Serialize + Send + 'static {
    fn is_valid(&self) -> bool;
    fn entity_pair(&self) -> EntityPair;

    fn cache_key(&self) -> String {
        self.entity_pair().cache_key()
    }
}

/// Body of create, validate, and refresh requests, and of the delete
/// request the gateway sends to CAS during disconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntityTokenRequest {
    pub entity: String,
    #[serde(rename = "entityid")]
    pub entity_id: String,
    pub token: String,
}

impl RequestBody for EntityTokenRequest {
    fn is_valid(&self) -> bool {
        self.entity_pair().is_valid() && !is_blank(&self.token)
    }

    fn entity_pair(&self) -> EntityPair {
        EntityPair {
            entity: self.entity.clone(),
            entity_id: self.entity_id.clone(),
        }
    }
}

/// Body of disconnect requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DisconnectRequest {
    pub entity: String,
    #[serde(rename = "entityid")]
    pub entity_id: String,
    #[serde(rename = "reasonCode")]
    pub reason_code: ReasonCode,
    #[serde(default, rename = "nextServer")]
    pub next_server: String,
}

impl RequestBody for DisconnectRequest {
    fn is_valid(&self) -> bool {
        self.entity_pair().is_valid() && self.reason_code.is_known()
    }

    fn entity_pair(&self) -> EntityPair {
        EntityPair {
            entity: self.entity.clone(),
            entity_id: self.entity_id.clone(),
        }
    }
}

/// Body the gateway sends to CAS when creating a binding: the client's
/// request plus this site's MEC identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateTokenRequest {
    pub entity: String,
    #[serde(rename = "entityid")]
    pub entity_id: String,
    pub token: String,
    pub mec: String,
}

impl ValidateTokenRequest {
    pub fn new(request: &EntityTokenRequest, mec: String) -> Self {
        Self {
            entity: request.entity.clone(),
            entity_id: request.entity_id.clone(),
            token: request.token.clone(),
            mec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(entity: &str, entity_id: &str) -> EntityPair {
        EntityPair {
            entity: entity.to_string(),
            entity_id: entity_id.to_string(),
        }
    }

    #[test]
    fn cache_key_joins_with_hyphen() {
        assert_eq!(pair("veh", "1234").cache_key(), "veh-1234");
    }

    #[test]
    fn cache_key_normalizes_entity_case() {
        assert_eq!(pair("VEH", "AbC").cache_key(), "veh-AbC");
    }

    #[test]
    fn entity_pair_validity() {
        assert!(pair("veh", "1234").is_valid());
        assert!(pair("SW", "1").is_valid());
        assert!(pair("admin", "ops-7").is_valid());
        assert!(!pair("", "1234").is_valid());
        assert!(!pair("veh", "  ").is_valid());
        assert!(!pair("plane", "1234").is_valid());
    }

    #[test]
    fn entity_token_request_requires_token() {
        let mut request = EntityTokenRequest {
            entity: "veh".to_string(),
            entity_id: "1234".to_string(),
            token: "token.test".to_string(),
        };
        assert!(request.is_valid());
        request.token = " ".to_string();
        assert!(!request.is_valid());
    }

    #[test]
    fn disconnect_request_requires_known_reason() {
        let mut request = DisconnectRequest {
            entity: "veh".to_string(),
            entity_id: "1234".to_string(),
            reason_code: ReasonCode::REAUTHENTICATE,
            next_server: String::new(),
        };
        assert!(request.is_valid());
        request.reason_code = ReasonCode(5);
        assert!(!request.is_valid());
    }

    #[test]
    fn decode_rejects_unknown_fields() {
        let body = r#"{"entity":"veh","entityid":"1234","token":"t","extra":1}"#;
        assert!(serde_json::from_str::<EntityTokenRequest>(body).is_err());
    }

    #[test]
    fn disconnect_next_server_defaults_to_empty() {
        let body = r#"{"entity":"sw","entityid":"12","reasonCode":152}"#;
        let decoded: DisconnectRequest = serde_json::from_str(body).unwrap();
        assert_eq!(decoded.reason_code, ReasonCode::NOT_AUTHORIZED);
        assert_eq!(decoded.next_server, "");
    }

    #[test]
    fn validate_token_request_attaches_mec() {
        let request = EntityTokenRequest {
            entity: "veh".to_string(),
            entity_id: "1234".to_string(),
            token: "test.test".to_string(),
        };
        let upstream = ValidateTokenRequest::new(&request, "rkln".to_string());
        let encoded = serde_json::to_value(&upstream).unwrap();
        assert_eq!(encoded["mec"], "rkln");
        assert_eq!(encoded["entityid"], "1234");
    }
}
