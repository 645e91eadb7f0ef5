//! Tracking tokens embedded in outbound mail.
//!
//! The mail dispatcher reports delivery/open/click events asynchronously; the
//! token carried in each message correlates those callbacks back to the
//! execution, node and (when under A/B test) variant that produced the send.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingToken {
    #[serde(rename = "e")]
    pub execution_id: Uuid,
    #[serde(rename = "n")]
    pub node_id: String,
    #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<String>,
    /// Stored course-cycle email that produced the send.
    #[serde(rename = "c", default, skip_serializing_if = "Option::is_none")]
    pub cycle_email_id: Option<Uuid>,
}

impl TrackingToken {
    pub fn new(execution_id: Uuid, node_id: impl Into<String>, variant_id: Option<String>) -> Self {
        Self {
            execution_id,
            node_id: node_id.into(),
            variant_id,
            cycle_email_id: None,
        }
    }

    pub fn with_cycle_email(mut self, cycle_email_id: Uuid) -> Self {
        self.cycle_email_id = Some(cycle_email_id);
        self
    }

    /// URL-safe opaque encoding.
    pub fn encode(&self) -> String {
        // Serializing a struct of a Uuid and strings cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    /// Returns `None` for anything that was not produced by `encode`.
    pub fn decode(token: &str) -> Option<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(token.trim()).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_correlates_variant() {
        let execution_id = Uuid::new_v4();
        let token = TrackingToken::new(execution_id, "email-1", Some("B".into()));
        let encoded = token.encode();
        assert!(!encoded.contains('='));
        assert!(!encoded.contains('/'));

        let decoded = TrackingToken::decode(&encoded).unwrap();
        assert_eq!(decoded.execution_id, execution_id);
        assert_eq!(decoded.node_id, "email-1");
        assert_eq!(decoded.variant_id.as_deref(), Some("B"));
        assert!(decoded.cycle_email_id.is_none());
    }

    #[test]
    fn test_token_carries_cycle_email() {
        let email_id = Uuid::new_v4();
        let token = TrackingToken::new(Uuid::new_v4(), "course-email", None).with_cycle_email(email_id);
        let decoded = TrackingToken::decode(&token.encode()).unwrap();
        assert_eq!(decoded.cycle_email_id, Some(email_id));
        assert!(decoded.variant_id.is_none());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(TrackingToken::decode("not a token").is_none());
        assert!(TrackingToken::decode(&URL_SAFE_NO_PAD.encode(b"{}")).is_none());
    }
}
