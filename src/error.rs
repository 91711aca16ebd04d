use crate::models::{DenialReason, ProviderId};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Sql(#[from] rusqlite::Error),

    #[error(transparent)]
    Keyring(#[from] keyring::Error),

    #[error(transparent)]
    Layered(#[from] ::config::ConfigError),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),
}

/// Request-level failures returned to the calling layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    #[error("quota exceeded: {reason:?}")]
    QuotaExceeded {
        reason: DenialReason,
        wait_seconds: Option<i64>,
    },

    #[error("free trial expired {days_expired} day(s) ago")]
    FreeTierExpired { days_expired: i64 },

    #[error("no generation provider produced a reply")]
    ProviderChainExhausted {
        configured: Vec<ProviderId>,
        attempted: Vec<ProviderId>,
    },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenialReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_expired: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configured: Option<Vec<ProviderId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempted: Option<Vec<ProviderId>>,
}

impl ChatError {
    pub fn kind(&self) -> &'static str {
        match self {
            ChatError::QuotaExceeded { .. } => "quota_exceeded",
            ChatError::FreeTierExpired { .. } => "free_tier_expired",
            ChatError::ProviderChainExhausted { .. } => "provider_chain_exhausted",
            ChatError::StoreUnavailable(_) => "store_unavailable",
            ChatError::InvalidInput(_) => "invalid_input",
        }
    }

    /// Text meant for the end user. Provider failures stay generic.
    pub fn user_message(&self) -> String {
        match self {
            ChatError::QuotaExceeded {
                reason,
                wait_seconds,
            } => match reason {
                DenialReason::TotalCapReached => {
                    "You have used all messages included in the free plan. Upgrade to keep chatting."
                        .to_string()
                }
                DenialReason::DailyCapReached => {
                    "You have reached today's free message limit. It resets at midnight.".to_string()
                }
                DenialReason::DailyCapReachedPaid => {
                    "You have reached today's message limit for your plan. It resets at midnight."
                        .to_string()
                }
                DenialReason::CooldownActive => format!(
                    "You're sending messages too quickly. Please wait {} second(s).",
                    wait_seconds.unwrap_or(1)
                ),
                DenialReason::FreeTierExpired | DenialReason::None => {
                    "You can't send messages right now.".to_string()
                }
            },
            ChatError::FreeTierExpired { days_expired } => format!(
                "Your free trial ended {} day(s) ago. Subscribe to continue.",
                days_expired
            ),
            ChatError::ProviderChainExhausted { .. } => {
                "The AI is unavailable right now. Please try again in a moment.".to_string()
            }
            ChatError::StoreUnavailable(_) => {
                "Something went wrong on our side. Please try again.".to_string()
            }
            ChatError::InvalidInput(detail) => format!("Invalid request: {detail}"),
        }
    }

    pub fn payload(&self) -> ErrorPayload {
        let mut payload = ErrorPayload {
            kind: self.kind(),
            message: self.user_message(),
            reason: None,
            wait_seconds: None,
            days_expired: None,
            configured: None,
            attempted: None,
        };
        match self {
            ChatError::QuotaExceeded {
                reason,
                wait_seconds,
            } => {
                payload.reason = Some(*reason);
                payload.wait_seconds = *wait_seconds;
            }
            ChatError::FreeTierExpired { days_expired } => {
                payload.reason = Some(DenialReason::FreeTierExpired);
                payload.days_expired = Some(*days_expired);
            }
            ChatError::ProviderChainExhausted {
                configured,
                attempted,
            } => {
                payload.configured = Some(configured.clone());
                payload.attempted = Some(attempted.clone());
            }
            ChatError::StoreUnavailable(_) | ChatError::InvalidInput(_) => {}
        }
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_message_mentions_wait_time() {
        let err = ChatError::QuotaExceeded {
            reason: DenialReason::CooldownActive,
            wait_seconds: Some(2),
        };
        assert_eq!(err.kind(), "quota_exceeded");
        assert!(err.user_message().contains("wait 2 second"));
    }

    #[test]
    fn exhausted_payload_lists_providers_without_detail() {
        let err = ChatError::ProviderChainExhausted {
            configured: vec![ProviderId::Fast, ProviderId::General],
            attempted: vec![ProviderId::Fast],
        };
        let json = serde_json::to_value(err.payload()).expect("serialize payload");
        assert_eq!(json["kind"], "provider_chain_exhausted");
        assert_eq!(json["configured"], serde_json::json!(["fast", "general"]));
        assert_eq!(json["attempted"], serde_json::json!(["fast"]));
        assert!(json.get("reason").is_none());
    }

    #[test]
    fn expiry_payload_carries_days() {
        let payload = ChatError::FreeTierExpired { days_expired: 3 }.payload();
        assert_eq!(payload.days_expired, Some(3));
        assert_eq!(payload.reason, Some(DenialReason::FreeTierExpired));
    }
}
