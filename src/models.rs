use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Tier1,
    Tier2,
    Tier3,
    Expired,
    None,
}

impl Tier {
    /// Unknown labels fall back to `None`, which is rated like the free tier.
    pub fn parse(input: &str) -> Tier {
        match input.trim().to_ascii_lowercase().as_str() {
            "free" => Tier::Free,
            "tier1" => Tier::Tier1,
            "tier2" => Tier::Tier2,
            "tier3" => Tier::Tier3,
            "expired" => Tier::Expired,
            _ => Tier::None,
        }
    }

    pub fn as_label(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Tier1 => "tier1",
            Tier::Tier2 => "tier2",
            Tier::Tier3 => "tier3",
            Tier::Expired => "expired",
            Tier::None => "none",
        }
    }

    pub fn is_paid(self) -> bool {
        matches!(self, Tier::Tier1 | Tier::Tier2 | Tier::Tier3)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    General,
    Friend,
    Study,
    Planner,
    /// Night persona, paid tiers only.
    Restricted,
    Other(String),
}

impl Mode {
    pub fn parse(input: &str) -> Mode {
        let normalized = input.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "" | "general" => Mode::General,
            "friend" => Mode::Friend,
            "study" => Mode::Study,
            "planner" => Mode::Planner,
            "night" | "restricted" => Mode::Restricted,
            _ => Mode::Other(normalized),
        }
    }

    pub fn as_label(&self) -> &str {
        match self {
            Mode::General => "general",
            Mode::Friend => "friend",
            Mode::Study => "study",
            Mode::Planner => "planner",
            Mode::Restricted => "night",
            Mode::Other(label) => label,
        }
    }

    pub fn is_restricted(&self) -> bool {
        matches!(self, Mode::Restricted)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderId {
    Fast,
    General,
    Persona,
    Vision,
    NightPersona,
}

impl ProviderId {
    pub const ALL: [ProviderId; 5] = [
        ProviderId::Fast,
        ProviderId::General,
        ProviderId::Persona,
        ProviderId::Vision,
        ProviderId::NightPersona,
    ];

    pub fn parse(input: &str) -> Option<ProviderId> {
        match input.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "fast" => Some(ProviderId::Fast),
            "general" => Some(ProviderId::General),
            "persona" => Some(ProviderId::Persona),
            "vision" => Some(ProviderId::Vision),
            "night-persona" => Some(ProviderId::NightPersona),
            _ => None,
        }
    }

    pub fn as_label(self) -> &'static str {
        match self {
            ProviderId::Fast => "fast",
            ProviderId::General => "general",
            ProviderId::Persona => "persona",
            ProviderId::Vision => "vision",
            ProviderId::NightPersona => "night-persona",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub total_messages: u64,
    pub today_messages: u64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub daily_reset_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub created_at: DateTime<Utc>,
    pub tier: Tier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    None,
    FreeTierExpired,
    TotalCapReached,
    DailyCapReached,
    DailyCapReachedPaid,
    CooldownActive,
}

/// Outcome of an eligibility check. `-1` in a remaining field means unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EligibilityDecision {
    pub allowed: bool,
    pub remaining_total: i64,
    pub remaining_today: i64,
    pub reason: DenialReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_expired: Option<i64>,
}

impl EligibilityDecision {
    pub fn allow(remaining_total: i64, remaining_today: i64) -> Self {
        Self {
            allowed: true,
            remaining_total,
            remaining_today,
            reason: DenialReason::None,
            wait_seconds: None,
            days_expired: None,
        }
    }

    pub fn deny(reason: DenialReason, remaining_total: i64, remaining_today: i64) -> Self {
        Self {
            allowed: false,
            remaining_total,
            remaining_today,
            reason,
            wait_seconds: None,
            days_expired: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaSnapshot {
    pub remaining_total: i64,
    pub remaining_today: i64,
    pub unlimited: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_label(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

#[cfg(test)]
impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStyle {
    #[default]
    Full,
    Short,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatFlags {
    pub fast: bool,
    pub voice_session: bool,
    /// Image references forwarded to the vision provider.
    pub attachments: Vec<String>,
    pub reply_style: ReplyStyle,
}

impl ChatFlags {
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderResult {
    pub text: String,
    pub provider_id: ProviderId,
    pub ok: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub uid: String,
    pub mode: String,
    pub provider: String,
    pub message: String,
    pub reply: String,
    pub created_at: DateTime<Utc>,
}
