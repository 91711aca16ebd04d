use crate::models::{ChatFlags, Mode, ProviderId, Tier};
use crate::providers::ProviderRegistry;

pub const RESTRICTED_REFUSAL: &str =
    "Night mode is available on the Tier 2 and Tier 3 plans. Upgrade to unlock it.";

const GENERIC_PROMPT: &str = "You are a helpful, friendly AI assistant. Answer clearly and briefly.";
const FRIEND_PROMPT: &str =
    "You are a warm, caring companion. Talk casually, remember what the user shares, keep replies short.";
const STUDY_PROMPT: &str =
    "You are a patient tutor. Explain step by step and check the user's understanding.";
const PLANNER_PROMPT: &str =
    "You help the user organise their day: schedules, reminders and expenses. Be concise.";
const NIGHT_PROMPT: &str =
    "You are a flirty late-night companion for verified adult users. Stay respectful and consensual.";

/// Which latency budget a chain runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainPath {
    LowLatency,
    Standard,
}

impl ChainPath {
    pub fn for_flags(flags: &ChatFlags) -> Self {
        if flags.fast || flags.voice_session {
            ChainPath::LowLatency
        } else {
            ChainPath::Standard
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedChain {
    pub providers: Vec<ProviderId>,
    pub system_prompt: &'static str,
    pub path: ChainPath,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainPlan {
    /// Answer with fixed text; no provider is called.
    Refuse(&'static str),
    Invoke(ResolvedChain),
}

pub fn system_prompt_for(mode: &Mode) -> &'static str {
    match mode {
        Mode::General | Mode::Other(_) => GENERIC_PROMPT,
        Mode::Friend => FRIEND_PROMPT,
        Mode::Study => STUDY_PROMPT,
        Mode::Planner => PLANNER_PROMPT,
        Mode::Restricted => NIGHT_PROMPT,
    }
}

pub fn restricted_mode_permitted(tier: Tier) -> bool {
    matches!(tier, Tier::Tier2 | Tier::Tier3)
}

/// Maps tier and mode to an ordered provider chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct TierPolicy;

impl TierPolicy {
    pub fn resolve_chain(
        &self,
        tier: Tier,
        mode: &Mode,
        flags: &ChatFlags,
        registry: &ProviderRegistry,
    ) -> ChainPlan {
        let ordered = if mode.is_restricted() {
            if !restricted_mode_permitted(tier) {
                return ChainPlan::Refuse(RESTRICTED_REFUSAL);
            }
            vec![ProviderId::NightPersona, ProviderId::General]
        } else {
            let head = if flags.has_attachments() {
                ProviderId::Vision
            } else {
                ProviderId::Fast
            };
            if flags.fast {
                vec![ProviderId::General, head, ProviderId::Persona]
            } else {
                vec![head, ProviderId::General, ProviderId::Persona]
            }
        };

        ChainPlan::Invoke(ResolvedChain {
            providers: ordered
                .into_iter()
                .filter(|id| registry.is_configured(*id))
                .collect(),
            system_prompt: system_prompt_for(mode),
            path: ChainPath::for_flags(flags),
        })
    }
}
