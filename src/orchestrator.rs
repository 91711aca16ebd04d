//! Per-message lifecycle: quota check, optional intent short-circuit, chain resolution,
//! provider fail-over, reply post-processing, then usage and audit writes in the background.
//!
//! The background writes are spawned before the reply is handed back and are never awaited
//! on the response path. Two near-simultaneous messages from one user can both read the same
//! counter before either writes, so increments are at-least-once under that race.

use crate::chain::ProviderChain;
use crate::config::{AppConfig, OrchestratorSettings};
use crate::error::{ChatError, ErrorPayload};
use crate::intent::IntentClassifier;
use crate::models::{
    AuditEntry, ChatFlags, ChatTurn, DenialReason, EligibilityDecision, Mode, ProviderId,
    QuotaSnapshot, ReplyStyle, Tier,
};
use crate::policy::{ChainPlan, TierPolicy};
use crate::providers::{GenerationProvider, GenerationRequest, ProviderRegistry};
use crate::quota::QuotaLedger;
use crate::storage::DocumentStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const TERMINATORS: [char; 4] = ['.', '!', '?', '।'];

/// Splits on sentence terminators, keeping each terminator run with its clause.
pub fn split_clauses(text: &str) -> Vec<String> {
    let mut clauses = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        current.push(ch);
        if !TERMINATORS.contains(&ch) {
            continue;
        }
        while let Some(&next) = chars.peek() {
            if !TERMINATORS.contains(&next) {
                break;
            }
            current.push(next);
            chars.next();
        }
        let clause = current.trim();
        if !clause.is_empty() {
            clauses.push(clause.to_string());
        }
        current.clear();
    }

    let rest = current.trim();
    if !rest.is_empty() {
        clauses.push(rest.to_string());
    }
    clauses
}

/// First two clauses joined by a space. A lone first clause comes back as is; a short
/// first clause does not cut the second one off.
pub fn shorten_reply(text: &str) -> String {
    match split_clauses(text).as_slice() {
        [] => String::new(),
        [only] => only.clone(),
        [first, second, ..] => format!("{first} {second}"),
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub uid: String,
    pub tier: Tier,
    pub mode: Mode,
    pub message: String,
    pub history: Vec<ChatTurn>,
    pub flags: ChatFlags,
}

#[derive(Debug)]
pub struct ChatReply {
    pub response: Result<String, ChatError>,
    /// Provider label for delivered replies (`policy` and `intent:*` for local answers).
    pub provider: Option<String>,
    pub remaining_total: i64,
    pub remaining_today: i64,
    background: Option<JoinHandle<()>>,
}

#[derive(Debug, Serialize)]
pub struct ChatReplyView<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<&'a str>,
    pub remaining_total: i64,
    pub remaining_today: i64,
}

impl ChatReply {
    fn failed(error: ChatError, remaining: (i64, i64)) -> Self {
        Self {
            response: Err(error),
            provider: None,
            remaining_total: remaining.0,
            remaining_today: remaining.1,
            background: None,
        }
    }

    pub fn view(&self) -> ChatReplyView<'_> {
        ChatReplyView {
            response: self.response.as_deref().ok(),
            error: self.response.as_ref().err().map(ChatError::payload),
            provider: self.provider.as_deref(),
            remaining_total: self.remaining_total,
            remaining_today: self.remaining_today,
        }
    }

    #[cfg(test)]
    pub fn has_background_work(&self) -> bool {
        self.background.is_some()
    }

    /// Waits for the usage/audit writes. Only short-lived callers such as the CLI need this.
    pub async fn settle(&mut self) {
        if let Some(handle) = self.background.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "background usage task did not finish");
            }
        }
    }
}

fn denial_error(decision: &EligibilityDecision) -> ChatError {
    match decision.reason {
        DenialReason::FreeTierExpired => ChatError::FreeTierExpired {
            days_expired: decision.days_expired.unwrap_or(0),
        },
        reason => ChatError::QuotaExceeded {
            reason,
            wait_seconds: decision.wait_seconds,
        },
    }
}

/// Allowed decisions already count the pending message; undo that when nothing is charged.
fn uncharged(decision: &EligibilityDecision) -> (i64, i64) {
    let restore = |value: i64| {
        if decision.allowed && value >= 0 {
            value + 1
        } else {
            value
        }
    };
    (
        restore(decision.remaining_total),
        restore(decision.remaining_today),
    )
}

fn validate(request: &ChatRequest) -> Result<(), ChatError> {
    if request.uid.trim().is_empty() {
        return Err(ChatError::InvalidInput("uid must not be empty".into()));
    }
    if request.message.trim().is_empty() && !request.flags.has_attachments() {
        return Err(ChatError::InvalidInput(
            "message must contain text or an attachment".into(),
        ));
    }
    Ok(())
}

pub struct Orchestrator {
    ledger: Arc<QuotaLedger>,
    store: Arc<dyn DocumentStore>,
    registry: ProviderRegistry,
    policy: TierPolicy,
    chain: ProviderChain,
    classifier: Option<Arc<dyn IntentClassifier>>,
    settings: OrchestratorSettings,
}

struct Delivery {
    text: String,
    provider: String,
    charge: bool,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn DocumentStore>, registry: ProviderRegistry, cfg: &AppConfig) -> Self {
        Self {
            ledger: Arc::new(QuotaLedger::new(store.clone(), cfg.quota.clone())),
            store,
            registry,
            policy: TierPolicy,
            chain: ProviderChain::new(cfg.chain),
            classifier: None,
            settings: cfg.orchestrator,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn IntentClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub async fn quota_snapshot(&self, uid: &str, tier: Tier) -> QuotaSnapshot {
        self.ledger.remaining_quota(uid, tier, Utc::now()).await
    }

    pub async fn check_and_consume(&self, request: ChatRequest) -> ChatReply {
        let now = Utc::now();

        if let Err(err) = validate(&request) {
            let snapshot = self.ledger.remaining_quota(&request.uid, request.tier, now).await;
            return ChatReply::failed(err, (snapshot.remaining_total, snapshot.remaining_today));
        }

        let decision = self.ledger.check(&request.uid, request.tier, now).await;
        if !decision.allowed {
            if !request.flags.voice_session {
                return ChatReply::failed(
                    denial_error(&decision),
                    (decision.remaining_total, decision.remaining_today),
                );
            }
            info!(uid = %request.uid, reason = ?decision.reason, "voice session bypasses quota denial");
        }

        match self.produce(&request).await {
            Ok(delivery) => self.deliver(&request, &decision, delivery, now),
            Err(err) => ChatReply::failed(err, uncharged(&decision)),
        }
    }

    /// Streams the reply in word chunks. A closed receiver ends the stream early; the usage
    /// and audit writes were already scheduled and run regardless.
    pub async fn check_and_consume_streaming(
        &self,
        request: ChatRequest,
        sink: mpsc::Sender<String>,
    ) -> ChatReply {
        let reply = self.check_and_consume(request).await;
        if let Ok(text) = &reply.response {
            stream_reply(text, &sink).await;
        }
        reply
    }

    async fn produce(&self, request: &ChatRequest) -> Result<Delivery, ChatError> {
        if let Some(classifier) = &self.classifier {
            if let Some(intent) = classifier.classify(&request.message) {
                info!(uid = %request.uid, intent = intent.kind.as_label(), "intent classifier answered");
                return Ok(Delivery {
                    text: intent.reply,
                    provider: format!("intent:{}", intent.kind.as_label()),
                    charge: true,
                });
            }
        }

        let chain = match self.policy.resolve_chain(
            request.tier,
            &request.mode,
            &request.flags,
            &self.registry,
        ) {
            ChainPlan::Refuse(text) => {
                info!(uid = %request.uid, tier = request.tier.as_label(), "restricted mode refused");
                return Ok(Delivery {
                    text: text.to_string(),
                    provider: "policy".into(),
                    charge: self.settings.charge_restricted_refusal,
                });
            }
            ChainPlan::Invoke(chain) => chain,
        };

        let providers: Vec<Arc<dyn GenerationProvider>> = chain
            .providers
            .iter()
            .filter_map(|id| self.registry.get(*id))
            .collect();
        let generation = GenerationRequest {
            system_prompt: chain.system_prompt.to_string(),
            history: request.history.clone(),
            message: request.message.clone(),
            images: request.flags.attachments.clone(),
        };

        let outcome = self.chain.invoke(&providers, &generation, chain.path).await;
        let Some(provider) = outcome.provider.filter(|_| !outcome.is_empty()) else {
            return Err(ChatError::ProviderChainExhausted {
                configured: self.registry.configured_ids(),
                attempted: outcome.attempted,
            });
        };

        let text = match request.flags.reply_style {
            ReplyStyle::Short => shorten_reply(&outcome.text),
            ReplyStyle::Full => outcome.text,
        };
        Ok(Delivery {
            text,
            provider: provider_label(provider),
            charge: true,
        })
    }

    fn deliver(
        &self,
        request: &ChatRequest,
        decision: &EligibilityDecision,
        delivery: Delivery,
        now: DateTime<Utc>,
    ) -> ChatReply {
        let remaining = if delivery.charge {
            (decision.remaining_total, decision.remaining_today)
        } else {
            uncharged(decision)
        };
        let entry = AuditEntry {
            uid: request.uid.clone(),
            mode: request.mode.as_label().to_string(),
            provider: delivery.provider.clone(),
            message: request.message.clone(),
            reply: delivery.text.clone(),
            created_at: now,
        };
        let background = self.record_in_background(request.uid.clone(), delivery.charge, entry, now);

        ChatReply {
            response: Ok(delivery.text),
            provider: Some(delivery.provider),
            remaining_total: remaining.0,
            remaining_today: remaining.1,
            background: Some(background),
        }
    }

    fn record_in_background(
        &self,
        uid: String,
        charge: bool,
        entry: AuditEntry,
        now: DateTime<Utc>,
    ) -> JoinHandle<()> {
        let ledger = Arc::clone(&self.ledger);
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if charge {
                if let Err(err) = ledger.increment(&uid, now).await {
                    warn!(uid = %uid, error = %err, "usage increment failed");
                }
            }
            if let Err(err) = store.append_audit(&entry).await {
                warn!(uid = %uid, error = %err, "audit append failed");
            }
        })
    }
}

fn provider_label(id: ProviderId) -> String {
    id.as_label().to_string()
}

/// Returns false when the receiver went away before the whole reply was sent.
pub async fn stream_reply(text: &str, sink: &mpsc::Sender<String>) -> bool {
    for chunk in text.split_inclusive(' ') {
        if sink.send(chunk.to_string()).await.is_err() {
            info!("client disconnected, stopping stream");
            return false;
        }
    }
    true
}
