//! Sequential fail-over across generation providers.
//!
//! Providers run one at a time. Each attempt is bounded by a timeout; errors, timeouts and
//! empty replies all advance to the next provider and are never surfaced to the caller.

use crate::config::ChainSettings;
use crate::models::{ChatTurn, ProviderId, ProviderResult};
use crate::policy::ChainPath;
use crate::providers::{GenerationProvider, GenerationRequest};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Keeps the most recent `limit` turns.
pub fn truncate_history(history: &[ChatTurn], limit: usize) -> Vec<ChatTurn> {
    let start = history.len().saturating_sub(limit);
    history[start..].to_vec()
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChainOutcome {
    /// Empty when every provider failed.
    pub text: String,
    pub provider: Option<ProviderId>,
    pub attempted: Vec<ProviderId>,
}

impl ChainOutcome {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProviderChain {
    settings: ChainSettings,
}

impl ProviderChain {
    pub fn new(settings: ChainSettings) -> Self {
        Self { settings }
    }

    pub fn timeout_for(&self, path: ChainPath) -> Duration {
        match path {
            ChainPath::LowLatency => Duration::from_millis(self.settings.low_latency_timeout_ms),
            ChainPath::Standard => Duration::from_millis(self.settings.standard_timeout_ms),
        }
    }

    pub fn history_limit_for(&self, path: ChainPath) -> usize {
        match path {
            ChainPath::LowLatency => self.settings.low_latency_history,
            ChainPath::Standard => self.settings.standard_history,
        }
    }

    async fn attempt(
        provider: &dyn GenerationProvider,
        request: &GenerationRequest,
        timeout: Duration,
    ) -> ProviderResult {
        let id = provider.id();
        // Dropping the timed-out future aborts the in-flight HTTP call.
        let text = match tokio::time::timeout(timeout, provider.generate(request)).await {
            Ok(Ok(text)) => text,
            Ok(Err(err)) => {
                warn!(provider = id.as_label(), error = %err, "provider failed");
                String::new()
            }
            Err(_) => {
                warn!(
                    provider = id.as_label(),
                    timeout_ms = timeout.as_millis() as u64,
                    "provider timed out"
                );
                String::new()
            }
        };
        let ok = !text.trim().is_empty();
        ProviderResult {
            text,
            provider_id: id,
            ok,
        }
    }

    pub async fn invoke(
        &self,
        providers: &[Arc<dyn GenerationProvider>],
        request: &GenerationRequest,
        path: ChainPath,
    ) -> ChainOutcome {
        let timeout = self.timeout_for(path);
        let request = GenerationRequest {
            history: truncate_history(&request.history, self.history_limit_for(path)),
            ..request.clone()
        };

        let mut attempted = Vec::with_capacity(providers.len());
        for provider in providers {
            let result = Self::attempt(provider.as_ref(), &request, timeout).await;
            attempted.push(result.provider_id);
            if result.ok {
                debug!(provider = result.provider_id.as_label(), attempts = attempted.len(), "chain produced a reply");
                return ChainOutcome {
                    text: result.text,
                    provider: Some(result.provider_id),
                    attempted,
                };
            }
            debug!(provider = result.provider_id.as_label(), "empty result, advancing chain");
        }

        warn!(attempted = ?attempted, "every provider in the chain failed");
        ChainOutcome {
            text: String::new(),
            provider: None,
            attempted,
        }
    }
}
