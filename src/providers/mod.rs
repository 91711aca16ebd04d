use crate::config::{get_api_key, AppConfig, ProviderKind, ProviderSettings};
use crate::error::AppError;
use crate::models::{ChatTurn, ProviderId};
use async_trait::async_trait;
use reqwest::Client;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

pub mod anthropic;
pub mod openai;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GenerationRequest {
    pub system_prompt: String,
    pub history: Vec<ChatTurn>,
    pub message: String,
    /// Image references; only the vision provider reads them.
    pub images: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
}

impl GenerationOptions {
    pub fn from_settings(settings: &ProviderSettings, model: &str) -> Self {
        Self {
            model: model.to_string(),
            temperature: settings.temperature.unwrap_or(0.8),
            max_tokens: settings.max_tokens.unwrap_or(512),
            top_p: settings.top_p.unwrap_or(0.95),
        }
    }
}

/// One upstream text-generation service.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn id(&self) -> ProviderId;

    async fn generate(&self, request: &GenerationRequest) -> Result<String, AppError>;
}

/// Shared by both adapters: try the primary model, then the alternate one. The caller only
/// sees the final text or the last error.
pub(crate) async fn with_model_fallback<F, Fut>(
    provider: ProviderId,
    settings: &ProviderSettings,
    mut call: F,
) -> Result<String, AppError>
where
    F: FnMut(GenerationOptions) -> Fut,
    Fut: std::future::Future<Output = Result<String, AppError>>,
{
    let primary = call(GenerationOptions::from_settings(settings, &settings.model)).await;
    let Some(fallback) = settings.fallback_model.as_deref() else {
        return primary;
    };

    match primary {
        Ok(text) if !text.trim().is_empty() => Ok(text),
        Ok(_) => {
            debug!(provider = provider.as_label(), fallback, "empty reply, trying alternate model");
            call(GenerationOptions::from_settings(settings, fallback)).await
        }
        Err(err) => {
            debug!(provider = provider.as_label(), fallback, error = %err, "model failed, trying alternate model");
            call(GenerationOptions::from_settings(settings, fallback)).await
        }
    }
}

/// Provider handles built once at startup and shared by every request.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<ProviderId, Arc<dyn GenerationProvider>>,
}

impl ProviderRegistry {
    #[cfg(test)]
    pub fn with_providers(providers: Vec<Arc<dyn GenerationProvider>>) -> Self {
        Self {
            providers: providers.into_iter().map(|p| (p.id(), p)).collect(),
        }
    }

    /// Entries without an API key are left out entirely.
    pub fn from_config(cfg: &AppConfig, client: Client) -> Self {
        let mut providers: BTreeMap<ProviderId, Arc<dyn GenerationProvider>> = BTreeMap::new();
        for (id, settings) in cfg.provider_entries() {
            let Some(api_key) = get_api_key(id) else {
                info!(provider = id.as_label(), "no API key found, provider disabled");
                continue;
            };
            let adapter: Arc<dyn GenerationProvider> = match settings.kind {
                ProviderKind::Openai => Arc::new(openai::OpenAiChatAdapter::new(
                    id,
                    client.clone(),
                    api_key,
                    settings.clone(),
                )),
                ProviderKind::Anthropic => Arc::new(anthropic::AnthropicAdapter::new(
                    id,
                    client.clone(),
                    api_key,
                    settings.clone(),
                )),
            };
            providers.insert(id, adapter);
        }
        Self { providers }
    }

    pub fn is_configured(&self, id: ProviderId) -> bool {
        self.providers.contains_key(&id)
    }

    pub fn get(&self, id: ProviderId) -> Option<Arc<dyn GenerationProvider>> {
        self.providers.get(&id).cloned()
    }

    pub fn configured_ids(&self) -> Vec<ProviderId> {
        self.providers.keys().copied().collect()
    }
}
