use crate::config::ProviderSettings;
use crate::error::AppError;
use crate::models::{ProviderId, Role};
use crate::providers::{with_model_fallback, GenerationOptions, GenerationProvider, GenerationRequest};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

const API_VERSION: &str = "2023-06-01";

fn push_turn(turns: &mut Vec<(Role, String)>, role: Role, content: &str) {
    if let Some((last_role, last_content)) = turns.last_mut() {
        if *last_role == role {
            last_content.push('\n');
            last_content.push_str(content);
            return;
        }
    }
    turns.push((role, content.to_string()));
}

pub struct AnthropicAdapter {
    id: ProviderId,
    client: Client,
    api_key: String,
    settings: ProviderSettings,
}

impl AnthropicAdapter {
    pub fn new(id: ProviderId, client: Client, api_key: String, settings: ProviderSettings) -> Self {
        Self {
            id,
            client,
            api_key,
            settings,
        }
    }

    fn default_endpoint() -> &'static str {
        "https://api.anthropic.com/v1/messages"
    }

    fn resolve_endpoint(base_url: Option<&str>) -> String {
        let Some(base) = base_url else {
            return Self::default_endpoint().to_string();
        };

        if let Ok(mut parsed) = url::Url::parse(base) {
            let path = parsed.path().trim_end_matches('/').to_string();
            if path.is_empty() || path == "/v1" {
                parsed.set_path("/v1/messages");
                return parsed.to_string();
            }
            if path.ends_with("/v1/messages") {
                return parsed.to_string();
            }
        }
        base.to_string()
    }

    /// The messages API wants alternating turns starting with `user`; leading assistant turns
    /// are dropped and consecutive same-role turns are merged.
    fn build_body(request: &GenerationRequest, opts: &GenerationOptions) -> Value {
        let mut turns: Vec<(Role, String)> = Vec::new();
        for turn in &request.history {
            if turns.is_empty() && turn.role == Role::Assistant {
                continue;
            }
            push_turn(&mut turns, turn.role, &turn.content);
        }
        push_turn(&mut turns, Role::User, &request.message);

        let messages: Vec<Value> = turns
            .into_iter()
            .map(|(role, content)| json!({ "role": role.as_label(), "content": content }))
            .collect();

        json!({
            "model": opts.model,
            "system": request.system_prompt,
            "messages": messages,
            "temperature": opts.temperature,
            "max_tokens": opts.max_tokens,
            "top_p": opts.top_p,
        })
    }

    fn parse_text(body: &Value) -> String {
        body.get("content")
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default()
            .trim()
            .to_string()
    }

    async fn complete(
        &self,
        request: &GenerationRequest,
        opts: GenerationOptions,
    ) -> Result<String, AppError> {
        let url = Self::resolve_endpoint(self.settings.base_url.as_deref());
        let response = self
            .client
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&Self::build_body(request, &opts))
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(AppError::Provider(format!(
                "{} rejected credentials (unauthorized).",
                self.id.as_label()
            )));
        }
        let body: Value = response.error_for_status()?.json().await?;
        Ok(Self::parse_text(&body))
    }
}

#[async_trait]
impl GenerationProvider for AnthropicAdapter {
    fn id(&self) -> ProviderId {
        self.id
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, AppError> {
        with_model_fallback(self.id, &self.settings, |opts| self.complete(request, opts)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChatTurn;

    fn opts() -> GenerationOptions {
        GenerationOptions {
            model: "claude-3-5-haiku-latest".into(),
            temperature: 0.8,
            max_tokens: 400,
            top_p: 0.95,
        }
    }

    #[test]
    fn resolve_endpoint_defaults_and_normalizes() {
        assert_eq!(
            AnthropicAdapter::resolve_endpoint(None),
            "https://api.anthropic.com/v1/messages"
        );
        assert_eq!(
            AnthropicAdapter::resolve_endpoint(Some("https://proxy.local/v1/")),
            "https://proxy.local/v1/messages"
        );
    }

    #[test]
    fn build_body_alternates_roles_starting_with_user() {
        let request = GenerationRequest {
            system_prompt: "night persona".into(),
            history: vec![
                ChatTurn::assistant("welcome back"),
                ChatTurn::user("hey"),
                ChatTurn::user("you there?"),
                ChatTurn::assistant("always"),
            ],
            message: "tell me a story".into(),
            images: vec![],
        };
        let body = AnthropicAdapter::build_body(&request, &opts());
        let messages = body["messages"].as_array().expect("messages array");
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[0]["content"], "hey\nyou there?");
        assert_eq!(messages[2]["content"], "tell me a story");
        assert_eq!(body["system"], "night persona");
    }

    #[test]
    fn parse_text_joins_text_blocks() {
        let body = json!({
            "content": [
                { "type": "text", "text": "Hello" },
                { "type": "tool_use", "name": "x" },
                { "type": "text", "text": " there." }
            ]
        });
        assert_eq!(AnthropicAdapter::parse_text(&body), "Hello there.");
    }
}
