use crate::config::ProviderSettings;
use crate::error::AppError;
use crate::models::ProviderId;
use crate::providers::{with_model_fallback, GenerationOptions, GenerationProvider, GenerationRequest};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

/// OpenAI-compatible `/v1/chat/completions` endpoint (OpenAI, Groq, Together, OpenRouter...).
pub struct OpenAiChatAdapter {
    id: ProviderId,
    client: Client,
    api_key: String,
    settings: ProviderSettings,
}

impl OpenAiChatAdapter {
    pub fn new(id: ProviderId, client: Client, api_key: String, settings: ProviderSettings) -> Self {
        Self {
            id,
            client,
            api_key,
            settings,
        }
    }

    fn default_endpoint() -> &'static str {
        "https://api.openai.com/v1/chat/completions"
    }

    fn resolve_endpoint(base_url: Option<&str>) -> String {
        let Some(base) = base_url else {
            return Self::default_endpoint().to_string();
        };

        if let Ok(mut parsed) = url::Url::parse(base) {
            let path = parsed.path().trim_end_matches('/').to_string();
            if path.ends_with("/chat/completions") {
                return parsed.to_string();
            }
            if path.is_empty() {
                parsed.set_path("/v1/chat/completions");
            } else {
                parsed.set_path(&format!("{path}/chat/completions"));
            }
            return parsed.to_string();
        }
        base.to_string()
    }

    fn build_body(request: &GenerationRequest, opts: &GenerationOptions) -> Value {
        let mut messages = vec![json!({ "role": "system", "content": request.system_prompt })];
        for turn in &request.history {
            messages.push(json!({ "role": turn.role.as_label(), "content": turn.content }));
        }

        let user_content = if request.images.is_empty() {
            json!(request.message)
        } else {
            let mut parts = vec![json!({ "type": "text", "text": request.message })];
            for image in &request.images {
                parts.push(json!({ "type": "image_url", "image_url": { "url": image } }));
            }
            Value::Array(parts)
        };
        messages.push(json!({ "role": "user", "content": user_content }));

        json!({
            "model": opts.model,
            "messages": messages,
            "temperature": opts.temperature,
            "max_tokens": opts.max_tokens,
            "top_p": opts.top_p,
        })
    }

    fn parse_text(body: &Value) -> String {
        body.get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.pointer("/message/content"))
            .and_then(Value::as_str)
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
            .bearer_auth(&self.api_key)
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
impl GenerationProvider for OpenAiChatAdapter {
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
            model: "llama-3.1-8b-instant".into(),
            temperature: 0.7,
            max_tokens: 256,
            top_p: 0.9,
        }
    }

    #[test]
    fn resolve_endpoint_appends_chat_path() {
        assert_eq!(
            OpenAiChatAdapter::resolve_endpoint(None),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            OpenAiChatAdapter::resolve_endpoint(Some("https://api.groq.com/openai/v1")),
            "https://api.groq.com/openai/v1/chat/completions"
        );
        assert_eq!(
            OpenAiChatAdapter::resolve_endpoint(Some("http://localhost:8080/")),
            "http://localhost:8080/v1/chat/completions"
        );
        assert_eq!(
            OpenAiChatAdapter::resolve_endpoint(Some("https://x.ai/v1/chat/completions")),
            "https://x.ai/v1/chat/completions"
        );
    }

    #[test]
    fn build_body_orders_system_history_then_user() {
        let request = GenerationRequest {
            system_prompt: "be kind".into(),
            history: vec![ChatTurn::user("hi"), ChatTurn::assistant("hello!")],
            message: "how are you".into(),
            images: vec![],
        };
        let body = OpenAiChatAdapter::build_body(&request, &opts());
        let messages = body["messages"].as_array().expect("messages array");
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[3]["content"], "how are you");
        assert_eq!(body["model"], "llama-3.1-8b-instant");
        assert_eq!(body["max_tokens"], 256);
    }

    #[test]
    fn build_body_attaches_images_as_content_parts() {
        let request = GenerationRequest {
            system_prompt: String::new(),
            history: vec![],
            message: "what is this".into(),
            images: vec!["https://cdn.example.com/a.png".into()],
        };
        let body = OpenAiChatAdapter::build_body(&request, &opts());
        let content = &body["messages"][1]["content"];
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[1]["image_url"]["url"], "https://cdn.example.com/a.png");
    }

    #[test]
    fn parse_text_handles_missing_choices() {
        let body = json!({ "choices": [{ "message": { "content": "  hey there \n" } }] });
        assert_eq!(OpenAiChatAdapter::parse_text(&body), "hey there");
        assert_eq!(OpenAiChatAdapter::parse_text(&json!({ "error": "nope" })), "");
    }
}
