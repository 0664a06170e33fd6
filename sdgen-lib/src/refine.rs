//! Optional prompt refinement through a chat-completion API.
//!
//! Refinement is best-effort: any failure falls back to the raw prompt, so
//! generation never depends on the refinement service being reachable.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4.1";

/// Prompt used when the user supplied no text at all.
pub const FALLBACK_PROMPT: &str = "a high quality 2D game character illustration";

const SYSTEM_INSTRUCTION: &str = "You are a Stable Diffusion prompt engineer. \
Expand the user's short description into a detailed English prompt suited to \
high-quality 2D game graphics (illustrations, sprites). Describe style, \
lighting, composition and rendering quality concretely. Reply with the \
prompt only.";

const REFINE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: String,
}

pub struct PromptRefiner {
    api_base: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}
impl PromptRefiner {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        Ok(Self {
            api_base: DEFAULT_API_BASE.to_owned(),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_owned(),
            client: reqwest::ClientBuilder::new().timeout(REFINE_TIMEOUT).build()?,
        })
    }

    /// Points the refiner at another OpenAI-compatible endpoint.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Returns a refined prompt, or the input unchanged when refinement
    /// fails for any reason. Never an error.
    pub async fn refine(&self, raw: &str) -> String {
        if raw.trim().is_empty() {
            return FALLBACK_PROMPT.to_owned();
        }
        match self.try_refine(raw).await {
            Ok(refined) if !refined.is_empty() => {
                tracing::debug!(%refined, "prompt refined");
                refined
            }
            Ok(_) => {
                tracing::warn!("refinement returned empty content; using raw prompt");
                raw.to_owned()
            }
            Err(error) => {
                tracing::warn!(%error, "prompt refinement failed; using raw prompt");
                raw.to_owned()
            }
        }
    }

    async fn try_refine(&self, raw: &str) -> Result<String> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_INSTRUCTION.to_owned(),
                },
                ChatMessage {
                    role: "user",
                    content: format!(
                        "Turn this description into a Stable Diffusion prompt: {raw}"
                    ),
                },
            ],
            max_tokens: 200,
        };
        let response: ChatResponse = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?
            .json()
            .await?;
        Ok(response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.trim().to_owned())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_gets_the_fallback_prompt() {
        let refiner = PromptRefiner::new("test-key").unwrap();
        let refined = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(refiner.refine("   "));
        assert_eq!(refined, FALLBACK_PROMPT);
    }

    #[test]
    fn chat_request_shape_matches_the_api() {
        let request = ChatRequest {
            model: DEFAULT_MODEL.to_owned(),
            messages: vec![ChatMessage {
                role: "user",
                content: "a knight".to_owned(),
            }],
            max_tokens: 200,
        };
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["model"], DEFAULT_MODEL);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "a knight");
        assert_eq!(body["max_tokens"], 200);
    }

    #[test]
    fn unreachable_endpoint_falls_back_to_the_raw_prompt() {
        // Port 9 (discard) refuses connections on any sane test host.
        let refiner = PromptRefiner::new("test-key")
            .unwrap()
            .with_api_base("http://127.0.0.1:9");
        let refined = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(refiner.refine("a knight"));
        assert_eq!(refined, "a knight");
    }
}
