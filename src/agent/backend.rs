//! Reasoning backend capability.
//!
//! The execution loop asks a [`ReasoningBackend`] for one [`Decision`] per
//! round. [`GenaiBackend`] talks to a model through `genai`; tests use a
//! scripted implementation. Backend errors never abort the loop: they become
//! failed observations.

use std::time::Duration;

use futures::future::BoxFuture;
use futures::StreamExt;
use genai::chat::{ChatMessage, ChatOptions, ChatRequest, ChatStreamEvent};
use genai::Client;

use super::actions::Decision;
use super::history::{HistoryEntry, HistoryRole};
use crate::error::BackendError;
use crate::org::AgentId;
use crate::tools::ToolSpec;

/// Everything the backend needs to choose the next action.
#[derive(Debug, Clone)]
pub struct DecisionRequest {
    pub agent: AgentId,
    pub rank: u8,
    pub objective: String,
    pub system_prompt: String,
    pub history: Vec<HistoryEntry>,
    pub tools: Vec<ToolSpec>,
    pub round: u32,
}

pub trait ReasoningBackend: Send + Sync {
    fn decide<'a>(&'a self, request: &'a DecisionRequest) -> BoxFuture<'a, Result<Decision, BackendError>>;
}

/// Extract the decision object from a completion. Models often wrap JSON in
/// prose or code fences, so everything between the first `{` and the last
/// `}` is parsed.
pub fn parse_decision(text: &str) -> Result<Decision, BackendError> {
    let start = text.find('{');
    let end = text.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if e > s => &text[s..=e],
        _ => return Err(BackendError::Malformed("no JSON object in completion".to_string())),
    };
    serde_json::from_str(json).map_err(|e| BackendError::Malformed(e.to_string()))
}

/// Backend driving a chat model through `genai`.
pub struct GenaiBackend {
    client: Client,
    model: String,
}

impl GenaiBackend {
    pub fn new(model: &str) -> Self {
        Self {
            client: Client::default(),
            model: model.to_string(),
        }
    }

    fn chat_request(request: &DecisionRequest) -> ChatRequest {
        let mut chat_req = ChatRequest::from_system(&request.system_prompt);
        for entry in &request.history {
            let message = match entry.role {
                HistoryRole::Thought | HistoryRole::Action => ChatMessage::assistant(&entry.content),
                HistoryRole::Task | HistoryRole::Message | HistoryRole::Observation | HistoryRole::Memory => {
                    ChatMessage::user(&entry.content)
                }
            };
            chat_req = chat_req.append_message(message);
        }
        chat_req.append_message(ChatMessage::user(format!(
            "Round {}. Choose your next action for: {}",
            request.round, request.objective
        )))
    }

    async fn complete(&self, request: &DecisionRequest) -> Result<Decision, BackendError> {
        let chat_options = ChatOptions::default().with_capture_content(true);
        let stream_res = self
            .client
            .exec_chat_stream(&self.model, Self::chat_request(request), Some(&chat_options))
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;

        let mut stream = stream_res.stream;
        let mut captured_text: Option<String> = None;
        while let Some(event) = stream.next().await {
            match event {
                Ok(ChatStreamEvent::End(end)) => {
                    if let Some(text) = end.captured_first_text() {
                        captured_text = Some(text.to_string());
                    }
                }
                Ok(_) => {}
                Err(e) => return Err(BackendError::Request(e.to_string())),
            }
        }

        let text = captured_text.ok_or_else(|| BackendError::Malformed("empty completion".to_string()))?;
        tracing::debug!(agent = %request.agent, round = request.round, chars = text.len(), "Completion received");
        parse_decision(&text)
    }
}

impl ReasoningBackend for GenaiBackend {
    fn decide<'a>(&'a self, request: &'a DecisionRequest) -> BoxFuture<'a, Result<Decision, BackendError>> {
        Box::pin(self.complete(request))
    }
}

/// Validate that Ollama is running and `model` is available.
pub async fn check_backend_ready(model: &str) -> Result<(), BackendError> {
    let http = reqwest::Client::new();

    let base_url = "http://localhost:11434/";
    http.get(base_url)
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .map_err(|e| BackendError::Unavailable {
            url: base_url.to_string(),
            message: format!("Is Ollama running? {e}"),
        })?;

    let show_url = "http://localhost:11434/api/show";
    let resp = http
        .post(show_url)
        .json(&serde_json::json!({ "model": model }))
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .map_err(|e| BackendError::ModelNotAvailable {
            model: model.to_string(),
            message: format!("Failed to query model info: {e}"),
        })?;

    if !resp.status().is_success() {
        return Err(BackendError::ModelNotAvailable {
            model: model.to_string(),
            message: format!(
                "Model not found (HTTP {}). Run `ollama pull {model}` to download it.",
                resp.status()
            ),
        });
    }

    Ok(())
}
