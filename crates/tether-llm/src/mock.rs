//! Mock model for deterministic testing.
//!
//! Returns pre-configured responses without making any network calls.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use tether_core::{Message, Result, Role, TetherError, ToolCall};

use crate::provider::{
    Model, ModelProvider, ModelRequest, ModelResponse, StopReason, StreamChunk, Usage,
};

/// A pre-configured response from the mock model.
#[derive(Clone)]
pub struct MockResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: StopReason,
    pub usage: Usage,
    /// If set, the model returns this error instead.
    pub error: Option<String>,
}

impl Default for MockResponse {
    fn default() -> Self {
        Self {
            text: String::new(),
            tool_calls: vec![],
            stop_reason: StopReason::EndTurn,
            usage: Usage {
                input_tokens: 100,
                output_tokens: 50,
                cache_tokens: 0,
            },
            error: None,
        }
    }
}

impl MockResponse {
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ..Default::default()
        }
    }

    pub fn error(msg: &str) -> Self {
        Self {
            error: Some(msg.to_string()),
            ..Default::default()
        }
    }
}

/// A mock model that pops queued responses in order.
pub struct MockModel {
    name: String,
    responses: Arc<Mutex<Vec<MockResponse>>>,
    /// Requests received, for assertions in tests.
    requests: Arc<Mutex<Vec<ModelRequest>>>,
}

impl MockModel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            responses: Arc::new(Mutex::new(vec![])),
            requests: Arc::new(Mutex::new(vec![])),
        }
    }

    /// Queue a simple text response.
    pub fn with_response(self, text: &str) -> Self {
        self.responses.lock().push(MockResponse::text(text));
        self
    }

    /// Queue a tool-call response.
    pub fn with_tool_call(self, name: &str, args: serde_json::Value) -> Self {
        let arguments = args.as_object().cloned().unwrap_or_default();
        self.responses.lock().push(MockResponse {
            tool_calls: vec![ToolCall {
                id: format!("call_{}", uuid::Uuid::new_v4()),
                name: name.to_string(),
                arguments,
            }],
            stop_reason: StopReason::ToolUse,
            ..Default::default()
        });
        self
    }

    /// Queue an error response.
    pub fn with_error(self, error: &str) -> Self {
        self.responses.lock().push(MockResponse::error(error));
        self
    }

    /// Queue a fully custom response.
    pub fn with_mock_response(self, resp: MockResponse) -> Self {
        self.responses.lock().push(resp);
        self
    }

    /// All requests made against this model.
    pub fn recorded_requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().clone()
    }

    pub fn requests_made(&self) -> usize {
        self.requests.lock().len()
    }

    fn next_response(&self) -> MockResponse {
        let mut responses = self.responses.lock();
        if responses.is_empty() {
            MockResponse::text("(mock: no more queued responses)")
        } else {
            responses.remove(0)
        }
    }
}

#[async_trait]
impl Model for MockModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse> {
        self.requests.lock().push(request.clone());
        let mock = self.next_response();
        if let Some(error) = mock.error {
            return Err(TetherError::UpstreamUnavailable(error));
        }
        let mut msg = Message::text(Role::Assistant, mock.text);
        msg.tool_calls = mock.tool_calls;
        Ok(ModelResponse {
            message: msg,
            usage: mock.usage,
            stop_reason: mock.stop_reason,
        })
    }

    async fn complete_stream(&self, request: &ModelRequest) -> Result<mpsc::Receiver<StreamChunk>> {
        self.requests.lock().push(request.clone());
        let mock = self.next_response();
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            if let Some(error) = mock.error {
                let _ = tx.send(StreamChunk::Error(error)).await;
                return;
            }
            // Stream the text word by word.
            if !mock.text.is_empty() {
                let words: Vec<&str> = mock.text.split_whitespace().collect();
                for (i, word) in words.iter().enumerate() {
                    let delta = if i + 1 == words.len() {
                        (*word).to_string()
                    } else {
                        format!("{word} ")
                    };
                    let _ = tx.send(StreamChunk::TextDelta(delta)).await;
                }
            }
            for tc in mock.tool_calls {
                let _ = tx.send(StreamChunk::ToolCall(tc)).await;
            }
            let _ = tx.send(StreamChunk::Usage(mock.usage)).await;
            let _ = tx.send(StreamChunk::Done(mock.stop_reason)).await;
        });

        Ok(rx)
    }
}

/// Provider that hands out a single shared [`MockModel`] for every name.
pub struct MockModelProvider {
    model: Arc<MockModel>,
}

impl MockModelProvider {
    pub fn new(model: MockModel) -> Self {
        Self {
            model: Arc::new(model),
        }
    }

    pub fn shared(model: Arc<MockModel>) -> Self {
        Self { model }
    }

    pub fn model_handle(&self) -> Arc<MockModel> {
        Arc::clone(&self.model)
    }
}

#[async_trait]
impl ModelProvider for MockModelProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn model(&self, _name: &str) -> Result<Arc<dyn Model>> {
        Ok(Arc::clone(&self.model) as Arc<dyn Model>)
    }
}
