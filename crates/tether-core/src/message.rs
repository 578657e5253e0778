use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tool::ToolCall;

/// A message in a conversation transcript. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique within a session. Assigned by the session on append if empty.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub session_id: String,
    pub role: Role,
    pub content: Vec<ContentBlock>,
    /// Tool calls requested by the assistant in this message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Assigned by the session on append if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single content block within a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        /// Base64-encoded media payload.
        data: String,
        media_type: String,
    },
    Document {
        data: String,
        media_type: String,
    },
    ToolUse {
        tool_use_id: String,
        name: String,
        arguments: serde_json::Map<String, serde_json::Value>,
    },
    ToolResult {
        tool_use_id: String,
        output: String,
        #[serde(default)]
        is_error: bool,
    },
}

impl Message {
    /// Create a simple text message.
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            session_id: String::new(),
            role,
            content: vec![ContentBlock::Text { text: text.into() }],
            tool_calls: vec![],
            timestamp: None,
            metadata: Default::default(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(Role::Assistant, text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::text(Role::System, text)
    }

    /// Build a tool-role message carrying a single tool result block.
    pub fn tool_result(tool_use_id: impl Into<String>, output: impl Into<String>, is_error: bool) -> Self {
        let mut msg = Self::text(Role::Tool, "");
        msg.content = vec![ContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            output: output.into(),
            is_error,
        }];
        msg
    }

    /// Extract all text content joined together.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Estimate token count for this message.
    /// Uses a simple heuristic: ~4 chars per token, plus tool-call metadata.
    pub fn estimate_tokens(&self) -> usize {
        let mut chars = 0usize;

        // Role overhead (~4 tokens for role markers)
        chars += 16;

        for block in &self.content {
            match block {
                ContentBlock::Text { text } => chars += text.len(),
                ContentBlock::ToolResult {
                    output, tool_use_id, ..
                } => {
                    chars += output.len();
                    chars += tool_use_id.len();
                }
                ContentBlock::ToolUse {
                    name, arguments, ..
                } => {
                    chars += name.len();
                    chars += serde_json::Value::Object(arguments.clone()).to_string().len();
                }
                ContentBlock::Image { data, .. } | ContentBlock::Document { data, .. } => {
                    chars += data.len().min(1000)
                }
            }
        }

        for tc in &self.tool_calls {
            chars += tc.name.len();
            chars += tc.id.len();
            chars += serde_json::Value::Object(tc.arguments.clone()).to_string().len();
        }

        (chars / 4).max(1)
    }
}

/// Validate a session id token: non-empty, alphanumerics plus dash/underscore.
pub fn validate_session_id(id: &str) -> crate::Result<()> {
    if id.is_empty() {
        return Err(crate::TetherError::InvalidSessionId(id.to_string()));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(crate::TetherError::InvalidSessionId(id.to_string()));
    }
    Ok(())
}

/// Replace path-unsafe characters in a session id for filesystem use.
pub fn sanitize_session_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}
