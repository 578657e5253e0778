use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use tether_config::CompactionConfig;
use tether_core::event::event_type;
use tether_core::{Event, EventBus, Message, Result, Role};
use tether_hooks::{HookDecision, HookEvent, HookExecutor, HookPayload};
use tether_llm::{Model, ModelRequest, ProviderPool};
use tether_session::FileSession;

const SUMMARIZER_SYSTEM_PROMPT: &str = "You are a precise conversation summarizer. \
Summarize the conversation so far, preserving the user's goals, key decisions, \
file paths and commands, errors and their resolutions, and the current state of \
progress. Output only the summary.";

/// Threshold-triggered history summarization, run at end-of-run. Estimates
/// the token footprint of the transcript (4 chars ~= 1 token plus tool-call
/// metadata) and, over threshold, replaces the middle of the history with a
/// model-written summary.
pub struct Compactor {
    config: CompactionConfig,
    pool: Arc<ProviderPool>,
    summarizer_model: String,
    fallback_model: Option<String>,
}

impl Compactor {
    pub fn new(
        config: CompactionConfig,
        pool: Arc<ProviderPool>,
        summarizer_model: String,
        fallback_model: Option<String>,
    ) -> Self {
        Self {
            config,
            pool,
            summarizer_model,
            fallback_model,
        }
    }

    /// Estimated token footprint of a transcript.
    pub fn estimate_tokens(messages: &[Message]) -> usize {
        messages.iter().map(|m| m.estimate_tokens()).sum()
    }

    /// Whether the history is over the configured threshold.
    pub fn over_threshold(&self, messages: &[Message]) -> bool {
        if !self.config.enabled || self.config.budget_tokens == 0 {
            return false;
        }
        if messages.len() <= self.config.preserve_count + 1 {
            return false;
        }
        let estimate = Self::estimate_tokens(messages) as f64;
        estimate / self.config.budget_tokens as f64 >= self.config.threshold
    }

    /// Run the compaction check; returns true when the history was replaced.
    /// Summarizer failures abort compaction only, never the run.
    pub async fn maybe_compact(
        &self,
        session: &FileSession,
        hooks: &HookExecutor,
        bus: &EventBus,
    ) -> Result<bool> {
        let messages = session.messages();
        if !self.over_threshold(&messages) {
            return Ok(false);
        }

        // A deny from any PreCompact hook skips compaction; the skip is
        // still visible as an event.
        let payload = HookPayload {
            session_id: session.id().to_string(),
            ..Default::default()
        };
        let outcome = hooks.fire(HookEvent::PreCompact, &payload).await?;
        bus.publish(
            Event::new(event_type::PRE_COMPACT, session.id())
                .with_payload(json!({ "messages": messages.len() })),
        );
        if outcome.decision == Some(HookDecision::Deny) {
            info!(session = %session.id(), "compaction skipped by hook");
            return Ok(false);
        }

        let split = split_history(&messages, &self.config);
        if split.old.is_empty() {
            return Ok(false);
        }

        let summary = match self.summarize(&split.old).await {
            Some(summary) => summary,
            None => {
                warn!(session = %session.id(), "summarization failed, compaction aborted");
                return Ok(false);
            }
        };

        let mut compacted =
            Vec::with_capacity(split.head.len() + split.preserved.len() + split.tail.len() + 2);
        compacted.extend(split.head.iter().cloned());
        compacted.extend(split.initial.iter().cloned());
        compacted.push(Message::system(format!("summary: {summary}")));
        compacted.extend(split.preserved.iter().cloned());
        compacted.extend(split.tail.iter().cloned());

        let before = messages.len();
        let after = compacted.len();
        session.replace_transcript(compacted)?;
        info!(session = %session.id(), before, after, "context compacted");
        bus.publish(
            Event::new(event_type::CONTEXT_COMPACTED, session.id())
                .with_payload(json!({ "before": before, "after": after })),
        );
        self.write_rollout(session.id(), before, after, &summary);
        Ok(true)
    }

    async fn summarize(&self, old: &[Message]) -> Option<String> {
        let prompt = render_transcript(old);
        let request = ModelRequest {
            model: self.summarizer_model.clone(),
            messages: vec![Message::user(prompt)],
            system: Some(SUMMARIZER_SYSTEM_PROMPT.to_string()),
            max_tokens: 2048,
            ..Default::default()
        };

        for attempt in 0..=self.config.max_retries {
            match self.try_model(&self.summarizer_model, &request).await {
                Some(summary) => return Some(summary),
                None => {
                    debug!(attempt, model = %self.summarizer_model, "summarizer attempt failed");
                    if attempt < self.config.max_retries {
                        tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                    }
                }
            }
        }
        if let Some(fallback) = &self.fallback_model {
            debug!(model = %fallback, "falling back for summarization");
            let mut fallback_request = request;
            fallback_request.model = fallback.clone();
            return self.try_model(fallback, &fallback_request).await;
        }
        None
    }

    async fn try_model(&self, name: &str, request: &ModelRequest) -> Option<String> {
        let model = self.pool.model(name).await.ok()?;
        let response = model.complete(request).await.ok()?;
        let summary = response.message.text_content();
        let trimmed = summary.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    fn write_rollout(&self, session_id: &str, before: usize, after: usize, summary: &str) {
        let Some(dir) = &self.config.rollout_dir else {
            return;
        };
        let artifact = json!({
            "session_id": session_id,
            "timestamp": chrono::Utc::now(),
            "before_messages": before,
            "after_messages": after,
            "summary": summary,
        });
        let write = || -> Result<()> {
            std::fs::create_dir_all(dir)?;
            let path = dir.join(format!("{session_id}-{}.json", uuid::Uuid::new_v4()));
            std::fs::write(path, serde_json::to_vec_pretty(&artifact)?)?;
            Ok(())
        };
        if let Err(e) = write() {
            warn!(error = %e, "rollout artifact write failed");
        }
    }
}

struct Split {
    head: Vec<Message>,
    initial: Vec<Message>,
    old: Vec<Message>,
    preserved: Vec<Message>,
    tail: Vec<Message>,
}

// head: leading consecutive system messages. tail: the last preserve_count
// messages. initial: the first initial_count non-system messages after the
// head. preserved: middle user messages worth user_text_tokens, most recent
// first.
fn split_history(messages: &[Message], config: &CompactionConfig) -> Split {
    let head_len = messages
        .iter()
        .take_while(|m| m.role == Role::System)
        .count();
    let tail_start = messages.len().saturating_sub(config.preserve_count).max(head_len);

    let head = messages[..head_len].to_vec();
    let tail = messages[tail_start..].to_vec();
    let middle = &messages[head_len..tail_start];

    let initial: Vec<Message> = middle.iter().take(config.initial_count).cloned().collect();
    let rest = &middle[initial.len().min(middle.len())..];

    let mut preserved: Vec<Message> = Vec::new();
    if config.user_text_tokens > 0 {
        let mut budget = config.user_text_tokens;
        for msg in rest.iter().rev() {
            if msg.role != Role::User {
                continue;
            }
            let cost = msg.estimate_tokens();
            if cost <= budget {
                budget -= cost;
                preserved.push(msg.clone());
            }
        }
        preserved.reverse();
    }

    let old: Vec<Message> = rest
        .iter()
        .filter(|m| !preserved.iter().any(|p| p.id == m.id && !p.id.is_empty()))
        .cloned()
        .collect();

    Split {
        head,
        initial,
        old,
        preserved,
        tail,
    }
}

fn render_transcript(messages: &[Message]) -> String {
    let mut out = String::from("Conversation to summarize:\n");
    for msg in messages {
        let role = match msg.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        out.push_str(&format!("[{role}] {}\n", msg.text_content().trim()));
    }
    out
}
