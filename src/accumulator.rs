use crate::constants::CODE_FENCE;
use crate::normalizer::{closing_deficit, ContentNormalizer, NormalizerConfig};
use crate::scheduler::UpdateHandle;
use crate::types::{AssistantMessage, ConversationContext, StreamEvent};

/// Builds one assistant message out of streamed fragments.
pub struct MessageAccumulator {
    message: AssistantMessage,
    normalizer: ContentNormalizer,
    context: ConversationContext,
    updates: Option<UpdateHandle>,
    frozen: bool,
}

impl MessageAccumulator {
    pub fn new(config: NormalizerConfig) -> Self {
        Self {
            message: AssistantMessage::new(),
            normalizer: ContentNormalizer::new(config),
            context: ConversationContext::default(),
            updates: None,
            frozen: false,
        }
    }

    /// Every non-empty append is mirrored to `handle` for throttled rendering.
    pub fn with_updates(mut self, handle: UpdateHandle) -> Self {
        self.updates = Some(handle);
        self
    }

    pub fn append(&mut self, raw: &str) -> &str {
        if self.frozen {
            tracing::debug!("[ACCUMULATOR] Ignoring {} chars after freeze", raw.len());
            return &self.message.content;
        }
        let normalized = self.normalizer.normalize(raw);
        if !normalized.is_empty() {
            self.message.content.push_str(&normalized);
            if let Some(updates) = &self.updates {
                updates.request_update(&normalized);
            }
        }
        &self.message.content
    }

    /// Replaces the held context; empty sequences never overwrite it.
    pub fn capture_context(&mut self, tokens: &[i64]) -> bool {
        if self.frozen || tokens.is_empty() {
            return false;
        }
        tracing::debug!("[ACCUMULATOR] Captured context of {} tokens", tokens.len());
        self.context = ConversationContext::new(tokens.to_vec());
        true
    }

    pub fn ingest(&mut self, event: &StreamEvent) {
        self.append(event.text());
        self.capture_context(event.tokens());
    }

    /// Closes a dangling code fence, then open boxed constructs, and freezes the message.
    pub fn finalize(&mut self) -> &str {
        if !self.frozen {
            if self.normalizer.in_code_block() {
                tracing::debug!("[ACCUMULATOR] Closing unterminated code fence");
                let fence = format!("\n{}", CODE_FENCE);
                self.message.content.push_str(&fence);
                if let Some(updates) = &self.updates {
                    updates.request_update(&fence);
                }
            }
            let deficit = closing_deficit(&self.message.content);
            if deficit > 0 {
                tracing::debug!("[ACCUMULATOR] Appending {} closing brace(s)", deficit);
                let closers = "}".repeat(deficit);
                self.message.content.push_str(&closers);
                if let Some(updates) = &self.updates {
                    updates.request_update(&closers);
                }
            }
            self.frozen = true;
        }
        &self.message.content
    }

    /// Freezes without any end-of-stream accounting.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn content(&self) -> &str {
        &self.message.content
    }

    pub fn message(&self) -> &AssistantMessage {
        &self.message
    }

    pub fn context(&self) -> &ConversationContext {
        &self.context
    }

    pub fn in_code_block(&self) -> bool {
        self.normalizer.in_code_block()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn into_parts(self) -> (AssistantMessage, ConversationContext) {
        (self.message, self.context)
    }
}

impl Default for MessageAccumulator {
    fn default() -> Self {
        Self::new(NormalizerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(response: Option<&str>, context: Option<Vec<i64>>, done: bool) -> StreamEvent {
        StreamEvent {
            response: response.map(str::to_string),
            context,
            done,
        }
    }

    #[test]
    fn appends_in_order_and_captures_terminal_context() {
        let mut acc = MessageAccumulator::default();
        acc.ingest(&event(Some("4"), None, false));
        acc.ingest(&event(Some(""), Some(vec![1, 2, 3]), true));
        assert_eq!(acc.finalize(), "4");
        assert_eq!(acc.context().tokens, vec![1, 2, 3]);
    }

    #[test]
    fn empty_tokens_never_overwrite_context() {
        let mut acc = MessageAccumulator::default();
        assert!(acc.capture_context(&[7, 8]));
        assert!(!acc.capture_context(&[]));
        assert_eq!(acc.context().tokens, vec![7, 8]);
    }

    #[test]
    fn finalize_closes_boxed_once() {
        let mut acc = MessageAccumulator::default();
        acc.append("\\boxed{");
        acc.append("4");
        assert_eq!(acc.finalize(), "\\boxed{4}");
        assert_eq!(acc.finalize(), "\\boxed{4}");
    }

    #[test]
    fn finalize_closes_open_fence_before_boxed() {
        let mut acc = MessageAccumulator::default();
        acc.append("\\boxed{x ```");
        assert!(acc.in_code_block());
        assert_eq!(acc.finalize(), "\\boxed{x ```\n```}");
        assert_eq!(closing_deficit(acc.content()), 0);
    }

    #[test]
    fn frozen_message_is_immutable() {
        let mut acc = MessageAccumulator::default();
        acc.append("partial");
        acc.freeze();
        acc.append(" more");
        assert!(!acc.capture_context(&[1]));
        assert_eq!(acc.content(), "partial");
        assert!(acc.context().is_empty());
    }

    #[test]
    fn content_never_shrinks() {
        let mut acc = MessageAccumulator::default();
        let mut last = 0;
        for piece in ["<think>", "a", "</think>", "\\boxed{}", " \\times ", "```", "x"] {
            let len = acc.append(piece).len();
            assert!(len >= last);
            last = len;
        }
        assert!(acc.in_code_block());
    }
}
