use crate::accumulator::MessageAccumulator;
use crate::constants::INTERRUPTION_MARKER;
use crate::logging::StreamMetric;
use crate::scheduler::UpdateScheduler;
use crate::types::*;
use futures_util::{Stream, StreamExt};
use std::fmt;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What happens to the in-flight assistant message when a turn is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelPolicy {
    /// Keep the content received so far.
    #[default]
    Truncate,
    /// Drop the message and reset the thread context.
    Rollback,
}

impl FromStr for CancelPolicy {
    type Err = ChatStreamError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "truncate" => Ok(Self::Truncate),
            "rollback" => Ok(Self::Rollback),
            other => Err(ChatStreamError::Config(format!(
                "unknown cancel policy '{}' (expected truncate or rollback)",
                other
            ))),
        }
    }
}

impl fmt::Display for CancelPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncate => f.write_str("truncate"),
            Self::Rollback => f.write_str("rollback"),
        }
    }
}

/// Cloneable cancel trigger for one turn.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Result of one submitted turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub state: StreamState,
    /// `None` when the message was rolled back.
    pub message: Option<AssistantMessage>,
    /// Context to carry into the next turn; `None` leaves the thread's context alone.
    pub context: Option<ConversationContext>,
    /// Whether the thread's context must be cleared.
    pub reset_context: bool,
    pub error: Option<String>,
    pub prompt: String,
    pub metric: StreamMetric,
}

impl TurnOutcome {
    pub fn content(&self) -> &str {
        match &self.message {
            Some(m) => &m.content,
            None => "",
        }
    }
}

/// Drives one stream through `Idle -> Streaming -> {Completed | Cancelled | Failed}`.
pub struct StreamController {
    state: StreamState,
    policy: CancelPolicy,
    cancel: CancelHandle,
}

impl StreamController {
    pub fn new(policy: CancelPolicy) -> Self {
        Self {
            state: StreamState::Idle,
            policy,
            cancel: CancelHandle::default(),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn policy(&self) -> CancelPolicy {
        self.policy
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn begin(&mut self) -> Result<()> {
        if self.state != StreamState::Idle {
            return Err(ChatStreamError::InvalidState(format!(
                "stream controller already {}",
                self.state
            ))
            .into());
        }
        self.state = StreamState::Streaming;
        Ok(())
    }

    /// Reads `frames` to a terminal state.
    ///
    /// Cancellation wins any race with a pending read, and no fragment is
    /// appended once it has been observed.
    pub async fn run<S>(
        &mut self,
        mut frames: S,
        mut accumulator: MessageAccumulator,
        scheduler: UpdateScheduler,
        prompt: String,
    ) -> Result<TurnOutcome>
    where
        S: Stream<Item = std::io::Result<String>> + Unpin,
    {
        if self.state == StreamState::Idle {
            self.begin()?;
        }
        if self.state != StreamState::Streaming {
            return Err(ChatStreamError::InvalidState(format!(
                "cannot run a stream that is {}",
                self.state
            ))
            .into());
        }

        let mut metric = StreamMetric::new();
        let mut failure: Option<String> = None;

        let terminal = loop {
            if self.cancel.is_cancelled() {
                break StreamState::Cancelled;
            }

            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break StreamState::Cancelled,
                next = frames.next() => next,
            };

            match next {
                None => {
                    tracing::debug!("[☁️  -> ⚙️ ] Stream ended");
                    break StreamState::Completed;
                }
                Some(Err(e)) => {
                    tracing::error!("[☁️  -> ⚙️ ] Stream read error: {}", e);
                    failure = Some(e.to_string());
                    break StreamState::Failed;
                }
                Some(Ok(line)) => {
                    metric.record_frame();
                    match parse_event_line(&line) {
                        FrameEvent::Event(event) => {
                            tracing::trace!("[☁️  -> ⚙️ ] Event: {:?}", event);
                            metric.record_event(&event);
                            accumulator.ingest(&event);
                            if event.done {
                                tracing::debug!("[☁️  -> ⚙️ ] Done marker received");
                                break StreamState::Completed;
                            }
                        }
                        FrameEvent::Malformed(_) => metric.record_malformed(),
                    }
                }
            }
        };

        Ok(self
            .conclude(terminal, accumulator, scheduler, failure, prompt, metric)
            .await)
    }

    /// Ends a turn that failed before any byte was streamed.
    pub async fn fail_before_stream(
        &mut self,
        accumulator: MessageAccumulator,
        scheduler: UpdateScheduler,
        error: String,
        prompt: String,
    ) -> TurnOutcome {
        self.conclude(
            StreamState::Failed,
            accumulator,
            scheduler,
            Some(error),
            prompt,
            StreamMetric::new(),
        )
        .await
    }

    /// Ends a turn cancelled while waiting for the response headers.
    pub async fn cancel_before_stream(
        &mut self,
        accumulator: MessageAccumulator,
        scheduler: UpdateScheduler,
        prompt: String,
    ) -> TurnOutcome {
        self.conclude(
            StreamState::Cancelled,
            accumulator,
            scheduler,
            None,
            prompt,
            StreamMetric::new(),
        )
        .await
    }

    async fn conclude(
        &mut self,
        state: StreamState,
        mut accumulator: MessageAccumulator,
        scheduler: UpdateScheduler,
        error: Option<String>,
        prompt: String,
        metric: StreamMetric,
    ) -> TurnOutcome {
        self.state = state;
        metric.log_summary(&state.to_string());

        match state {
            StreamState::Completed => {
                accumulator.finalize();
                scheduler.flush(accumulator.content()).await;
                let (message, context) = accumulator.into_parts();
                TurnOutcome {
                    state,
                    message: Some(message),
                    context: if context.is_empty() { None } else { Some(context) },
                    reset_context: false,
                    error: None,
                    prompt,
                    metric,
                }
            }
            StreamState::Cancelled => {
                accumulator.freeze();
                tracing::info!(
                    "[⚙️ ] Turn cancelled after {} chars (policy: {})",
                    accumulator.content().len(),
                    self.policy
                );
                match self.policy {
                    CancelPolicy::Truncate => {
                        scheduler.flush(accumulator.content()).await;
                        let (message, _) = accumulator.into_parts();
                        TurnOutcome {
                            state,
                            message: Some(message),
                            context: None,
                            reset_context: false,
                            error: None,
                            prompt,
                            metric,
                        }
                    }
                    CancelPolicy::Rollback => {
                        scheduler.flush("").await;
                        TurnOutcome {
                            state,
                            message: None,
                            context: None,
                            reset_context: true,
                            error: None,
                            prompt,
                            metric,
                        }
                    }
                }
            }
            _ => {
                self.state = StreamState::Failed;
                accumulator.freeze();
                let (mut message, _) = accumulator.into_parts();
                message.content = format!("{}{}", INTERRUPTION_MARKER, message.content);
                scheduler.flush(&message.content).await;
                TurnOutcome {
                    state: StreamState::Failed,
                    message: Some(message),
                    context: None,
                    reset_context: true,
                    error,
                    prompt,
                    metric,
                }
            }
        }
    }
}
