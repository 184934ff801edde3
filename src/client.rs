use crate::accumulator::MessageAccumulator;
use crate::auth::AuthGuard;
use crate::constants::{
    DEFAULT_ENDPOINT, DEFAULT_MODEL, DEFAULT_UPDATE_INTERVAL_MS, MAX_FRAME_BYTES,
};
use crate::decoder::frame_stream;
use crate::hardening::RetryPolicy;
use crate::normalizer::NormalizerConfig;
use crate::scheduler::{RenderSink, UpdateScheduler};
use crate::streaming::{CancelPolicy, StreamController, TurnOutcome};
use crate::types::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: String,
    pub model: String,
    pub cancel_policy: CancelPolicy,
    pub normalize_math: bool,
    pub update_interval: Duration,
    /// Upper bound for receiving the response headers.
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_frame_bytes: usize,
    pub connect_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            cancel_policy: CancelPolicy::default(),
            normalize_math: true,
            update_interval: Duration::from_millis(DEFAULT_UPDATE_INTERVAL_MS),
            request_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(10),
            max_frame_bytes: MAX_FRAME_BYTES,
            connect_retries: 2,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if reqwest::Url::parse(&self.endpoint).is_err() {
            return Err(
                ChatStreamError::Config(format!("invalid endpoint URL: {}", self.endpoint)).into(),
            );
        }
        if self.model.trim().is_empty() {
            return Err(ChatStreamError::Config("model name is empty".into()).into());
        }
        if self.max_frame_bytes == 0 {
            return Err(ChatStreamError::Config("max frame size must be positive".into()).into());
        }
        Ok(())
    }
}

/// Caller-owned state of one chat thread.
#[derive(Debug, Clone, Default)]
pub struct ChatThread {
    id: ThreadId,
    context: ConversationContext,
}

impl ChatThread {
    pub fn new(id: ThreadId) -> Self {
        Self {
            id,
            context: ConversationContext::default(),
        }
    }

    pub fn id(&self) -> &ThreadId {
        &self.id
    }

    pub fn context(&self) -> &ConversationContext {
        &self.context
    }

    /// Changing thread identity drops the continuation state.
    pub fn switch_to(&mut self, id: ThreadId) {
        if self.id != id {
            tracing::debug!("[THREAD] Switching {} -> {}", self.id.short(), id.short());
            self.id = id;
            self.context.clear();
        }
    }

    pub fn reset_context(&mut self) {
        self.context.clear();
    }

    pub fn apply(&mut self, outcome: &TurnOutcome) {
        if outcome.reset_context {
            self.context.clear();
        } else if let Some(context) = &outcome.context {
            self.context = context.clone();
        }
    }
}

pub struct ChatClient {
    http: reqwest::Client,
    config: ClientConfig,
    auth: Arc<dyn AuthGuard>,
    retry: RetryPolicy,
}

impl ChatClient {
    pub fn new(config: ClientConfig, auth: Arc<dyn AuthGuard>) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .build()?;
        Ok(Self::with_http(http, config, auth))
    }

    pub fn with_http(http: reqwest::Client, config: ClientConfig, auth: Arc<dyn AuthGuard>) -> Self {
        let retry = RetryPolicy::new(config.connect_retries + 1, 200);
        Self {
            http,
            config,
            auth,
            retry,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// A fresh controller for the next submission. Grab its cancel handle before submitting.
    pub fn begin_turn(&self) -> StreamController {
        StreamController::new(self.config.cancel_policy)
    }

    /// Sends `prompt` on `thread` and streams the reply into `sink`.
    ///
    /// Failures before the first byte (auth, transport, non-200) return `Err`;
    /// everything after that ends in a `TurnOutcome`.
    pub async fn submit(
        &self,
        mut controller: StreamController,
        thread: &mut ChatThread,
        prompt: &str,
        sink: Arc<dyn RenderSink>,
    ) -> Result<TurnOutcome> {
        let prompt = prompt.trim().to_string();
        if prompt.is_empty() {
            return Err(ChatStreamError::InvalidState("prompt is empty".into()).into());
        }
        let user = self.auth.identify().await?;

        let span = tracing::info_span!(
            "stream",
            thread = %thread.id().short(),
            model = %self.config.model,
            user = %user.0
        );
        self.run_turn(&mut controller, thread, prompt, sink)
            .instrument(span)
            .await
    }

    async fn run_turn(
        &self,
        controller: &mut StreamController,
        thread: &mut ChatThread,
        prompt: String,
        sink: Arc<dyn RenderSink>,
    ) -> Result<TurnOutcome> {
        controller.begin()?;

        let scheduler = UpdateScheduler::spawn(sink, self.config.update_interval);
        let accumulator = MessageAccumulator::new(NormalizerConfig {
            normalize_math: self.config.normalize_math,
        })
        .with_updates(scheduler.handle());

        let request = GenerateRequest {
            model: self.config.model.clone(),
            prompt: prompt.clone(),
            context: if thread.context().is_empty() {
                None
            } else {
                Some(thread.context().tokens.clone())
            },
        };
        tracing::info!(
            "[⚙️  -> ☁️ ] POST {} (context: {} tokens)",
            self.config.endpoint,
            thread.context().tokens.len()
        );

        let cancel = controller.cancel_handle();
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            r = self.send(&request) => Some(r),
        };

        let response = match sent {
            None => {
                let outcome = controller
                    .cancel_before_stream(accumulator, scheduler, prompt)
                    .await;
                thread.apply(&outcome);
                return Ok(outcome);
            }
            Some(Err(e)) => {
                tracing::error!("[☁️  -> ⚙️ ] Request failed: {}", e.inner);
                let outcome = controller
                    .fail_before_stream(accumulator, scheduler, e.inner.to_string(), prompt)
                    .await;
                thread.apply(&outcome);
                return Err(e);
            }
            Some(Ok(response)) => response,
        };

        let frames = frame_stream(Box::pin(response.bytes_stream()), self.config.max_frame_bytes);
        let outcome = controller
            .run(frames, accumulator, scheduler, prompt)
            .await?;
        thread.apply(&outcome);
        Ok(outcome)
    }

    async fn send(&self, request: &GenerateRequest) -> Result<reqwest::Response> {
        let response = self
            .retry
            .execute_with_retry(|| {
                let pending = self.http.post(&self.config.endpoint).json(request).send();
                let timeout = self.config.request_timeout;
                async move {
                    match tokio::time::timeout(timeout, pending).await {
                        Ok(Ok(response)) => Ok(response),
                        Ok(Err(e)) => Err(ChatStreamError::Network(e).into()),
                        Err(_) => Err(ChatStreamError::Io(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            format!("no response within {:?}", timeout),
                        ))
                        .into()),
                    }
                }
            })
            .await?;

        let status = response.status();
        tracing::info!("[☁️  -> ⚙️ ] Status: {}", status);

        if status != reqwest::StatusCode::OK {
            let error_body = match response.text().await {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!("Failed to read error body: {}", e);
                    format!("Upstream error (body unreadable): {}", e)
                }
            };
            tracing::error!("[☁️  -> ⚙️ ] Upstream Error: {}", error_body);
            return Err(ChatStreamError::Upstream(status, error_body).into());
        }

        Ok(response)
    }
}
