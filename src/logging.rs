use crate::types::StreamEvent;
use std::panic;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

/// Installs the global subscriber: env filter, daily rolling file, span traces.
///
/// The returned guard must outlive the program's logging.
pub fn init_tracing(log_dir: &str) -> WorkerGuard {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "streamchat=info".into(),
    };

    let file_appender = tracing_appender::rolling::daily(log_dir, "streamchat.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(tracing_error::ErrorLayer::default())
        .init();

    guard
}

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

#[derive(Default, Debug, Clone)]
pub struct StreamMetric {
    pub frames: usize,
    pub events: usize,
    pub malformed: usize,
    pub text_chars: usize,
    pub context_tokens: usize,
}

impl StreamMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame(&mut self) {
        self.frames += 1;
    }

    pub fn record_event(&mut self, event: &StreamEvent) {
        self.events += 1;
        self.text_chars += event.text().chars().count();
        if !event.tokens().is_empty() {
            self.context_tokens = event.tokens().len();
        }
    }

    pub fn record_malformed(&mut self) {
        self.malformed += 1;
    }

    pub fn log_summary(&self, outcome: &str) {
        info!(
            target: "flight_recorder",
            "[STREAM END] Outcome: {} | Frames: {} | Malformed: {} | Text: {} chars | Context: {} tokens",
            outcome, self.frames, self.malformed, self.text_chars, self.context_tokens
        );
    }
}
