use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// The rendering layer. Receives the full message content each time.
pub trait RenderSink: Send + Sync {
    fn render(&self, content: &str, done: bool);
}

impl<F> RenderSink for F
where
    F: Fn(&str, bool) + Send + Sync,
{
    fn render(&self, content: &str, done: bool) {
        self(content, done)
    }
}

/// Write side of the scheduler, held by the accumulator.
///
/// Appends are mirrored into a watch channel, so any number of them between
/// two renders collapse into one.
#[derive(Clone)]
pub struct UpdateHandle {
    tx: Arc<watch::Sender<String>>,
}

impl UpdateHandle {
    pub fn request_update(&self, appended: &str) {
        self.tx.send_modify(|content| content.push_str(appended));
    }
}

/// Throttles pushes to a `RenderSink` to at most one per interval.
pub struct UpdateScheduler {
    sink: Arc<dyn RenderSink>,
    handle: UpdateHandle,
    task: JoinHandle<()>,
}

impl UpdateScheduler {
    /// Must be called from within a tokio runtime.
    pub fn spawn(sink: Arc<dyn RenderSink>, interval: Duration) -> Self {
        let (tx, rx) = watch::channel(String::new());
        let task = tokio::spawn(render_loop(rx, sink.clone(), interval));
        Self {
            sink,
            handle: UpdateHandle { tx: Arc::new(tx) },
            task,
        }
    }

    pub fn handle(&self) -> UpdateHandle {
        self.handle.clone()
    }

    pub fn request_update(&self, appended: &str) {
        self.handle.request_update(appended);
    }

    /// Stops throttled rendering and pushes `content` as the terminal state.
    ///
    /// Nothing renders after this call returns.
    pub async fn flush(self, content: &str) {
        self.task.abort();
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                tracing::error!("[SCHEDULER] Render task failed: {}", e);
            }
        }
        self.sink.render(content, true);
    }
}

async fn render_loop(mut rx: watch::Receiver<String>, sink: Arc<dyn RenderSink>, interval: Duration) {
    while rx.changed().await.is_ok() {
        let content = rx.borrow_and_update().clone();
        sink.render(&content, false);
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording_sink() -> (Arc<dyn RenderSink>, Arc<Mutex<Vec<(String, bool)>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink_calls = calls.clone();
        let sink = move |content: &str, done: bool| {
            sink_calls.lock().unwrap().push((content.to_string(), done));
        };
        (Arc::new(sink), calls)
    }

    #[tokio::test(start_paused = true)]
    async fn bursts_coalesce_into_latest_content() {
        let (sink, calls) = recording_sink();
        let scheduler = UpdateScheduler::spawn(sink, Duration::from_millis(16));

        for piece in ["a", "b", "c", "d"] {
            scheduler.request_update(piece);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        scheduler.request_update("e");
        scheduler.request_update("f");
        tokio::time::sleep(Duration::from_millis(40)).await;

        let seen = calls.lock().unwrap().clone();
        assert!(!seen.is_empty());
        assert!(seen.len() <= 2, "expected throttled renders, got {:?}", seen);
        assert_eq!(seen.last().unwrap().0, "abcdef");
        assert!(seen.iter().all(|(_, done)| !done));
    }

    #[tokio::test(start_paused = true)]
    async fn flush_is_final_and_unconditional() {
        let (sink, calls) = recording_sink();
        let scheduler = UpdateScheduler::spawn(sink, Duration::from_secs(60));

        scheduler.request_update("x");
        tokio::time::sleep(Duration::from_millis(1)).await;
        scheduler.request_update("y");
        scheduler.flush("xy").await;

        let seen = calls.lock().unwrap().clone();
        assert_eq!(seen.last().unwrap(), &("xy".to_string(), true));
        assert_eq!(seen.iter().filter(|(_, done)| *done).count(), 1);
    }
}
