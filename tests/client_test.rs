use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use streamchat::auth::StaticAuthGuard;
use streamchat::scheduler::RenderSink;
use streamchat::*;

type Renders = Arc<Mutex<Vec<(String, bool)>>>;

#[derive(Clone, Default)]
struct MockProvider {
    requests: Arc<Mutex<Vec<Value>>>,
    hits: Arc<AtomicUsize>,
}

fn ndjson(chunks: Vec<&'static str>) -> Response {
    let body = stream::iter(
        chunks
            .into_iter()
            .map(|c| Ok::<Bytes, std::io::Error>(Bytes::from_static(c.as_bytes())))
            .collect::<Vec<_>>(),
    );
    ndjson_body(Body::from_stream(body))
}

fn ndjson_body(body: Body) -> Response {
    let mut response = Response::new(body);
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/x-ndjson"),
    );
    response
}

async fn generate(State(provider): State<MockProvider>, Json(req): Json<Value>) -> Response {
    provider.hits.fetch_add(1, Ordering::SeqCst);
    provider.requests.lock().unwrap().push(req.clone());

    match req["prompt"].as_str().unwrap_or_default() {
        "2+2" => ndjson(vec![
            "{\"response\":\"",
            "4\"}\n{\"resp",
            "onse\":\"\",\"done\":true,\"context\":[1,2,3]}\n",
        ]),
        "and again?" => ndjson(vec![
            "{\"response\":\"still 4\"}\n",
            "{\"done\":true,\"context\":[1,2,3,4,5]}\n",
        ]),
        "fail" => (StatusCode::INTERNAL_SERVER_ERROR, "model not loaded").into_response(),
        "hang" => {
            let head = stream::iter(vec![Ok::<Bytes, std::io::Error>(Bytes::from_static(
                b"{\"response\":\"Hel\"}\n",
            ))]);
            ndjson_body(Body::from_stream(head.chain(stream::pending())))
        }
        _ => ndjson(vec!["{\"response\":\"?\",\"done\":true}\n"]),
    }
}

async fn spawn_provider() -> (SocketAddr, MockProvider) {
    let provider = MockProvider::default();
    let app = Router::new()
        .route("/api/generate", post(generate))
        .with_state(provider.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, provider)
}

fn config(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        endpoint: format!("http://{}/api/generate", addr),
        model: "test-model".to_string(),
        update_interval: Duration::from_millis(5),
        connect_retries: 0,
        ..Default::default()
    }
}

fn client(config: ClientConfig) -> ChatClient {
    ChatClient::new(config, Arc::new(StaticAuthGuard::allow("tester"))).unwrap()
}

fn recording_sink() -> (Arc<dyn RenderSink>, Renders) {
    let renders: Renders = Arc::new(Mutex::new(Vec::new()));
    let sink_renders = renders.clone();
    let sink: Arc<dyn RenderSink> = Arc::new(move |content: &str, done: bool| {
        sink_renders
            .lock()
            .unwrap()
            .push((content.to_string(), done));
    });
    (sink, renders)
}

async fn wait_for_render(renders: &Renders, expected: &str) {
    for _ in 0..200 {
        if renders.lock().unwrap().iter().any(|(c, _)| c == expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("never rendered {:?}", expected);
}

#[tokio::test]
async fn test_completed_turn_carries_context_into_next_request() {
    let (addr, provider) = spawn_provider().await;
    let client = client(config(addr));
    let mut thread = ChatThread::new(ThreadId::from("t-1"));

    let (sink, renders) = recording_sink();
    let outcome = client
        .submit(client.begin_turn(), &mut thread, "2+2", sink)
        .await
        .unwrap();

    assert_eq!(outcome.state, StreamState::Completed);
    assert_eq!(outcome.content(), "4");
    assert_eq!(thread.context().tokens, vec![1, 2, 3]);
    assert_eq!(
        renders.lock().unwrap().last().unwrap(),
        &("4".to_string(), true)
    );

    let (sink, _) = recording_sink();
    let outcome = client
        .submit(client.begin_turn(), &mut thread, "and again?", sink)
        .await
        .unwrap();
    assert_eq!(outcome.content(), "still 4");
    assert_eq!(thread.context().tokens, vec![1, 2, 3, 4, 5]);

    let requests = provider.requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0]["model"], "test-model");
    assert!(requests[0].get("context").is_none());
    assert_eq!(requests[1]["context"], serde_json::json!([1, 2, 3]));
}

#[tokio::test]
async fn test_upstream_error_is_hard_failure() {
    let (addr, provider) = spawn_provider().await;
    let client = client(config(addr));
    let mut thread = ChatThread::new(ThreadId::from("t-2"));
    thread.apply(&TurnOutcome {
        state: StreamState::Completed,
        message: None,
        context: Some(ConversationContext::new(vec![9, 9])),
        reset_context: false,
        error: None,
        prompt: String::new(),
        metric: Default::default(),
    });

    let (sink, renders) = recording_sink();
    let err = client
        .submit(client.begin_turn(), &mut thread, "fail", sink)
        .await
        .unwrap_err();

    match err.inner {
        ChatStreamError::Upstream(status, body) => {
            assert_eq!(status, reqwest::StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(body, "model not loaded");
        }
        other => panic!("expected upstream error, got {:?}", other),
    }
    assert!(thread.context().is_empty());
    assert_eq!(provider.hits.load(Ordering::SeqCst), 1);

    let renders = renders.lock().unwrap();
    let (last, done) = renders.last().unwrap();
    assert!(*done);
    assert_eq!(last, streamchat::constants::INTERRUPTION_MARKER);
}

#[tokio::test]
async fn test_cancel_mid_stream_keeps_partial_content() {
    let (addr, _) = spawn_provider().await;
    let client = client(config(addr));
    let mut thread = ChatThread::new(ThreadId::from("t-3"));

    let controller = client.begin_turn();
    let cancel = controller.cancel_handle();
    let (sink, renders) = recording_sink();

    let canceller = {
        let renders = renders.clone();
        async move {
            wait_for_render(&renders, "Hel").await;
            cancel.cancel();
        }
    };
    let (outcome, _) = tokio::join!(
        client.submit(controller, &mut thread, "hang", sink),
        canceller
    );
    let outcome = outcome.unwrap();

    assert_eq!(outcome.state, StreamState::Cancelled);
    assert_eq!(outcome.content(), "Hel");
    assert!(outcome.error.is_none());
    let renders = renders.lock().unwrap();
    assert_eq!(renders.last().unwrap(), &("Hel".to_string(), true));
    assert_eq!(renders.iter().filter(|(_, done)| *done).count(), 1);
}

#[tokio::test]
async fn test_rollback_policy_discards_message() {
    let (addr, _) = spawn_provider().await;
    let client = client(ClientConfig {
        cancel_policy: CancelPolicy::Rollback,
        ..config(addr)
    });
    let mut thread = ChatThread::new(ThreadId::from("t-4"));

    let controller = client.begin_turn();
    let cancel = controller.cancel_handle();
    let (sink, renders) = recording_sink();
    let canceller = {
        let renders = renders.clone();
        async move {
            wait_for_render(&renders, "Hel").await;
            cancel.cancel();
        }
    };
    let (outcome, _) = tokio::join!(
        client.submit(controller, &mut thread, "hang", sink),
        canceller
    );
    let outcome = outcome.unwrap();

    assert_eq!(outcome.state, StreamState::Cancelled);
    assert!(outcome.message.is_none());
    assert!(outcome.reset_context);
    assert_eq!(outcome.prompt, "hang");
    assert_eq!(
        renders.lock().unwrap().last().unwrap(),
        &(String::new(), true)
    );
}

#[tokio::test]
async fn test_cancel_before_submit_sends_nothing_to_sink_but_terminal() {
    let (addr, _) = spawn_provider().await;
    let client = client(config(addr));
    let mut thread = ChatThread::new(ThreadId::from("t-5"));

    let controller = client.begin_turn();
    controller.cancel();
    let (sink, renders) = recording_sink();
    let outcome = client
        .submit(controller, &mut thread, "2+2", sink)
        .await
        .unwrap();

    assert_eq!(outcome.state, StreamState::Cancelled);
    assert_eq!(outcome.content(), "");
    assert!(thread.context().is_empty());
    assert_eq!(*renders.lock().unwrap(), vec![(String::new(), true)]);
}

#[tokio::test]
async fn test_unauthorized_caller_never_reaches_provider() {
    let (addr, provider) = spawn_provider().await;
    let client = ChatClient::new(config(addr), Arc::new(StaticAuthGuard::deny())).unwrap();
    let mut thread = ChatThread::new(ThreadId::from("t-6"));

    let (sink, renders) = recording_sink();
    let err = client
        .submit(client.begin_turn(), &mut thread, "2+2", sink)
        .await
        .unwrap_err();

    assert!(matches!(err.inner, ChatStreamError::Unauthorized(_)));
    assert_eq!(provider.hits.load(Ordering::SeqCst), 0);
    assert!(renders.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_blank_prompt_is_rejected() {
    let (addr, provider) = spawn_provider().await;
    let client = client(config(addr));
    let mut thread = ChatThread::new(ThreadId::from("t-7"));

    let (sink, _) = recording_sink();
    let err = client
        .submit(client.begin_turn(), &mut thread, "   \n", sink)
        .await
        .unwrap_err();
    assert!(matches!(err.inner, ChatStreamError::InvalidState(_)));
    assert_eq!(provider.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unreachable_provider_fails_before_streaming() {
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let client = client(config(addr));
    let mut thread = ChatThread::new(ThreadId::from("t-8"));

    let (sink, renders) = recording_sink();
    let err = client
        .submit(client.begin_turn(), &mut thread, "2+2", sink)
        .await
        .unwrap_err();

    assert!(matches!(err.inner, ChatStreamError::Network(_)));
    assert!(thread.context().is_empty());
    assert_eq!(renders.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_controller_is_single_use() {
    let (addr, _) = spawn_provider().await;
    let client = client(config(addr));
    let mut thread = ChatThread::new(ThreadId::from("t-9"));

    let mut controller = client.begin_turn();
    controller.begin().unwrap();
    let (sink, _) = recording_sink();
    let err = client
        .submit(controller, &mut thread, "2+2", sink)
        .await
        .unwrap_err();
    assert!(matches!(err.inner, ChatStreamError::InvalidState(_)));
}
