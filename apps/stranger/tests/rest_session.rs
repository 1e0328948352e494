use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::time::{sleep, timeout};
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};

use stranger_client_core::api::ServerApi;
use stranger_client_core::config::ChatMode;
use stranger_client_core::media::SyntheticCapture;
use stranger_client_core::negotiation::rtc::RtcPeerFactory;
use stranger_client_core::session::{
    self, SessionConfig, SessionDeps, SessionEvent, SessionState, TranscriptEntry,
};
use stranger_client_core::store::MemoryStore;
use stranger_client_core::protocol::ClientMessage;
use stranger_client_core::transport::Connector;
use stranger_client_core::transport::rest::RestConnector;

const CONNECTION_ID: &str = "c0ffee";

fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Scripted single-client REST matchmaker: records every request and
/// serves queued inbox envelopes.
#[derive(Default)]
struct RestStub {
    requests: Vec<(String, Value)>,
    inbox: VecDeque<Value>,
    ended: bool,
}

type SharedStub = Arc<AsyncMutex<RestStub>>;

async fn start_session(State(stub): State<SharedStub>, Json(body): Json<Value>) -> Json<Value> {
    let mut stub = stub.lock().await;
    stub.requests.push(("start".into(), body));
    stub.inbox.push_back(json!({"type": "system", "message": "You've been connected to a stranger!"}));
    stub.inbox.push_back(json!({"type": "message", "message": "hi from rest"}));
    Json(json!({"connection_id": CONNECTION_ID, "matched": true}))
}

async fn record(
    stub: &SharedStub,
    route: &str,
    body: Value,
) -> Result<Json<Value>, StatusCode> {
    let mut stub = stub.lock().await;
    if body.get("connection_id").and_then(Value::as_str) != Some(CONNECTION_ID) {
        return Err(StatusCode::NOT_FOUND);
    }
    stub.requests.push((route.to_string(), body));
    Ok(Json(json!({"sent": true})))
}

async fn message(
    State(stub): State<SharedStub>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    record(&stub, "message", body).await
}

async fn find_new(
    State(stub): State<SharedStub>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    record(&stub, "find-new", body).await
}

async fn updates(
    State(stub): State<SharedStub>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    if id != CONNECTION_ID {
        return Err(StatusCode::NOT_FOUND);
    }
    let mut stub = stub.lock().await;
    let messages: Vec<Value> = stub.inbox.drain(..).collect();
    Ok(Json(json!({ "messages": messages })))
}

async fn end_session(State(stub): State<SharedStub>, Path(id): Path<String>) -> Json<Value> {
    let mut stub = stub.lock().await;
    stub.ended = id == CONNECTION_ID;
    Json(json!({"ok": true}))
}

async fn spawn_server(stub: SharedStub) -> String {
    let router = Router::new()
        .route("/api/health", get(|| async { Json(json!({"status": "ok"})) }))
        .route("/api/online", get(|| async { Json(json!({"online": 42})) }))
        .route("/api/session/start", post(start_session))
        .route("/api/session/:id", delete(end_session))
        .route("/api/updates/:id", get(updates))
        .route("/api/message", post(message))
        .route("/api/find-new", post(find_new))
        .with_state(stub);
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    addr.to_string()
}

async fn expect_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>, wanted: SessionEvent) {
    timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if event == wanted {
                return;
            }
        }
        panic!("event stream ended before {wanted:?}");
    })
    .await
    .expect("timed out waiting for session event");
}

#[tokio::test]
async fn rest_channel_carries_a_text_chat() {
    init_tracing();
    let stub = SharedStub::default();
    let server = spawn_server(stub.clone()).await;

    let deps = SessionDeps {
        connector: Arc::new(RestConnector::new(
            server.clone(),
            Duration::from_millis(20),
        )),
        peers: Arc::new(RtcPeerFactory::new(Vec::new())),
        capture: Arc::new(SyntheticCapture),
        store: Arc::new(MemoryStore::default()),
    };
    let (mut handle, mut events) = session::spawn(SessionConfig::new(ChatMode::Text), deps);

    handle.start(vec!["books".into()]).expect("start");
    expect_event(
        &mut events,
        SessionEvent::Transcript(TranscriptEntry::Received("hi from rest".into())),
    )
    .await;
    assert_eq!(handle.state(), SessionState::Paired);

    handle.send_message("hello back").expect("send");
    handle.request_new_partner().expect("next");
    expect_event(&mut events, SessionEvent::State(SessionState::AwaitingPartner)).await;
    sleep(Duration::from_millis(100)).await;

    handle.leave().expect("leave");
    timeout(Duration::from_secs(5), handle.wait_for_state(SessionState::Ended))
        .await
        .expect("timed out waiting for leave")
        .expect("ended");

    timeout(Duration::from_secs(5), async {
        while !stub.lock().await.ended {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session end was never sent");

    let stub = stub.lock().await;
    let routes: Vec<&str> = stub.requests.iter().map(|(route, _)| route.as_str()).collect();
    assert_eq!(routes, vec!["start", "message", "find-new"]);
    assert_eq!(
        stub.requests[0].1,
        json!({"chat_type": "text", "interests": ["books"]})
    );
    assert_eq!(
        stub.requests[1].1,
        json!({"connection_id": CONNECTION_ID, "message": "hello back"})
    );
    assert_eq!(
        stub.requests[2].1,
        json!({"connection_id": CONNECTION_ID, "interests": ["books"]})
    );
}

#[tokio::test]
async fn dropping_the_event_stream_ends_the_rest_session() {
    init_tracing();
    let stub = SharedStub::default();
    let server = spawn_server(stub.clone()).await;

    let connector = RestConnector::new(server, Duration::from_millis(20));
    let channel = connector.open(ChatMode::Text).await.expect("open");
    channel
        .sender
        .send(ClientMessage::Interests {
            interests: Vec::new(),
        })
        .expect("interests");
    drop(channel.events);

    timeout(Duration::from_secs(5), async {
        while !stub.lock().await.ended {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session end was never sent");
    drop(channel.sender);
}

#[tokio::test]
async fn probes_read_health_and_online_count() {
    init_tracing();
    let server = spawn_server(SharedStub::default()).await;
    let api = ServerApi::new(&server).expect("api");
    assert_eq!(api.base().as_str(), format!("http://{server}/api"));

    let health = api.health().await.expect("health");
    assert!(health.is_ok());
    assert_eq!(api.online().await.expect("online"), 42);
}
