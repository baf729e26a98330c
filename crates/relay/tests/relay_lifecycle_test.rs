// Integration tests for the relay coordinator
//
// Each test runs a full `Relay::run` against an in-process WebSocket server
// and, where gap-fill is involved, a wiremock poll endpoint. Notifications go
// to the in-memory notifier and the checkpoint to a temp directory.
//
// Run with: cargo test -p ntfy-relay --test relay_lifecycle_test

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use ntfy_relay::memory::InMemoryNotifier;
use ntfy_relay::{
    AuthHeaders, CloseReason, Endpoints, ExitReason, Relay, RelayError, RelaySettings,
    RunSummary, ShutdownOutcome, StreamOptions,
};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use url::Url;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

type ServerWs = WebSocketStream<TcpStream>;

/// Accept one WebSocket connection and hand it to `behaviour`
async fn serve_once<F, Fut>(behaviour: F) -> Url
where
    F: FnOnce(ServerWs) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let ws = accept_async(tcp).await.unwrap();
        behaviour(ws).await;
    });
    Url::parse(&format!("ws://{addr}/alerts/ws")).unwrap()
}

async fn read_until_closed(mut ws: ServerWs) {
    while let Some(Ok(_)) = ws.next().await {}
}

async fn close_normally(mut ws: ServerWs) {
    ws.send(Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    })))
    .await
    .unwrap();
    read_until_closed(ws).await;
}

fn message(id: &str, time: u64) -> String {
    format!(
        r#"{{"id":"{id}","time":{time},"event":"message","topic":"alerts","title":"{id}","message":"body {id}"}}"#
    )
}

fn unused_poll_url() -> Url {
    Url::parse("http://127.0.0.1:1/alerts/json").unwrap()
}

fn settings(cache_dir: &Path, stream: Url, poll: Url, fetch_missed: bool) -> RelaySettings {
    RelaySettings {
        endpoints: Endpoints::new(stream, poll),
        headers: AuthHeaders::anonymous("relay-it"),
        cache_dir: cache_dir.to_path_buf(),
        fetch_missed,
        stream: StreamOptions::new(Duration::from_secs(30)),
    }
}

fn read_checkpoint(dir: &Path) -> (String, String) {
    (
        std::fs::read_to_string(dir.join("lastOnline")).unwrap(),
        std::fs::read_to_string(dir.join("lastId")).unwrap(),
    )
}

/// Resolves once the notifier has seen `count` attempts
async fn after_attempts(notifier: InMemoryNotifier, count: usize) {
    while notifier.attempts().await < count {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn run(relay: Relay, interrupt: impl Future<Output = ()>) -> Result<RunSummary, RelayError> {
    tokio::time::timeout(Duration::from_secs(10), relay.run(interrupt))
        .await
        .expect("relay run did not finish")
}

#[test_log::test(tokio::test)]
async fn test_restart_skips_already_delivered_boundary() {
    let cache = TempDir::new().unwrap();
    std::fs::write(cache.path().join("lastOnline"), "100").unwrap();
    std::fs::write(cache.path().join("lastId"), "X").unwrap();

    let poll = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/alerts/json"))
        .and(query_param("since", "100"))
        .and(query_param("poll", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            "{}\n{}\n{}\n",
            message("X", 100),
            message("Y", 101),
            message("Z", 102)
        )))
        .expect(1)
        .mount(&poll)
        .await;
    let stream = serve_once(read_until_closed).await;

    let notifier = InMemoryNotifier::new();
    let poll_url = Url::parse(&format!("{}/alerts/json", poll.uri())).unwrap();
    let relay = Relay::new(
        settings(cache.path(), stream, poll_url, true),
        Arc::new(notifier.clone()),
    );

    let summary = run(relay, after_attempts(notifier.clone(), 2)).await.unwrap();

    assert_eq!(notifier.titles().await, vec!["Y", "Z"]);
    assert_eq!(
        summary.exit,
        ExitReason::Interrupted(ShutdownOutcome::Confirmed(CloseReason::Normal))
    );
    assert_eq!(summary.stats.delivered, 2);
    assert_eq!(
        read_checkpoint(cache.path()),
        ("102".to_string(), "Z".to_string())
    );
}

#[test_log::test(tokio::test)]
async fn test_message_seen_live_and_in_gap_fill_is_notified_twice() {
    let cache = TempDir::new().unwrap();

    let poll = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/alerts/json"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(format!("{}\n", message("d", 200))),
        )
        .expect(1)
        .mount(&poll)
        .await;
    let stream = serve_once(|mut ws| async move {
        ws.send(Message::Text(message("d", 200))).await.unwrap();
        read_until_closed(ws).await;
    })
    .await;

    let notifier = InMemoryNotifier::new();
    let poll_url = Url::parse(&format!("{}/alerts/json", poll.uri())).unwrap();
    let relay = Relay::new(
        settings(cache.path(), stream, poll_url, true),
        Arc::new(notifier.clone()),
    );

    let summary = run(relay, after_attempts(notifier.clone(), 2)).await.unwrap();

    // No de-duplication across sources: at-least-once
    assert_eq!(notifier.titles().await, vec!["d", "d"]);
    assert_eq!(summary.stats.delivered, 2);
    assert_eq!(
        read_checkpoint(cache.path()),
        ("200".to_string(), "d".to_string())
    );
}

#[test_log::test(tokio::test)]
async fn test_live_messages_then_remote_close() {
    let cache = TempDir::new().unwrap();
    let stream = serve_once(|mut ws| async move {
        ws.send(Message::Text(
            r#"{"id":"o","time":1,"event":"open","topic":"alerts"}"#.to_string(),
        ))
        .await
        .unwrap();
        ws.send(Message::Text(message("a", 10))).await.unwrap();
        ws.send(Message::Text(r#"{"id":"k","time":11,"event":"keepalive"}"#.to_string()))
            .await
            .unwrap();
        ws.send(Message::Text(message("b", 12))).await.unwrap();
        close_normally(ws).await;
    })
    .await;

    let notifier = InMemoryNotifier::new();
    let relay = Relay::new(
        settings(cache.path(), stream, unused_poll_url(), false),
        Arc::new(notifier.clone()),
    );

    let summary = run(relay, std::future::pending()).await.unwrap();

    assert_eq!(summary.exit, ExitReason::StreamClosed(CloseReason::Normal));
    assert!(summary.exit.is_clean());
    assert_eq!(notifier.titles().await, vec!["a", "b"]);
    assert_eq!(summary.stats.ignored, 2);
    assert_eq!(
        read_checkpoint(cache.path()),
        ("12".to_string(), "b".to_string())
    );
}

#[test_log::test(tokio::test)]
async fn test_failed_delivery_is_offered_again_after_restart() {
    let cache = TempDir::new().unwrap();

    // First run: "b" is rejected by the sink
    let stream = serve_once(|mut ws| async move {
        ws.send(Message::Text(message("a", 10))).await.unwrap();
        ws.send(Message::Text(message("b", 11))).await.unwrap();
        close_normally(ws).await;
    })
    .await;
    let notifier = InMemoryNotifier::new();
    notifier.fail_title("b").await;
    let relay = Relay::new(
        settings(cache.path(), stream, unused_poll_url(), false),
        Arc::new(notifier.clone()),
    );
    let summary = run(relay, std::future::pending()).await.unwrap();

    assert_eq!(summary.stats.failed, 1);
    assert_eq!(
        read_checkpoint(cache.path()),
        ("10".to_string(), "a".to_string())
    );

    // Second run: gap-fill from the saved checkpoint re-offers "b"
    let poll = MockServer::start().await;
    Mock::given(method("GET"))
        .and(query_param("since", "10"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            "{}\n{}\n",
            message("a", 10),
            message("b", 11)
        )))
        .expect(1)
        .mount(&poll)
        .await;
    let stream = serve_once(read_until_closed).await;
    notifier.heal().await;
    let before = notifier.attempts().await;

    let poll_url = Url::parse(&format!("{}/alerts/json", poll.uri())).unwrap();
    let relay = Relay::new(
        settings(cache.path(), stream, poll_url, true),
        Arc::new(notifier.clone()),
    );
    run(relay, after_attempts(notifier.clone(), before + 1))
        .await
        .unwrap();

    assert_eq!(notifier.titles().await, vec!["a", "b"]);
    assert_eq!(
        read_checkpoint(cache.path()),
        ("11".to_string(), "b".to_string())
    );
}

#[test_log::test(tokio::test)]
async fn test_missing_pong_shuts_relay_down() {
    let cache = TempDir::new().unwrap();
    // Never reads, so pings are never answered
    let stream = serve_once(|ws| async move {
        tokio::time::sleep(Duration::from_secs(20)).await;
        drop(ws);
    })
    .await;

    let notifier = InMemoryNotifier::new();
    let relay = Relay::new(
        settings(cache.path(), stream, unused_poll_url(), false)
            .with_stream_options(StreamOptions::new(Duration::from_millis(300))),
        Arc::new(notifier),
    );

    let summary = run(relay, std::future::pending()).await.unwrap();

    assert_eq!(summary.exit, ExitReason::StreamClosed(CloseReason::DeadlineExpired));
    assert!(!summary.exit.is_clean());
    assert!(cache.path().join("lastOnline").exists());
    assert!(cache.path().join("lastId").exists());
}

#[test_log::test(tokio::test)]
async fn test_interrupt_without_close_confirmation_still_persists() {
    let cache = TempDir::new().unwrap();
    std::fs::write(cache.path().join("lastOnline"), "7").unwrap();
    let stream = serve_once(|ws| async move {
        tokio::time::sleep(Duration::from_secs(20)).await;
        drop(ws);
    })
    .await;

    let relay = Relay::new(
        settings(cache.path(), stream, unused_poll_url(), false).with_stream_options(
            StreamOptions::new(Duration::from_secs(30))
                .with_shutdown_grace(Duration::from_millis(200)),
        ),
        Arc::new(InMemoryNotifier::new()),
    );

    let summary = run(relay, tokio::time::sleep(Duration::from_millis(100)))
        .await
        .unwrap();

    assert_eq!(summary.exit, ExitReason::Interrupted(ShutdownOutcome::TimedOut));
    assert_eq!(read_checkpoint(cache.path()), ("7".to_string(), String::new()));
}

#[test_log::test(tokio::test)]
async fn test_connect_failure_persists_and_errors() {
    let cache = TempDir::new().unwrap();
    std::fs::write(cache.path().join("lastOnline"), "55").unwrap();
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let stream = Url::parse(&format!("ws://127.0.0.1:{port}/alerts/ws")).unwrap();

    let notifier = InMemoryNotifier::new();
    let relay = Relay::new(
        settings(cache.path(), stream, unused_poll_url(), false),
        Arc::new(notifier.clone()),
    );

    let err = run(relay, std::future::pending()).await.unwrap_err();

    assert!(matches!(err, RelayError::Connect(_)));
    assert_eq!(notifier.attempts().await, 0);
    // Both keys written even though only one existed before
    assert_eq!(read_checkpoint(cache.path()), ("55".to_string(), String::new()));
}
