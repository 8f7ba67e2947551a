mod common;

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use common::{fast_settings, player_token, slow_settings, TestApp};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(addr: SocketAddr, user_id: &str, game_id: &str) -> Client {
    let url = format!(
        "ws://{}/ws?token={}&game_id={}",
        addr,
        player_token(user_id),
        game_id
    );
    let (client, _) = connect_async(url).await.unwrap();
    client
}

async fn suspect(client: &mut Client, target: &str) {
    let frame = json!({ "type": "SUSPECT", "payload": { "target": target } });
    client.send(Message::Text(frame.to_string())).await.unwrap();
}

/// Next server message, splitting coalesced frames. `None` once the
/// server has closed the socket.
async fn next_packet(client: &mut Client, pending: &mut Vec<Value>) -> Option<Value> {
    loop {
        if !pending.is_empty() {
            return Some(pending.remove(0));
        }
        match client.next().await? {
            Ok(Message::Text(text)) => {
                pending.extend(text.lines().map(|line| serde_json::from_str::<Value>(line).unwrap()));
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

async fn wait_for<F>(client: &mut Client, pending: &mut Vec<Value>, mut pred: F) -> Value
where
    F: FnMut(&Value) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let packet = next_packet(client, pending)
                .await
                .expect("socket closed before the expected packet");
            if pred(&packet) {
                return packet;
            }
        }
    })
    .await
    .expect("timed out waiting for packet")
}

#[tokio::test]
async fn accusation_shows_up_in_next_tick() {
    let app = TestApp::new(slow_settings());
    let addr = app.spawn().await;

    let mut client = connect(addr, "u1", "g1").await;
    let mut pending = Vec::new();

    let first = wait_for(&mut client, &mut pending, |p| p["type"] == "TICK").await;
    assert_eq!(first["payload"]["phase"], "INTERROGATION");

    suspect(&mut client, "u2").await;
    let tick = wait_for(&mut client, &mut pending, |p| {
        p["type"] == "TICK" && p["payload"]["accusations"]["u1"] == "u2"
    })
    .await;
    assert!(tick["payload"]["remaining"].as_f64().unwrap() > 0.0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let persisted = app.store.puts.lock().iter().any(|(key, value, ttl)| {
        key == "game:g1:confmeter"
            && value.contains(r#""u1":"u2""#)
            && *ttl == Duration::from_secs(600)
    });
    assert!(persisted);
}

#[tokio::test]
async fn players_with_same_game_id_share_a_session() {
    let app = TestApp::new(slow_settings());
    let addr = app.spawn().await;

    let mut alice = connect(addr, "alice", "g1").await;
    let mut bob = connect(addr, "bob", "g1").await;
    let mut alice_pending = Vec::new();
    let mut bob_pending = Vec::new();

    suspect(&mut alice, "bob").await;

    let seen_by_bob = wait_for(&mut bob, &mut bob_pending, |p| {
        p["type"] == "TICK" && p["payload"]["accusations"]["alice"] == "bob"
    })
    .await;
    assert_eq!(seen_by_bob["payload"]["phase"], "INTERROGATION");
    wait_for(&mut alice, &mut alice_pending, |p| {
        p["type"] == "TICK" && p["payload"]["accusations"]["alice"] == "bob"
    })
    .await;

    assert_eq!(app.registry().len(), 1);
    assert_eq!(app.registry().get("g1").unwrap().participant_count(), 2);
}

#[tokio::test]
async fn full_game_runs_to_game_over_and_releases_clients() {
    let app = TestApp::new(fast_settings());
    let addr = app.spawn().await;

    let mut client = connect(addr, "u1", "g-full").await;
    let mut pending = Vec::new();
    suspect(&mut client, "u3").await;

    let news = wait_for(&mut client, &mut pending, |p| p["type"] == "EVENT_NEWS").await;
    assert_eq!(
        news["payload"],
        json!({ "message": "Breaking news event!", "phase": "VOTING" })
    );

    let over = wait_for(&mut client, &mut pending, |p| p["type"] == "GAME_OVER").await;
    assert_eq!(over["payload"]["winner_id"], "u3");
    assert_eq!(over["payload"]["accusations"], json!({ "u1": "u3" }));

    // The session closes the socket after its grace period.
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while next_packet(&mut client, &mut pending).await.is_some() {}
    })
    .await;
    assert!(closed.is_ok());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(app.registry().get("g-full").is_none());

    let results = app.results.results.lock();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].session_id, "g-full");
    assert_eq!(results[0].winner_id.as_deref(), Some("u3"));
}

async fn rejected_status(url: String) -> u16 {
    match connect_async(url).await {
        Err(WsError::Http(response)) => response.status().as_u16(),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("upgrade should have been refused"),
    }
}

#[tokio::test]
async fn upgrade_refused_without_valid_admission() {
    let app = TestApp::new(slow_settings());
    let addr = app.spawn().await;

    let no_token = format!("ws://{}/ws?game_id=g1", addr);
    assert_eq!(rejected_status(no_token).await, 401);

    let no_game = format!("ws://{}/ws?token={}", addr, player_token("u1"));
    assert_eq!(rejected_status(no_game).await, 400);

    let bad_token = format!("ws://{}/ws?token=not-a-jwt&game_id=g1", addr);
    assert_eq!(rejected_status(bad_token).await, 401);

    assert!(app.registry().is_empty());
}

#[tokio::test]
async fn shutdown_closes_open_sockets() {
    let app = TestApp::new(slow_settings());
    let addr = app.spawn().await;

    let mut client = connect(addr, "u1", "g1").await;
    let mut pending = Vec::new();
    wait_for(&mut client, &mut pending, |p| p["type"] == "TICK").await;

    app.registry().shutdown_all(Duration::from_secs(2)).await;
    assert!(app.registry().is_empty());

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while next_packet(&mut client, &mut pending).await.is_some() {}
    })
    .await;
    assert!(closed.is_ok());
}
