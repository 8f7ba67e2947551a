#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use serde_json::{json, Value};

use game_edge::create_router;
use game_edge::game::registry::SessionRegistry;
use game_edge::game::session::SessionSettings;
use game_edge::middleware::auth::JwtVerifier;
use game_edge::services::results::{GameResult, ResultSink};
use game_edge::services::store::SnapshotStore;
use game_edge::services::AppState;

pub const SIGNING_KEY: &[u8] = include_bytes!("../fixtures/signing_key.pem");
pub const VERIFYING_KEY: &[u8] = include_bytes!("../fixtures/verifying_key.pem");
pub const FOREIGN_SIGNING_KEY: &[u8] = include_bytes!("../fixtures/foreign_signing_key.pem");

#[derive(Default)]
pub struct MemoryStore {
    pub puts: Mutex<Vec<(String, String, Duration)>>,
    pub unreachable: AtomicBool,
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()> {
        self.puts.lock().push((key.to_string(), value, ttl));
        Ok(())
    }

    async fn ping(&self) -> anyhow::Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(anyhow!("connection refused"));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct CollectingSink {
    pub results: Mutex<Vec<GameResult>>,
}

#[async_trait]
impl ResultSink for CollectingSink {
    async fn deliver(&self, result: &GameResult) -> anyhow::Result<()> {
        self.results.lock().push(result.clone());
        Ok(())
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

pub fn sign(claims: &Value, key: &[u8]) -> String {
    encode(
        &Header::new(Algorithm::RS256),
        claims,
        &EncodingKey::from_rsa_pem(key).unwrap(),
    )
    .unwrap()
}

/// A valid player credential for `user_id`, good for an hour.
pub fn player_token(user_id: &str) -> String {
    sign(
        &json!({ "user_id": user_id, "is_guest": false, "exp": unix_now() + 3600 }),
        SIGNING_KEY,
    )
}

pub fn verifier() -> JwtVerifier {
    JwtVerifier::from_rsa_pem(VERIFYING_KEY).unwrap()
}

pub struct TestApp {
    pub state: Arc<AppState>,
    pub store: Arc<MemoryStore>,
    pub results: Arc<CollectingSink>,
}

impl TestApp {
    pub fn new(settings: SessionSettings) -> Self {
        let store = Arc::new(MemoryStore::default());
        let results = Arc::new(CollectingSink::default());
        let registry = Arc::new(SessionRegistry::new(
            settings,
            store.clone(),
            results.clone(),
        ));
        let state = Arc::new(AppState::new(registry, verifier(), store.clone()));
        Self {
            state,
            store,
            results,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.state.registry
    }

    /// Serves the router on an ephemeral local port.
    pub async fn spawn(&self) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = create_router(self.state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }
}

pub fn fast_settings() -> SessionSettings {
    SessionSettings {
        tick_interval: Duration::from_millis(50),
        voting_at: Duration::from_millis(300),
        duration: Duration::from_millis(600),
        end_grace: Duration::from_millis(200),
    }
}

pub fn slow_settings() -> SessionSettings {
    SessionSettings {
        tick_interval: Duration::from_millis(50),
        voting_at: Duration::from_secs(30),
        duration: Duration::from_secs(60),
        end_grace: Duration::from_secs(1),
    }
}
