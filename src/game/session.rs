//! One match: participants, accusations, phase and the 1 Hz tick loop.
//!
//! All mutable state sits behind a single `RwLock`. Mutations take the write
//! half; snapshots and broadcasts take the read half. The lock is never held
//! across an `.await`.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::broadcast::{fan_out, Delivery};
use super::connection::Outbox;
use super::packet::{Accusations, ClientMessage, ServerMessage};
use crate::services::results::{GameResult, ResultSink};
use crate::services::store::{accusation_key, SnapshotStore, SNAPSHOT_TTL};

pub type ConnectionId = Uuid;

/// Ordered: a session only ever moves to a greater phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Waiting,
    Interrogation,
    Voting,
    Finished,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub tick_interval: Duration,
    /// Elapsed time at which the breaking-news event opens voting.
    pub voting_at: Duration,
    pub duration: Duration,
    /// Time between GAME_OVER and releasing the clients.
    pub end_grace: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            voting_at: Duration::from_secs(3 * 60 + 30),
            duration: Duration::from_secs(5 * 60),
            end_grace: Duration::from_secs(5),
        }
    }
}

pub struct Participant {
    pub user_id: String,
    pub outbox: Outbox,
}

struct SessionState {
    phase: Phase,
    participants: HashMap<ConnectionId, Participant>,
    accusations: Accusations,
}

pub struct Session {
    id: String,
    settings: SessionSettings,
    started_at: Instant,
    state: RwLock<SessionState>,
    stop: CancellationToken,
    loop_exited: CancellationToken,
    store: Arc<dyn SnapshotStore>,
    results: Arc<dyn ResultSink>,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        settings: SessionSettings,
        store: Arc<dyn SnapshotStore>,
        results: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            id: id.into(),
            settings,
            started_at: Instant::now(),
            state: RwLock::new(SessionState {
                phase: Phase::Waiting,
                participants: HashMap::new(),
                accusations: Accusations::new(),
            }),
            stop: CancellationToken::new(),
            loop_exited: CancellationToken::new(),
            store,
            results,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> Phase {
        self.state.read().phase
    }

    pub fn accusations(&self) -> Accusations {
        self.state.read().accusations.clone()
    }

    pub fn participant_count(&self) -> usize {
        self.state.read().participants.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Cancelled when the session stops. Cancelling the returned token does
    /// not stop the session.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.stop.child_token()
    }

    /// Moves WAITING -> INTERROGATION and spawns the tick loop. `on_finish`
    /// runs once the loop has exited, however it exited.
    pub fn start<F>(self: &Arc<Self>, on_finish: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.state.write();
            if state.phase != Phase::Waiting {
                tracing::warn!(session_id = %self.id, phase = ?state.phase, "session already started");
                return;
            }
            state.phase = Phase::Interrogation;
        }

        tracing::info!(session_id = %self.id, "session started");

        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.tick_loop().await;
            session.loop_exited.cancel();
            on_finish();
        });
    }

    /// Resolves once the tick loop has exited. Pending forever on a session
    /// that was never started.
    pub async fn stopped(&self) {
        self.loop_exited.cancelled().await
    }

    /// Ends the tick loop and lets go of every participant. Idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
        self.state.write().participants.clear();
    }

    /// Returns false if the session has already stopped.
    pub fn add_client(&self, id: ConnectionId, participant: Participant) -> bool {
        let mut state = self.state.write();
        if self.stop.is_cancelled() {
            return false;
        }
        state.participants.insert(id, participant);
        true
    }

    pub fn remove_client(&self, id: ConnectionId) -> bool {
        self.state.write().participants.remove(&id).is_some()
    }

    /// Later accusations by the same user replace earlier ones. The target is
    /// not checked against the participant list.
    pub fn record_accusation(&self, user_id: &str, target_id: &str) {
        self.state
            .write()
            .accusations
            .insert(user_id.to_string(), target_id.to_string());
    }

    pub fn handle_message(&self, user_id: &str, message: ClientMessage) {
        match message {
            ClientMessage::Suspect { target } => self.record_accusation(user_id, &target),
        }
    }

    /// Decodes one raw inbound frame and applies it. Malformed frames and
    /// unknown types are dropped.
    pub fn handle_frame(&self, user_id: &str, raw: &str) {
        match ClientMessage::decode(raw) {
            Ok(Some(message)) => self.handle_message(user_id, message),
            Ok(None) => {
                tracing::debug!(session_id = %self.id, user_id, "ignoring unknown packet type");
            }
            Err(e) => {
                tracing::debug!(session_id = %self.id, user_id, error = %e, "dropping malformed packet");
            }
        }
    }

    /// Pushes `message` to every current participant.
    pub fn broadcast(&self, message: &ServerMessage) -> Option<Delivery> {
        let state = self.state.read();
        match fan_out(message, state.participants.values().map(|p| &p.outbox)) {
            Ok(delivery) => {
                if delivery.dropped > 0 {
                    tracing::debug!(
                        session_id = %self.id,
                        dropped = delivery.dropped,
                        "outbox full, frame dropped"
                    );
                }
                Some(delivery)
            }
            Err(e) => {
                tracing::error!(session_id = %self.id, error = %e, "failed to serialize broadcast");
                None
            }
        }
    }

    async fn tick_loop(&self) {
        let period = self.settings.tick_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                _ = ticker.tick() => {
                    if self.tick().await.is_break() {
                        break;
                    }
                }
            }
        }

        tracing::debug!(session_id = %self.id, "tick loop exited");
    }

    async fn tick(&self) -> ControlFlow<()> {
        let elapsed = self.started_at.elapsed();

        if elapsed >= self.settings.voting_at && self.advance(Phase::Interrogation, Phase::Voting) {
            tracing::info!(session_id = %self.id, elapsed_secs = elapsed.as_secs(), "voting opened");
            self.broadcast(&ServerMessage::breaking_news(Phase::Voting));
        }

        if elapsed >= self.settings.duration {
            self.finish().await;
            return ControlFlow::Break(());
        }

        let (phase, accusations) = {
            let state = self.state.read();
            (state.phase, state.accusations.clone())
        };

        self.persist(&accusations);

        let remaining = self.settings.duration.saturating_sub(elapsed);
        self.broadcast(&ServerMessage::Tick {
            phase,
            elapsed: elapsed.as_secs_f64(),
            remaining: remaining.as_secs_f64(),
            accusations,
        });

        ControlFlow::Continue(())
    }

    fn advance(&self, from: Phase, to: Phase) -> bool {
        let mut state = self.state.write();
        if state.phase == from {
            state.phase = to;
            true
        } else {
            false
        }
    }

    /// Fire-and-forget snapshot write. Failures are logged only.
    fn persist(&self, accusations: &Accusations) {
        let value = match serde_json::to_string(accusations) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "failed to encode accusations");
                return;
            }
        };

        let store = Arc::clone(&self.store);
        let key = accusation_key(&self.id);
        let session_id = self.id.clone();
        tokio::spawn(async move {
            if let Err(e) = store.put(&key, value, SNAPSHOT_TTL).await {
                tracing::warn!(session_id = %session_id, error = %e, "failed to persist accusations");
            }
        });
    }

    async fn finish(&self) {
        let accusations = {
            let mut state = self.state.write();
            state.phase = Phase::Finished;
            state.accusations.clone()
        };

        let winner_id = tally_winner(&accusations);
        tracing::info!(
            session_id = %self.id,
            winner_id = winner_id.as_deref().unwrap_or(""),
            accusers = accusations.len(),
            "session finished"
        );

        self.broadcast(&ServerMessage::GameOver {
            winner_id: winner_id.clone(),
            accusations: accusations.clone(),
        });

        let results = Arc::clone(&self.results);
        let result = GameResult {
            session_id: self.id.clone(),
            winner_id,
            accusations,
        };
        tokio::spawn(async move {
            if let Err(e) = results.deliver(&result).await {
                tracing::warn!(session_id = %result.session_id, error = %e, "failed to deliver game result");
            }
        });

        tokio::select! {
            _ = tokio::time::sleep(self.settings.end_grace) => {}
            _ = self.stop.cancelled() => {}
        }

        self.stop();
    }
}

/// Most-accused target. Ties resolve in map iteration order, which is
/// unspecified.
pub fn tally_winner(accusations: &Accusations) -> Option<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for target in accusations.values() {
        *counts.entry(target.as_str()).or_default() += 1;
    }

    counts
        .into_iter()
        .max_by_key(|&(_, count)| count)
        .map(|(target, _)| target.to_string())
}
