use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;

/// Final outcome of one session, handed upstream once per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GameResult {
    pub session_id: String,
    pub winner_id: Option<String>,
    pub accusations: HashMap<String, String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn deliver(&self, result: &GameResult) -> anyhow::Result<()>;
}

/// Placeholder sink until the upstream results service exposes an API.
#[derive(Debug, Default)]
pub struct LoggingResultSink;

#[async_trait]
impl ResultSink for LoggingResultSink {
    async fn deliver(&self, result: &GameResult) -> anyhow::Result<()> {
        tracing::info!(
            session_id = %result.session_id,
            winner_id = result.winner_id.as_deref().unwrap_or(""),
            accusers = result.accusations.len(),
            "delivering game result"
        );
        Ok(())
    }
}
