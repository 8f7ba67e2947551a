pub mod results;
pub mod store;

use std::sync::Arc;

use crate::game::registry::SessionRegistry;
use crate::middleware::auth::JwtVerifier;
use crate::game::connection::PumpSettings;

use store::SnapshotStore;

pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub verifier: Arc<JwtVerifier>,
    pub store: Arc<dyn SnapshotStore>,
    pub pump: PumpSettings,
}

impl AppState {
    pub fn new(
        registry: Arc<SessionRegistry>,
        verifier: JwtVerifier,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            registry,
            verifier: Arc::new(verifier),
            store,
            pump: PumpSettings::default(),
        }
    }
}
