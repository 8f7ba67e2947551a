use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
};

use crate::game::connection::ClientConnection;
use crate::middleware::auth::{admit, AdmissionParams};
use crate::services::AppState;

/// `GET /ws?token=..&game_id=..`. The credential is checked before the
/// upgrade; a rejected client never gets a socket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<AdmissionParams>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let admission = match admit(&state.verifier, &params, &headers) {
        Ok(admission) => admission,
        Err(e) => {
            tracing::warn!(
                game_id = params.game_id.as_deref().unwrap_or(""),
                error = %e,
                "websocket admission rejected"
            );
            return e.into_response();
        }
    };

    let pump = state.pump.clone();
    ws.max_message_size(pump.max_message_size)
        .on_upgrade(move |socket| async move {
            let session = state.registry.get_or_create(&admission.session_id);
            let identity = admission.identity;

            tracing::info!(
                session_id = %admission.session_id,
                user = identity.label(),
                is_guest = identity.is_guest,
                "client admitted"
            );

            ClientConnection::new(identity, session, pump).serve(socket).await;
        })
}
