use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use futures::{sink::SinkExt, stream::StreamExt};
use log::{debug, info, warn};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::interval;
use tower_http::cors::CorsLayer;

use crate::pipeline::Snapshot;

const PUSH_INTERVAL: Duration = Duration::from_millis(50); // 20 Hz

#[derive(Clone)]
struct DashboardState {
    snapshots: watch::Receiver<Arc<Snapshot>>,
}

pub fn router(snapshots: watch::Receiver<Arc<Snapshot>>) -> Router {
    Router::new()
        .route("/snapshot", get(snapshot_handler))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(DashboardState { snapshots })
}

/// Serve the snapshot feed until the listener fails.
pub async fn start_dashboard(
    snapshots: watch::Receiver<Arc<Snapshot>>,
    port: u16,
) -> io::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;
    info!("[DASHBOARD] Serving snapshots at http://{}", addr);
    axum::serve(listener, router(snapshots)).await
}

async fn snapshot_handler(State(state): State<DashboardState>) -> Json<Snapshot> {
    let snapshot = state.snapshots.borrow().clone();
    Json((*snapshot).clone())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<DashboardState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: DashboardState) {
    let (mut sender, mut receiver) = socket.split();

    let mut push = tokio::spawn(async move {
        let mut ticker = interval(PUSH_INTERVAL);
        let mut last_tick = None;
        loop {
            ticker.tick().await;
            let snapshot = state.snapshots.borrow().clone();
            if last_tick == Some(snapshot.tick) {
                continue;
            }
            last_tick = Some(snapshot.tick);

            let json = match serde_json::to_string(snapshot.as_ref()) {
                Ok(json) => json,
                Err(e) => {
                    warn!("[DASHBOARD] Snapshot serialization failed: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    // drain client messages until it goes away
    let mut recv = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut push => recv.abort(),
        _ = &mut recv => push.abort(),
    }
    debug!("[DASHBOARD] Client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::connection::{ConnectionState, LinkStats};
    use crate::pipeline::{PipelineInputs, TelemetryPipeline};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_snapshot_endpoint() {
        let (_frames_tx, frames) = mpsc::channel(8);
        let (_commands_tx, commands) = mpsc::channel(8);
        let (_state_tx, connection) = watch::channel(ConnectionState::Disconnected);
        let mut pipeline = TelemetryPipeline::new(
            &AppConfig::default(),
            PipelineInputs {
                frames,
                commands,
                connection,
                link: Arc::new(LinkStats::default()),
            },
        );
        pipeline.tick();
        pipeline.tick();

        let response = router(pipeline.subscribe())
            .oneshot(Request::builder().uri("/snapshot").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let snapshot: Snapshot = serde_json::from_slice(&body).unwrap();
        assert_eq!(snapshot.tick, 2);
        assert_eq!(snapshot.status_text, "✗ Disconnected");
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let (_tx, rx) = watch::channel(Arc::new(Snapshot::idle()));
        let response = router(rx)
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
