// =============================================================================
// SSE Handler — push stream of new symbol detections
// =============================================================================
//
// `POST /live/activity` upgrades into a Server-Sent-Events stream fed from a
// dedicated correlator subscription. Message types: `connection` (once, on
// connect), `symbol_detection` (per correlator output), `heartbeat` (every
// 30 s, scheduled here — not by the activity log), and `error` (when this
// subscriber lagged and missed outputs).
// =============================================================================

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use futures_util::Stream;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::app_state::AppState;
use crate::correlator::CorrelatorOutput;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Per-connection buffer between the pump task and the HTTP writer.
const CONNECTION_BUFFER: usize = 64;

pub async fn activity_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let outputs = state.correlator.subscribe();
    let (tx, rx) = mpsc::channel::<Event>(CONNECTION_BUFFER);

    let connected = Event::default()
        .event("connection")
        .data(serde_json::json!({ "status": "connected" }).to_string());
    let _ = tx.try_send(connected);

    tokio::spawn(pump(outputs, tx));

    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok(event), rx))
    });
    Sse::new(stream)
}

/// Forward correlator outputs and heartbeats until the client goes away.
async fn pump(mut outputs: broadcast::Receiver<CorrelatorOutput>, tx: mpsc::Sender<Event>) {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // the first tick fires immediately

    loop {
        let event = tokio::select! {
            _ = heartbeat.tick() => Event::default()
                .event("heartbeat")
                .data(serde_json::json!({ "ts": crate::types::now_ms() }).to_string()),

            output = outputs.recv() => match output {
                Ok(output) => match Event::default().event("symbol_detection").json_data(&output) {
                    Ok(event) => event,
                    Err(e) => {
                        debug!(error = %e, "failed to serialize detection for SSE");
                        continue;
                    }
                },
                Err(broadcast::error::RecvError::Lagged(n)) => Event::default()
                    .event("error")
                    .data(serde_json::json!({ "lagged": n }).to_string()),
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        if tx.send(event).await.is_err() {
            // Client disconnected.
            break;
        }
    }
    debug!("sse connection pump stopped");
}
