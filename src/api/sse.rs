//! Shared SSE framing for the task/batch event endpoints (spec.md §6):
//! `event: <name>\ndata: <json>\n\n`, closing once a terminal event is
//! emitted or the subscriber lags/the bus closes.

use async_stream::stream;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use serde::Serialize;
use std::convert::Infallible;
use tokio::sync::broadcast;

/// `name_of` maps an event to its SSE event name and whether it's
/// terminal for the stream (the stream ends right after sending it).
pub fn event_stream<E>(
    mut rx: broadcast::Receiver<E>,
    name_of: impl Fn(&E) -> (String, bool) + Send + 'static,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    E: Clone + Serialize + Send + 'static,
{
    let body = stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let (name, terminal) = name_of(&event);
                    let data = serde_json::to_string(&event).unwrap_or_else(|_| "null".to_string());
                    yield Ok(Event::default().event(name).data(data));
                    if terminal {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    };

    Sse::new(body).keep_alive(KeepAlive::default())
}
