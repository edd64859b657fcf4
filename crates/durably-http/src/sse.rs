//! Frames a `RunEventStream` as `text/event-stream`, one `data: <json>\n\n`
//! line per event.

use std::convert::Infallible;

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use durably_core::RunEventStream;
use futures::stream::Stream;

pub fn to_sse(mut stream: RunEventStream) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let body = async_stream::stream! {
        while let Some(event) = stream.next().await {
            match serde_json::to_string(&event) {
                Ok(json) => yield Ok(SseEvent::default().data(json)),
                Err(err) => {
                    tracing::error!(error = %err, "failed to serialize event for SSE");
                }
            }
        }
    };
    Sse::new(body).keep_alive(KeepAlive::default())
}
