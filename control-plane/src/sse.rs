//! Bus subscription → SSE response body.

use std::convert::Infallible;
use std::time::Duration;

use axum::body::Body;
use axum::http::header;
use axum::response::Response;
use futures_util::stream;
use tokio::sync::broadcast;

const HEARTBEAT: Duration = Duration::from_secs(15);

/// Streams `data: {json}\n\n` frames from a bus subscription, with a
/// `: ping` heartbeat during silence. Ends when the channel closes.
pub fn sse_response(rx: broadcast::Receiver<String>) -> Response {
    let frames = stream::unfold(rx, |mut rx| async move {
        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Ok(payload) => {
                        return Some((Ok::<_, Infallible>(format!("data: {payload}\n\n")), rx));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("sse subscriber lagged, skipped {skipped} events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
                _ = tokio::time::sleep(HEARTBEAT) => {
                    return Some((Ok(": ping\n\n".to_string()), rx));
                }
            }
        }
    });

    let mut response = Response::new(Body::from_stream(frames));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/event-stream"),
    );
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-cache"),
    );
    response
}
