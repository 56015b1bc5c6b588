//! Event-stream response bodies.
//!
//! The relay writes into a bounded channel whose receiver is the response
//! body.  When the client disconnects, hyper drops the body, the channel
//! closes, and the sink reports itself closed.

use std::convert::Infallible;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderName, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use quarry_core::relay::{FrameSink, SinkClosed};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// Frames buffered between the relay and the socket.
pub const BODY_CAPACITY: usize = 16;

/// [`FrameSink`] feeding an HTTP response body.
pub struct ChannelSink {
    tx: Option<mpsc::Sender<Result<Bytes, Infallible>>>,
}

#[async_trait]
impl FrameSink for ChannelSink {
    fn is_open(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    async fn write(&mut self, frame: Bytes) -> Result<(), SinkClosed> {
        let tx = self.tx.as_ref().ok_or(SinkClosed)?;
        tx.send(Ok(frame)).await.map_err(|_| SinkClosed)
    }

    async fn closed(&self) {
        if let Some(tx) = &self.tx {
            tx.closed().await;
        }
    }

    async fn close(&mut self) {
        // Dropping the sender ends the body once buffered frames are flushed.
        self.tx = None;
    }
}

/// A sink and the body it feeds.
pub fn channel(capacity: usize) -> (ChannelSink, Body) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        ChannelSink { tx: Some(tx) },
        Body::from_stream(ReceiverStream::new(rx)),
    )
}

/// Wrap `body` with headers that stop caches and proxies from buffering.
pub fn event_stream(body: Body) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache, no-transform"),
            (X_ACCEL_BUFFERING, "no"),
        ],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod test {
    use http_body_util::BodyExt;

    use super::*;

    #[tokio::test]
    async fn frames_reach_body_and_close_ends_it() {
        let (mut sink, body) = channel(4);
        sink.write(Bytes::from_static(b"data: 1\n\n")).await.unwrap();
        sink.close().await;
        assert!(!sink.is_open());
        assert!(sink.write(Bytes::from_static(b"late")).await.is_err());

        let bytes = body.collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"data: 1\n\n");
    }

    #[test]
    fn event_stream_has_no_connection_specific_headers() {
        let response = event_stream(Body::empty());
        let headers = response.headers();

        assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(headers[header::CACHE_CONTROL], "no-cache, no-transform");
        assert_eq!(headers[X_ACCEL_BUFFERING], "no");
        assert!(!headers.contains_key(header::CONNECTION));
    }

    #[tokio::test]
    async fn dropped_body_reports_sink_closed() {
        let (sink, body) = channel(4);
        assert!(sink.is_open());
        drop(body);
        assert!(!sink.is_open());
        sink.closed().await;
    }
}
