//! Thread-safe duplex wrapper around one realtime socket
//!
//! Reads are serialized against reads and writes against writes, but a read
//! and a write may be in flight at the same time. Closing takes both locks so
//! nothing is left in flight when the transport is torn down.

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::Error as WsError;
use futures_util::future::poll_fn;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::time::{timeout_at, Instant};

use crate::error::RelayError;

type BoxedSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
type BoxedStream = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A live realtime connection to one peer
pub struct Connection {
    id: u64,
    writer: Mutex<BoxedSink>,
    reader: Mutex<BoxedStream>,
    shutdown: watch::Sender<bool>,
    write_timeout: Duration,
}

impl Connection {
    /// Wrap an upgraded WebSocket
    pub fn new(ws: WebSocket, write_timeout: Duration) -> Self {
        let (sink, stream) = ws.split();
        Self::from_parts(sink, stream, write_timeout)
    }

    /// Build a connection from an arbitrary message sink and stream
    pub fn from_parts<Si, St>(sink: Si, stream: St, write_timeout: Duration) -> Self
    where
        Si: Sink<Message, Error = WsError> + Send + 'static,
        St: Stream<Item = Result<Message, WsError>> + Send + 'static,
    {
        let sink: BoxedSink = Box::pin(sink);
        let stream: BoxedStream = Box::pin(stream);
        let (shutdown, _) = watch::channel(false);
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            writer: Mutex::new(sink),
            reader: Mutex::new(stream),
            shutdown,
            write_timeout,
        }
    }

    /// Process-unique id, used in logs
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Read the next inbound message.
    ///
    /// Returns `Ok(None)` once the stream ends or the connection is closed.
    pub async fn read_message(&self) -> Result<Option<Message>, RelayError> {
        let mut shutdown = self.shutdown.subscribe();
        let mut reader = self.reader.lock().await;

        if *shutdown.borrow() {
            return Ok(None);
        }

        tokio::select! {
            _ = shutdown.changed() => Ok(None),
            msg = reader.next() => match msg {
                Some(Ok(msg)) => Ok(Some(msg)),
                Some(Err(e)) => Err(e.into()),
                None => Ok(None),
            },
        }
    }

    /// Serialize `value` as JSON and write it as a text frame.
    ///
    /// One deadline covers waiting for the write lock, waiting for the socket
    /// to take the frame, and flushing it. Running out before the socket takes
    /// the frame is a [`RelayError::WriteTimeout`]; running out afterwards is a
    /// [`RelayError::FlushTimeout`], since the frame is already queued.
    pub async fn write_json<T: Serialize>(&self, value: &T) -> Result<(), RelayError> {
        let text = serde_json::to_string(value)?;
        let deadline = Instant::now() + self.write_timeout;

        let ready = async {
            let mut writer = self.writer.lock().await;
            poll_fn(|cx| writer.as_mut().poll_ready(cx)).await?;
            Ok::<_, WsError>(writer)
        };
        let mut writer = match timeout_at(deadline, ready).await {
            Ok(result) => result?,
            Err(_) => return Err(RelayError::WriteTimeout),
        };

        writer.as_mut().start_send(Message::Text(text))?;

        match timeout_at(deadline, poll_fn(|cx| writer.as_mut().poll_flush(cx))).await {
            Ok(result) => result.map_err(RelayError::from),
            Err(_) => Err(RelayError::FlushTimeout),
        }
    }

    /// Close the underlying transport.
    ///
    /// Wakes a pending reader first, then waits for the write and read locks.
    pub async fn close(&self) -> Result<(), RelayError> {
        self.shutdown.send_replace(true);

        let mut writer = self.writer.lock().await;
        let _reader = self.reader.lock().await;

        match tokio::time::timeout(self.write_timeout, writer.close()).await {
            Ok(result) => result.map_err(RelayError::from),
            Err(_) => Err(RelayError::FlushTimeout),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
