//! The per-substream handle.
//!
//! A [`SessionStream`] delivers bytes reliably and in order, independent of
//! every other substream on the same connection. Chunks that arrive before
//! a read callback is registered are buffered and replayed, in order, on
//! registration; no message framing is implied.

use super::connection::{ConnectCallback, ConnectionRef, SessionConnection, StreamState, SubstreamListener};
use super::frame::StreamFrame;
use super::{lock, Endpoint, STREAM_ERR_CLOSED};
use crate::error::ServerError;
use std::sync::{Arc, Mutex};

/// Callback receiving ordered byte chunks as they arrive.
pub type ReadCallback = Box<dyn FnMut(&[u8]) + Send>;

struct CallbackSlot {
    callback: Option<ReadCallback>,
    // Bumped on every (re/de)registration so an in-flight delivery never
    // resurrects a callback the owner just cleared.
    generation: u64,
}

/// One reliable, ordered substream multiplexed over a session connection.
pub struct SessionStream {
    id: u32,
    port: u16,
    connection: ConnectionRef,
    state: Mutex<StreamState>,
    read_callback: Mutex<CallbackSlot>,
    buffered: Mutex<Vec<Vec<u8>>>,
}

impl SessionStream {
    pub(crate) fn new(
        id: u32,
        port: u16,
        connection: ConnectionRef,
        state: StreamState,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            port,
            connection,
            state: Mutex::new(state),
            read_callback: Mutex::new(CallbackSlot {
                callback: None,
                generation: 0,
            }),
            buffered: Mutex::new(Vec::new()),
        })
    }

    /// Substream id within its connection; 0 is the top-level stream.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The port this substream was opened on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Current establishment state.
    pub fn state(&self) -> StreamState {
        *lock(&self.state)
    }

    pub(crate) fn set_state(&self, state: StreamState) {
        *lock(&self.state) = state;
    }

    /// The connection backing this stream, unless it has been dropped.
    pub fn connection(&self) -> Option<Arc<SessionConnection>> {
        self.connection.upgrade()
    }

    /// Local endpoint of the backing connection.
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.connection().map(|c| c.local_endpoint())
    }

    /// Remote endpoint of the backing connection.
    pub fn remote_endpoint(&self) -> Option<Endpoint> {
        self.connection().map(|c| c.remote_endpoint())
    }

    /// Registers (or with `None`, clears) the read callback.
    ///
    /// Chunks that arrived before registration are replayed immediately, in
    /// arrival order. The callback may clear or replace itself from within
    /// its own invocation.
    pub fn register_read_callback(&self, callback: Option<ReadCallback>) {
        {
            let mut slot = lock(&self.read_callback);
            slot.callback = callback;
            slot.generation += 1;
        }
        self.flush_buffered();
    }

    pub(crate) fn deliver(&self, bytes: Vec<u8>) {
        lock(&self.buffered).push(bytes);
        self.flush_buffered();
    }

    fn flush_buffered(&self) {
        loop {
            let (mut callback, generation) = {
                let mut slot = lock(&self.read_callback);
                match slot.callback.take() {
                    Some(cb) => (cb, slot.generation),
                    None => return,
                }
            };

            let chunk = {
                let mut buffered = lock(&self.buffered);
                if buffered.is_empty() {
                    None
                } else {
                    Some(buffered.remove(0))
                }
            };

            let had_chunk = chunk.is_some();
            if let Some(bytes) = chunk {
                callback(&bytes);
            }

            // Restore only if the callback did not deregister or replace
            // itself while we held it out of the slot.
            {
                let mut slot = lock(&self.read_callback);
                if slot.generation == generation {
                    slot.callback = Some(callback);
                } else {
                    return;
                }
            }

            if !had_chunk {
                return;
            }
        }
    }

    /// Reliable ordered write onto this substream.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), ServerError> {
        if self.state() != StreamState::Established {
            return Err(ServerError::Network(format!(
                "substream {} is not established",
                self.id
            )));
        }
        let connection = self
            .connection()
            .ok_or_else(|| ServerError::Network("connection dropped".to_string()))?;
        connection
            .send_frame(StreamFrame::Data {
                id: self.id,
                bytes: bytes.to_vec(),
            })
            .await
    }

    /// Opens a child substream on `port`, optionally pre-seeded with
    /// `initial` bytes.
    pub async fn create_child_stream(
        &self,
        on_connect: ConnectCallback,
        initial: Option<Vec<u8>>,
        port: u16,
    ) {
        match self.connection() {
            Some(connection) => connection.open_substream(port, initial, on_connect).await,
            None => on_connect(STREAM_ERR_CLOSED, None),
        }
    }

    /// Accepts inbound substreams on `port` of the backing connection.
    pub fn listen_substream(&self, port: u16, on_substream: SubstreamListener) {
        if let Some(connection) = self.connection() {
            connection.listen_substream(port, on_substream);
        }
    }

    /// Closes this substream.
    ///
    /// Closing the top-level stream tears down the whole connection.
    /// Graceful close notifies the peer; `force = true` skips the close
    /// frame and, on the top-level stream, aborts the read task.
    pub async fn close(&self, force: bool) {
        if self.id == 0 {
            if let Some(connection) = self.connection() {
                connection.close(force).await;
            }
            return;
        }

        self.set_state(StreamState::Closed);
        if let Some(connection) = self.connection() {
            connection.remove_substream(self.id);
            if !force {
                let _ = connection
                    .send_frame(StreamFrame::CloseSubstream { id: self.id })
                    .await;
            }
        }
    }
}

impl std::fmt::Debug for SessionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStream")
            .field("id", &self.id)
            .field("port", &self.port)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn detached_stream() -> Arc<SessionStream> {
        SessionStream::new(5, 16, std::sync::Weak::new(), StreamState::Established)
    }

    #[test]
    fn test_chunks_before_registration_are_replayed_in_order() {
        let stream = detached_stream();
        stream.deliver(b"one".to_vec());
        stream.deliver(b"two".to_vec());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        stream.register_read_callback(Some(Box::new(move |bytes| {
            lock(&seen_clone).push(bytes.to_vec());
        })));

        let seen = lock(&seen);
        assert_eq!(seen.as_slice(), &[b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn test_callback_may_deregister_itself() {
        let stream = detached_stream();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = calls.clone();
        let stream_clone = stream.clone();
        stream.register_read_callback(Some(Box::new(move |_bytes| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            stream_clone.register_read_callback(None);
        })));

        stream.deliver(b"a".to_vec());
        stream.deliver(b"b".to_vec());

        // The second chunk stays buffered: the callback cleared itself
        // during the first delivery and must not be resurrected.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_write_requires_established_state() {
        let stream = SessionStream::new(7, 16, std::sync::Weak::new(), StreamState::Connecting);
        assert!(stream.write(b"payload").await.is_err());
    }
}
