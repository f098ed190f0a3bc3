//! Multiplexed link state
//!
//! A link is one TCP flow carried over the control channel, identified by a
//! 32-bit id scoped to that channel. The side that owns the underlying
//! socket runs two relay tasks for it: a reader turning socket bytes into
//! [`LinkEvent`]s for the session loop, and a writer draining peer bytes
//! into the socket. Keeping the writer on its own unbounded queue means a
//! stalled socket never blocks the session loop or any other link.

use bytes::Bytes;
use rand::random;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Link identifier, unique among live links on one control channel
pub type LinkId = u32;

/// Read size for the socket relay tasks
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Event emitted by a link's socket reader task
#[derive(Debug)]
pub enum LinkEvent {
    /// Bytes read from the owned socket
    Data { link_id: LinkId, data: Bytes },
    /// The owned socket reached EOF or failed
    Closed { link_id: LinkId },
}

/// Lifecycle of one link on the side that owns the socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Waiting for the peer's open ack; socket bytes are buffered
    Opening,
    /// Confirmed; bytes flow directly in both directions
    Ready,
}

/// One live link and its relay plumbing
pub struct Link {
    state: LinkState,
    /// Socket bytes queued while the peer has not acked yet
    early: VecDeque<Bytes>,
    early_len: usize,
    /// Queue into the socket writer task
    data_tx: mpsc::UnboundedSender<Bytes>,
    reader: JoinHandle<()>,
}

impl Link {
    /// A link awaiting its open ack (the accepting side)
    pub fn opening(data_tx: mpsc::UnboundedSender<Bytes>, reader: JoinHandle<()>) -> Self {
        Self {
            state: LinkState::Opening,
            early: VecDeque::new(),
            early_len: 0,
            data_tx,
            reader,
        }
    }

    /// A link that is confirmed from the start (the dialing side)
    pub fn ready(data_tx: mpsc::UnboundedSender<Bytes>, reader: JoinHandle<()>) -> Self {
        Self {
            state: LinkState::Ready,
            early: VecDeque::new(),
            early_len: 0,
            data_tx,
            reader,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == LinkState::Ready
    }

    /// Bytes currently held in the early buffer
    pub fn early_len(&self) -> usize {
        self.early_len
    }

    /// Queue socket bytes while unconfirmed.
    ///
    /// Returns `false` when the chunk would push the buffer past `limit`;
    /// the caller must close the link.
    pub fn buffer_early(&mut self, data: Bytes, limit: usize) -> bool {
        debug_assert_eq!(self.state, LinkState::Opening);
        if self.early_len + data.len() > limit {
            return false;
        }
        self.early_len += data.len();
        self.early.push_back(data);
        true
    }

    /// Mark the link confirmed and hand back the buffered chunks in arrival
    /// order so the caller can flush them before any newer bytes.
    pub fn confirm(&mut self) -> VecDeque<Bytes> {
        self.state = LinkState::Ready;
        self.early_len = 0;
        std::mem::take(&mut self.early)
    }

    /// Push peer bytes toward the owned socket.
    ///
    /// Returns `false` if the writer task is gone (socket already failed).
    pub fn forward(&self, data: Bytes) -> bool {
        self.data_tx.send(data).is_ok()
    }

    /// Stop the relay tasks. The reader is aborted; the writer drains its
    /// remaining queue and exits once the queue sender is dropped.
    pub fn shutdown(self) {
        self.reader.abort();
    }
}

/// Per-channel map of live links
#[derive(Default)]
pub struct LinkTable {
    links: HashMap<LinkId, Link>,
}

impl LinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, link_id: LinkId, link: Link) {
        self.links.insert(link_id, link);
    }

    pub fn get(&self, link_id: LinkId) -> Option<&Link> {
        self.links.get(&link_id)
    }

    pub fn get_mut(&mut self, link_id: LinkId) -> Option<&mut Link> {
        self.links.get_mut(&link_id)
    }

    pub fn remove(&mut self, link_id: LinkId) -> Option<Link> {
        self.links.remove(&link_id)
    }

    pub fn contains(&self, link_id: LinkId) -> bool {
        self.links.contains_key(&link_id)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Tear down every link, returning the ids that were live
    pub fn shutdown_all(&mut self) -> Vec<LinkId> {
        let ids: Vec<LinkId> = self.links.keys().copied().collect();
        for (_, link) in self.links.drain() {
            link.shutdown();
        }
        ids
    }
}

/// Process-wide set of live link ids.
///
/// Ids are drawn uniformly at random from the full 32-bit space and retried
/// on collision; an id becomes reusable the moment it is released.
#[derive(Default)]
pub struct LinkIdAllocator {
    live: Mutex<HashSet<LinkId>>,
}

impl LinkIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a fresh id
    pub fn allocate(&self) -> LinkId {
        let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            let id: LinkId = random();
            if live.insert(id) {
                return id;
            }
        }
    }

    /// Return an id to the pool
    pub fn release(&self, link_id: LinkId) {
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&link_id);
    }

    /// Number of ids currently live
    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Spawn the relay tasks for a freshly owned socket.
///
/// Returns the sender feeding the socket writer. The reader task forwards
/// socket bytes as [`LinkEvent::Data`] and emits one [`LinkEvent::Closed`]
/// on EOF or error; the writer task drains its queue with `write_all` and
/// exits when the sender side is dropped.
pub fn spawn_socket_tasks<S>(
    socket: S,
    link_id: LinkId,
    events_tx: mpsc::Sender<LinkEvent>,
) -> (mpsc::UnboundedSender<Bytes>, JoinHandle<()>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(socket);
    let (data_tx, mut data_rx) = mpsc::unbounded_channel::<Bytes>();

    let reader = tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let data = Bytes::copy_from_slice(&buf[..n]);
                    if events_tx.send(LinkEvent::Data { link_id, data }).await.is_err() {
                        return; // session gone, no point reporting the close
                    }
                }
                Err(e) => {
                    debug!("link {} socket read error: {}", link_id, e);
                    break;
                }
            }
        }
        let _ = events_tx.send(LinkEvent::Closed { link_id }).await;
    });

    tokio::spawn(async move {
        while let Some(chunk) = data_rx.recv().await {
            trace!("link {} writing {} bytes to socket", link_id, chunk.len());
            if write_half.write_all(&chunk).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    (data_tx, reader)
}
