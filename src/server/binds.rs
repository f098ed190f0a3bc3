//! Shared listener registry for client BIND requests
//!
//! One entry per `host:port` endpoint, holding the listening socket task
//! and the set of control channels serving it. A second client binding the
//! same endpoint joins the existing entry; accepted connections are dealt
//! round-robin across the participants. The listener lives exactly as long
//! as its participant set is non-empty.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// A control channel's membership in a bind entry
struct Participant {
    channel_id: u64,
    /// Hands accepted sockets to the channel's session loop
    inbound_tx: mpsc::Sender<TcpStream>,
}

/// One bound endpoint shared by its participating channels
struct BindEntry {
    participants: Vec<Participant>,
    /// Round-robin cursor over `participants`
    next: usize,
    /// Dropping this stops the accept loop
    cancel_tx: mpsc::Sender<()>,
}

/// Registry of every endpoint bound on behalf of clients
#[derive(Default)]
pub struct BindRegistry {
    entries: Mutex<HashMap<String, BindEntry>>,
}

impl BindRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Handle a BIND for `host:port` from one channel.
    ///
    /// Joins the existing entry when the endpoint is already bound,
    /// otherwise opens the listener. The error string is the message
    /// reported back in the BIND_ACK.
    pub async fn bind(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        channel_id: u64,
        inbound_tx: mpsc::Sender<TcpStream>,
    ) -> Result<(), String> {
        let key = format!("{}:{}", host, port);
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get_mut(&key) {
            if entry.participants.iter().any(|p| p.channel_id == channel_id) {
                debug!("channel {} re-bound {}", channel_id, key);
            } else {
                entry.participants.push(Participant {
                    channel_id,
                    inbound_tx,
                });
                info!(
                    "channel {} joined bind {} ({} participant(s))",
                    channel_id,
                    key,
                    entry.participants.len()
                );
            }
            return Ok(());
        }

        let listener = TcpListener::bind(&key).await.map_err(|e| e.to_string())?;
        info!("bound {} for channel {}", key, channel_id);

        let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);
        entries.insert(
            key.clone(),
            BindEntry {
                participants: vec![Participant {
                    channel_id,
                    inbound_tx,
                }],
                next: 0,
                cancel_tx,
            },
        );

        let registry = Arc::downgrade(self);
        tokio::spawn(accept_loop(listener, key, registry, cancel_rx));

        Ok(())
    }

    /// Drop a channel from every entry it participates in, closing the
    /// listeners left without participants.
    pub async fn release_channel(&self, channel_id: u64) {
        let mut entries = self.entries.lock().await;
        entries.retain(|key, entry| {
            let before = entry.participants.len();
            entry.participants.retain(|p| p.channel_id != channel_id);
            if entry.participants.len() != before {
                debug!("channel {} left bind {}", channel_id, key);
            }
            if entry.participants.is_empty() {
                info!("closing listener {}: no participants left", key);
                false
            } else {
                entry.next %= entry.participants.len();
                true
            }
        });
    }

    /// Number of live listeners (equals the number of entries)
    pub async fn listener_count(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Route one accepted connection to a participant, round-robin.
    ///
    /// Participants whose session is gone are pruned and the next one is
    /// tried; the connection is dropped when nobody is left.
    async fn dispatch(&self, key: &str, mut stream: TcpStream) {
        loop {
            let picked = {
                let mut entries = self.entries.lock().await;
                let entry = match entries.get_mut(key) {
                    Some(entry) => entry,
                    None => {
                        debug!("dropping accept on {}: entry gone", key);
                        return;
                    }
                };
                if entry.participants.is_empty() {
                    return;
                }
                entry.next %= entry.participants.len();
                let p = &entry.participants[entry.next];
                entry.next = (entry.next + 1) % entry.participants.len();
                (p.channel_id, p.inbound_tx.clone())
            };

            // send outside the lock so a busy session cannot stall the registry
            match picked.1.send(stream).await {
                Ok(()) => return,
                Err(send_err) => {
                    stream = send_err.0;
                    warn!(
                        "channel {} unreachable, pruning from bind {}",
                        picked.0, key
                    );
                    let mut entries = self.entries.lock().await;
                    if let Some(entry) = entries.get_mut(key) {
                        entry.participants.retain(|p| p.channel_id != picked.0);
                        if entry.participants.is_empty() {
                            info!("closing listener {}: no participants left", key);
                            entries.remove(key);
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Accept loop for one bound endpoint. Ends when the entry is removed
/// (cancel sender dropped) and takes any undispatched sockets with it.
async fn accept_loop(
    listener: TcpListener,
    key: String,
    registry: Weak<BindRegistry>,
    mut cancel_rx: mpsc::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = cancel_rx.recv() => {
                debug!("accept loop for {} cancelled", key);
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!("external connection from {} on {}", peer, key);
                        let Some(registry) = registry.upgrade() else { break };
                        registry.dispatch(&key, stream).await;
                    }
                    Err(e) => warn!("accept failed on {}: {}", key, e),
                }
            }
        }
    }
}
