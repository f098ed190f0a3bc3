//! Server front: control listener, admission, session spawning

pub mod admission;
pub mod allowlist;
pub mod binds;
pub mod session;

use crate::channel::{self, REJECT_CLOSE_CODE};
use crate::link::LinkIdAllocator;
use allowlist::Allowlist;
use binds::BindRegistry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// Shared state of one gateway server
pub struct Gateway {
    allowlist: Arc<Allowlist>,
    /// Endpoints bound on behalf of clients
    pub binds: Arc<BindRegistry>,
    /// Process-wide live link ids
    pub ids: Arc<LinkIdAllocator>,
    next_channel: AtomicU64,
}

impl Gateway {
    pub fn new(allowlist: Arc<Allowlist>) -> Arc<Self> {
        Arc::new(Self {
            allowlist,
            binds: BindRegistry::new(),
            ids: Arc::new(LinkIdAllocator::new()),
            next_channel: AtomicU64::new(1),
        })
    }

    /// Accept control connections until ctrl-c.
    ///
    /// Each accepted connection runs its TLS and WebSocket handshakes and
    /// admission on its own task, then serves its session to completion.
    pub async fn run(self: Arc<Self>, listener: TcpListener, acceptor: TlsAcceptor) -> crate::Result<()> {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!("control connection from {}", peer);
                            let gateway = Arc::clone(&self);
                            let acceptor = acceptor.clone();
                            tokio::spawn(async move {
                                if let Err(e) = gateway.handle_control(stream, acceptor).await {
                                    debug!("control connection from {} ended: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => error!("control accept error: {}", e),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_control(
        self: Arc<Self>,
        stream: TcpStream,
        acceptor: TlsAcceptor,
    ) -> crate::Result<()> {
        stream.set_nodelay(true)?;

        let tls_stream = acceptor.accept(stream).await?;

        // capture the peer certificate before the stream is consumed
        let peer_cert: Option<Vec<u8>> = tls_stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.as_ref().to_vec());

        let ws = tokio_tungstenite::accept_async(tls_stream).await?;
        let (mut sink, reader) = channel::split(ws);

        let digest = match admission::admit(peer_cert.as_deref(), &self.allowlist) {
            Ok(digest) => digest,
            Err(reason) => {
                sink.close_with(REJECT_CLOSE_CODE, reason).await?;
                return Ok(());
            }
        };

        let channel_id = self.next_channel.fetch_add(1, Ordering::Relaxed);
        info!("channel {} admitted (key {})", channel_id, digest);

        session::run(
            channel_id,
            sink,
            reader,
            Arc::clone(&self.binds),
            Arc::clone(&self.ids),
        )
        .await
    }
}
