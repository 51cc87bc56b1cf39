//! The server supervisor (spec §4.5): owns the listening socket, the set of
//! live connections, the shared TLS material, and graceful shutdown.
//! Mirrors the teacher's `smtp::Server` (bind, accept-loop, spawn-per-connection)
//! generalized with `maxClients`, an event-emitter surface, and hot TLS rotation.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::connection::{Connection, SharedTlsConfig};
use crate::error::SmtpError;
use crate::handler::Handler;
use crate::resolver::{NoopResolver, ReverseResolver};
use crate::session::Session;

/// The supervisor's notification surface (spec: "an event-emitter surface
/// exposing `listening`, `close`, `error`, `connect`"). Every method has a
/// no-op default; embedders override only what they want to observe.
pub trait ServerEvents: Send + Sync {
    fn listening(&self, _addr: SocketAddr) {}
    fn closed(&self) {}
    fn error(&self, _err: &SmtpError) {}
    fn connect(&self, _session: &Session) {}
}

pub struct NoopEvents;

impl ServerEvents for NoopEvents {}

/// Owns the listening socket, the live connection set, and TLS material.
/// Construct with [`Server::new`], customize with the `with_*` methods, then
/// call [`Server::listen`].
pub struct Server {
    config: Arc<ServerConfig>,
    handler: Arc<dyn Handler>,
    resolver: Arc<dyn ReverseResolver>,
    events: Arc<dyn ServerEvents>,
    tls_config: SharedTlsConfig,
    implicit_tls: bool,
    connections: Mutex<Vec<JoinHandle<()>>>,
    closing: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
}

impl Server {
    pub fn new(config: ServerConfig, handler: Arc<dyn Handler>) -> Self {
        Server {
            config: Arc::new(config),
            handler,
            resolver: Arc::new(NoopResolver),
            events: Arc::new(NoopEvents),
            tls_config: Arc::new(RwLock::new(None)),
            implicit_tls: false,
            connections: Mutex::new(Vec::new()),
            closing: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ReverseResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn ServerEvents>) -> Self {
        self.events = events;
        self
    }

    /// Initial TLS material, so a STARTTLS upgrade is possible from the
    /// first connection onward instead of only after a later rotation.
    pub async fn with_tls_config(self, server_config: Arc<rustls::ServerConfig>) -> Self {
        *self.tls_config.write().await = Some(server_config);
        self
    }

    /// Whether every accepted connection performs the TLS handshake
    /// immediately, before the greeting banner, instead of waiting for
    /// STARTTLS (spec §4.5 "implicit accept").
    pub fn with_implicit_tls(mut self, implicit: bool) -> Self {
        self.implicit_tls = implicit;
        self
    }

    /// Hot-rotates the TLS key/cert; in-flight handshakes that already
    /// started use whatever value they read (spec: "readers may observe the
    /// old or new value without tearing").
    pub async fn update_secure_context(&self, server_config: Arc<rustls::ServerConfig>) {
        *self.tls_config.write().await = Some(server_config);
    }

    async fn prune_finished(&self) -> usize {
        let mut connections = self.connections.lock().await;
        connections.retain(|h| !h.is_finished());
        connections.len()
    }

    /// Binds and accepts connections until [`Server::shutdown`] is called
    /// from another task, then drains in-flight connections and returns.
    pub async fn listen(&self, port: u16, host: Option<&str>) -> anyhow::Result<()> {
        let host = host.unwrap_or("0.0.0.0");
        let listener = TcpListener::bind((host, port)).await?;
        let local_addr = listener.local_addr()?;
        info!("smtp-engine listening on {local_addr}");
        self.events.listening(local_addr);

        loop {
            if self.closing.load(Ordering::Acquire) {
                break;
            }

            let accepted = tokio::select! {
                biased;
                _ = self.shutdown_notify.notified() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, remote_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept failed: {e}");
                    self.events.error(&SmtpError::Io(e));
                    continue;
                }
            };

            if self.prune_finished().await >= self.config.max_clients {
                let mut stream = stream;
                let _ = stream.write_all(b"421 Too many connected clients\r\n").await;
                continue;
            }

            let config = self.config.clone();
            let handler = self.handler.clone();
            let resolver = self.resolver.clone();
            let events = self.events.clone();
            let tls_config = self.tls_config.clone();
            let closing = self.closing.clone();
            let implicit_tls = self.implicit_tls;

            let task = tokio::spawn(async move {
                if implicit_tls {
                    let server_config = { tls_config.read().await.clone() };
                    let Some(server_config) = server_config else {
                        warn!("implicit-TLS listener has no TLS material configured; dropping connection from {remote_addr}");
                        return;
                    };
                    let acceptor = tokio_rustls::TlsAcceptor::from(server_config);
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            let (_, conn) = tls_stream.get_ref();
                            let cipher = crate::session::TlsCipherInfo {
                                protocol_version: conn.protocol_version().map(|v| format!("{v:?}")).unwrap_or_default(),
                                cipher_suite: conn.negotiated_cipher_suite().map(|c| format!("{c:?}")).unwrap_or_default(),
                            };
                            Connection::new(tls_stream, config, handler, resolver, events, tls_config, closing, local_addr, remote_addr, Some(cipher))
                                .run()
                                .await;
                        }
                        Err(e) => warn!("implicit TLS handshake with {remote_addr} failed: {e}"),
                    }
                } else {
                    Connection::new(stream, config, handler, resolver, events, tls_config, closing, local_addr, remote_addr, None)
                        .run()
                        .await;
                }
            });

            self.connections.lock().await.push(task);
        }

        self.drain(self.config.close_timeout).await;
        self.events.closed();
        Ok(())
    }

    /// Stops accepting new connections and begins the graceful-shutdown
    /// countdown described by the caller's `closeTimeout`. `listen` returns
    /// once every in-flight connection has closed or the timeout elapses.
    pub fn shutdown(&self) {
        self.closing.store(true, Ordering::Release);
        self.shutdown_notify.notify_waiters();
    }

    async fn drain(&self, close_timeout: std::time::Duration) {
        let deadline = tokio::time::Instant::now() + close_timeout;
        loop {
            if self.prune_finished().await == 0 {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        let remaining = self.connections.lock().await;
        if !remaining.is_empty() {
            warn!("close timeout elapsed with {} connection(s) still open; forcing close", remaining.len());
            for handle in remaining.iter() {
                handle.abort();
            }
        }
    }
}
