//! The connection state machine (spec §4.4): owns the socket, the wire
//! parser, and the per-connection context, and drives the serialized
//! command-processing loop described there.

pub mod context;

mod commands;

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;

use crate::config::ServerConfig;
use crate::error::SmtpError;
use crate::handler::{DataStream, Handler};
use crate::id::generate_connection_id;
use crate::parser::WireParser;
use crate::resolver::{bracketed_literal, ReverseResolver, RESOLVE_BUDGET};
use crate::server::ServerEvents;
use crate::session::{transmission_type, Session, TlsCipherInfo};

pub use context::ConnectionContext;

/// TLS material shared with the supervisor so [`Server::update_secure_context`](crate::server::Server::update_secure_context)
/// can hot-rotate it; `None` until the embedder supplies one.
pub type SharedTlsConfig = Arc<RwLock<Option<Arc<rustls::ServerConfig>>>>;

const EARLY_TALKER_DELAY: Duration = Duration::from_millis(100);
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// The transport a connection rides on: a plain socket, or (after STARTTLS,
/// or from the start for an implicitly-secure listener) a TLS stream over
/// the same underlying socket. Generic over `S` so tests can substitute
/// `tokio::io::DuplexStream` for a real `TcpStream`.
enum Transport<S> {
    Plain(S),
    Tls(Box<tokio_rustls::server::TlsStream<S>>),
    /// Only ever observed transiently while `Connection::upgrade_to_tls` is
    /// mid-swap; polling it is a bug.
    Upgrading,
}

impl<S: AsyncRead + Unpin> AsyncRead for Transport<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Transport::Upgrading => unreachable!("polled Transport mid-upgrade"),
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Transport<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Transport::Upgrading => unreachable!("polled Transport mid-upgrade"),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Transport::Upgrading => unreachable!("polled Transport mid-upgrade"),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Transport::Upgrading => unreachable!("polled Transport mid-upgrade"),
        }
    }
}

/// A single client connection: the socket, the wire parser, and the
/// protocol state, bound together (mirrors the teacher's `SmtpProtocol<R,
/// W>`, generalized to own a replaceable transport instead of a fixed
/// reader/writer pair, since STARTTLS must upgrade the socket in place).
pub struct Connection<S> {
    transport: Transport<S>,
    parser: WireParser,
    ctx: ConnectionContext,
    config: Arc<ServerConfig>,
    handler: Arc<dyn Handler>,
    resolver: Arc<dyn ReverseResolver>,
    events: Arc<dyn ServerEvents>,
    tls_config: SharedTlsConfig,
    /// Set by the supervisor once a graceful shutdown begins; checked on
    /// every inbound line so in-flight connections start replying 421
    /// (spec §4.5 "running handlers begin replying 421 Server shutting
    /// down").
    shared_closing: Arc<AtomicBool>,
    last_activity: Instant,
    /// Bytes the wire parser was still holding (an unterminated command-mode
    /// fragment) at the moment DATA switched it into data mode; `feed` must
    /// route these into the first `feed_data_mode` call (spec §4.1
    /// `startDataMode`: "returns any unflushed command-mode tail").
    data_mode_carry: Vec<u8>,
    /// Unstuffed DATA body bytes accumulated across every `feed()` call
    /// since the current DATA started; a socket `read()` only ever delivers
    /// part of a message, so this can't live as a variable local to `feed`.
    /// Drained by `finish_data` once the terminator arrives.
    data_body: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Connection<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream: S,
        config: Arc<ServerConfig>,
        handler: Arc<dyn Handler>,
        resolver: Arc<dyn ReverseResolver>,
        events: Arc<dyn ServerEvents>,
        tls_config: SharedTlsConfig,
        shared_closing: Arc<AtomicBool>,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        initial_tls_cipher: Option<TlsCipherInfo>,
    ) -> Self {
        let secure = initial_tls_cipher.is_some();
        let session = Session {
            id: generate_connection_id(),
            secure,
            server_name: config.server_name.clone(),
            local_address: local_addr.ip(),
            local_port: local_addr.port(),
            remote_address: remote_addr.ip(),
            remote_port: remote_addr.port(),
            client_hostname: bracketed_literal(remote_addr.ip()),
            transmission_type: transmission_type(false, config.lmtp, secure, false),
            tls_cipher: initial_tls_cipher,
            user: None,
            transaction: 0,
            envelope: Default::default(),
        };

        Connection {
            transport: Transport::Plain(stream),
            parser: WireParser::new(),
            ctx: ConnectionContext::new(session, config.lmtp),
            config,
            handler,
            resolver,
            events,
            tls_config,
            shared_closing,
            last_activity: Instant::now(),
            data_mode_carry: Vec::new(),
            data_body: Vec::new(),
        }
    }

    /// Runs the connection to completion: initialization, the serialized
    /// read/process loop, and teardown. Never returns an `Err` the caller
    /// needs to act on; transport failures are logged and the connection is
    /// simply dropped (spec §7: "nothing in the core throws").
    pub async fn run(mut self) {
        if !self.initialize().await {
            return;
        }

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let remaining = self.remaining_socket_budget();
            match timeout(remaining, self.transport.read(&mut buf)).await {
                Ok(Ok(0)) => {
                    self.handle_eof().await;
                    break;
                }
                Ok(Ok(n)) => {
                    self.last_activity = Instant::now();
                    if !self.feed(&buf[..n]).await {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    debug!("connection {}: transport error: {e}", self.ctx.session.id);
                    break;
                }
                Err(_elapsed) => {
                    if self.last_activity.elapsed() >= self.config.socket_timeout {
                        let _ = self.send_reply_text("421 Timeout - closing connection\r\n").await;
                        break;
                    }
                    // Activity happened since the timer was armed; the next
                    // loop iteration re-derives the remaining slice.
                }
            }
        }

        self.handler.on_close(&self.ctx.session).await;
        info!("connection {} closed", self.ctx.session.id);
    }

    fn remaining_socket_budget(&self) -> Duration {
        self.config.socket_timeout.saturating_sub(self.last_activity.elapsed())
    }

    /// The `(E)(L?)SMTP(S?)(A?)` identifier for the connection's current
    /// state, re-derived rather than cached so it tracks EHLO/STARTTLS/AUTH
    /// as they happen.
    pub(super) fn current_transmission_type(&self) -> String {
        let opened_with_ehlo = self.ctx.opening_command.as_deref() == Some("EHLO");
        transmission_type(opened_with_ehlo, self.config.lmtp, self.ctx.session.secure, self.ctx.authenticated)
    }

    /// Fires the supervisor's `connect` event exactly once, whenever it
    /// first becomes pending (normally right after `onConnect`, with MAIL
    /// re-checking defensively per spec).
    pub(super) fn emit_connect_if_pending(&mut self) {
        if !self.ctx.connect_emitted {
            self.ctx.connect_emitted = true;
            self.events.connect(&self.ctx.session);
        }
    }

    async fn initialize(&mut self) -> bool {
        tokio::time::sleep(EARLY_TALKER_DELAY).await;

        if self.config.reverse_dns_enabled {
            let resolve = timeout(RESOLVE_BUDGET, self.resolver.resolve(self.ctx.session.remote_address));
            if let Ok(Some(hostname)) = resolve.await {
                self.ctx.session.client_hostname = hostname;
            }
        }

        if let Err(reject) = self.handler.on_connect(&self.ctx.session).await {
            let _ = self.send_reply_text(&format!("{} {}\r\n", reject.code, reject.message)).await;
            return false;
        }
        self.emit_connect_if_pending();

        if self.ctx.session.secure {
            if let Some(cipher) = self.ctx.session.tls_cipher.clone() {
                if self.handler.on_secure(&cipher, &self.ctx.session).await.is_err() {
                    return false;
                }
            }
        }

        self.ctx.ready = true;
        let transmission = transmission_type(false, self.config.lmtp, self.ctx.session.secure, false);
        let banner = match &self.config.banner {
            Some(b) => format!(" {b}"),
            None => String::new(),
        };
        let line = format!("220 {} {}{}\r\n", self.config.server_name, transmission, banner);
        self.send_reply_text(&line).await.is_ok()
    }

    async fn handle_eof(&mut self) {
        if self.parser.is_data_mode() {
            warn!(
                "connection {}: socket closed before the DATA terminator arrived",
                self.ctx.session.id
            );
            self.data_body.clear();
            let (tx, rx) = mpsc::channel(1);
            let _ = tx.send(Err(SmtpError::ConnectionClosedDuringData)).await;
            drop(tx);
            let stream = DataStream::new(rx, 0, false);
            let _ = self.handler.on_data(stream, &self.ctx.session).await;
        }
        let _ = self.parser.flush();
    }

    /// Feeds one inbound chunk through the parser and `process_line`, in
    /// order, one line at a time (spec: "serialized command processing").
    /// Returns `false` once the connection should close.
    async fn feed(&mut self, chunk: &[u8]) -> bool {
        let mut pending = chunk.to_vec();
        loop {
            if self.parser.is_data_mode() {
                let result = self.parser.feed_data_mode(&pending);
                pending.clear();
                for c in result.chunks {
                    self.data_body.extend_from_slice(&c);
                }
                match result.end {
                    Some(end) => {
                        let body = std::mem::take(&mut self.data_body);
                        if !self.finish_data(body, end).await {
                            return false;
                        }
                        pending = result.remainder.unwrap_or_default();
                        if pending.is_empty() && !self.parser.is_data_mode() {
                            return true;
                        }
                        continue;
                    }
                    None => return true,
                }
            }

            let lines = self.parser.feed_command_mode(&pending);
            pending.clear();
            let mut switched_to_data = false;
            for (idx, line) in lines.iter().enumerate() {
                if !self.process_line(line).await {
                    return false;
                }
                if self.parser.is_data_mode() {
                    // Everything after this line in `lines` was actually
                    // raw body bytes that feed_command_mode mis-split on
                    // `\n`; reconstitute them (each did end in `\r\n` in
                    // the original bytes) ahead of whatever unterminated
                    // fragment DATA's own start_data_mode() carried over.
                    let mut rebuilt = Vec::new();
                    for rest in &lines[idx + 1..] {
                        rebuilt.extend_from_slice(rest.as_bytes());
                        rebuilt.extend_from_slice(b"\r\n");
                    }
                    rebuilt.extend_from_slice(&std::mem::take(&mut self.data_mode_carry));
                    pending = rebuilt;
                    switched_to_data = true;
                    break;
                }
            }
            if !switched_to_data && pending.is_empty() {
                return true;
            }
        }
    }

    async fn send_reply_text(&mut self, text: &str) -> std::io::Result<()> {
        self.transport.write_all(text.as_bytes()).await?;
        self.transport.flush().await
    }

    async fn send_reply(&mut self, reply: String) -> bool {
        if self.send_reply_text(&reply).await.is_err() {
            return false;
        }
        true
    }

    /// Replaces the transport with its TLS-wrapped upgrade using the
    /// currently active server TLS config.
    async fn upgrade_to_tls(&mut self) -> bool {
        let server_config = { self.tls_config.read().await.clone() };
        let Some(server_config) = server_config else {
            warn!("connection {}: STARTTLS requested but no TLS config is set", self.ctx.session.id);
            return false;
        };

        let plain = match std::mem::replace(&mut self.transport, Transport::Upgrading) {
            Transport::Plain(s) => s,
            other => {
                self.transport = other;
                return false;
            }
        };

        let acceptor = tokio_rustls::TlsAcceptor::from(server_config);
        match acceptor.accept(plain).await {
            Ok(tls_stream) => {
                let (_, conn) = tls_stream.get_ref();
                let protocol_version = conn.protocol_version().map(|v| format!("{v:?}")).unwrap_or_default();
                let cipher_suite = conn.negotiated_cipher_suite().map(|c| format!("{c:?}")).unwrap_or_default();
                self.transport = Transport::Tls(Box::new(tls_stream));
                self.ctx.session.secure = true;
                self.ctx.session.tls_cipher = Some(crate::session::TlsCipherInfo {
                    protocol_version,
                    cipher_suite,
                });
                self.ctx.reset_after_starttls();
                self.ctx.session.transmission_type = self.current_transmission_type();
                true
            }
            Err(e) => {
                warn!("connection {}: TLS handshake failed: {e}", self.ctx.session.id);
                false
            }
        }
    }
}
