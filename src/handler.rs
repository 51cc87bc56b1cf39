//! The `Handler` trait: the single pluggable seam an embedding application
//! implements (spec §6 "Callback contracts offered to the embedding"),
//! generalized across the connection lifecycle's seven callback points.
//! Every method has a conservative default rejection, so an embedder
//! overrides only the phases it cares about.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::address::ParsedPath;
use crate::auth::AuthCredentials;
use crate::error::{Reject, SmtpError};
use crate::session::{AuthenticatedUser, Session, TlsCipherInfo};

/// A single recipient's outcome in an LMTP `onData` response (spec §4.4
/// DATA: "the callback may return a per-recipient array").
#[derive(Debug, Clone)]
pub struct RecipientResult {
    pub recipient: String,
    pub code: u16,
    pub message: String,
}

/// What `on_data` decided once the body stream has been fully consumed.
#[derive(Debug, Clone)]
pub enum DataOutcome {
    Accepted { message: Option<String> },
    PerRecipient(Vec<RecipientResult>),
    Rejected(Reject),
}

/// What `on_auth` decided for a completed SASL exchange.
pub enum AuthResult {
    Accept {
        user: AuthenticatedUser,
        message: Option<String>,
    },
    Reject(Reject),
    /// XOAUTH2-only: the client's bearer token was rejected with structured
    /// detail; echo it back as a further base64 JSON challenge and then
    /// fail regardless of what the client sends next (spec §4.3 XOAUTH2).
    XOAuth2Challenge(serde_json::Value),
}

/// A single chunk-producer, single-consumer handle to a DATA body as it is
/// unstuffed off the wire. Closed by the connection once the terminator (or
/// a dirty disconnect, surfaced as `Err(SmtpError::ConnectionClosedDuringData)`)
/// is observed.
pub struct DataStream {
    rx: mpsc::Receiver<Result<Bytes, SmtpError>>,
    byte_count: u64,
    size_exceeded: bool,
}

impl DataStream {
    pub fn new(rx: mpsc::Receiver<Result<Bytes, SmtpError>>, byte_count: u64, size_exceeded: bool) -> Self {
        DataStream {
            rx,
            byte_count,
            size_exceeded,
        }
    }

    /// Reads the next chunk, or `None` once the producer side has closed.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, SmtpError>> {
        self.rx.recv().await
    }

    /// Drains every remaining chunk and concatenates them. Convenient for
    /// handlers that want the whole message in memory. Fails with
    /// `ConnectionClosedDuringData` if the socket dropped before the
    /// terminator arrived.
    pub async fn collect(mut self) -> Result<Vec<u8>, SmtpError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    /// The total unescaped byte count of the body (spec §3: "byte count
    /// passed ... is the sum of unescaped bytes emitted").
    pub fn byte_count(&self) -> u64 {
        self.byte_count
    }

    /// Whether `byte_count` exceeded the configured maximum.
    pub fn size_exceeded(&self) -> bool {
        self.size_exceeded
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn on_connect(&self, _session: &Session) -> Result<(), Reject> {
        Ok(())
    }

    async fn on_secure(&self, _tls: &TlsCipherInfo, _session: &Session) -> Result<(), Reject> {
        Ok(())
    }

    async fn on_auth(&self, _credentials: &AuthCredentials, _session: &Session) -> AuthResult {
        AuthResult::Reject(Reject::new(535, "Error: Authentication credentials invalid"))
    }

    async fn on_mail_from(&self, _path: &ParsedPath, _session: &Session) -> Result<(), Reject> {
        Err(Reject::new(550, "Mailbox unavailable"))
    }

    async fn on_rcpt_to(&self, _path: &ParsedPath, _session: &Session) -> Result<(), Reject> {
        Err(Reject::new(550, "Mailbox unavailable"))
    }

    async fn on_data(&self, body: DataStream, _session: &Session) -> DataOutcome {
        let _ = body.collect().await;
        DataOutcome::Rejected(Reject::new(450, "Requested action not taken"))
    }

    /// Notification only; its result is ignored (spec: "onClose | session |
    /// ignored (notification only)").
    async fn on_close(&self, _session: &Session) {}
}
