//! Crate-wide error taxonomy (see spec §7: client protocol errors surface as
//! replies and never propagate as Rust errors; only transport and embedding
//! rejections are represented here).

use std::fmt;

use thiserror::Error;

/// A rejection returned by an embedding [`Handler`](crate::handler::Handler)
/// callback. Carries the SMTP reply the connection state machine sends back
/// to the client instead of the phase's default success reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reject {
    pub code: u16,
    pub enhanced: Option<String>,
    pub message: String,
}

impl Reject {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Reject {
            code,
            enhanced: None,
            message: message.into(),
        }
    }

    pub fn with_enhanced(code: u16, enhanced: impl Into<String>, message: impl Into<String>) -> Self {
        Reject {
            code,
            enhanced: Some(enhanced.into()),
            message: message.into(),
        }
    }
}

impl fmt::Display for Reject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

impl std::error::Error for Reject {}

/// Errors internal to the engine itself: transport failures and conditions
/// that are not an embedding callback's rejection.
#[derive(Debug, Error)]
pub enum SmtpError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("connection closed before the DATA terminator arrived")]
    ConnectionClosedDuringData,

    #[error(transparent)]
    Rejected(#[from] Reject),
}

pub type Result<T> = std::result::Result<T, SmtpError>;
