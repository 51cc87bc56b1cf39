//! The SASL engine (spec §4.3). Each mechanism is a small state machine
//! driven by base64-encoded challenge/response lines. Modeled as a one-shot
//! tagged continuation — [`AuthState`] is stashed on the connection between
//! inbound lines rather than as a boxed callback — since every mechanism's
//! state shape is known up front and this keeps the connection context
//! `Send` without borrowing tricks.

pub mod cram_md5;
pub mod login;
pub mod plain;
pub mod xoauth2;

use crate::config::AuthMechanism;

/// Credentials extracted from a completed SASL exchange, handed to the
/// embedding's `on_auth`.
#[derive(Debug, Clone)]
pub enum AuthCredentials {
    Plain {
        authzid: Option<String>,
        username: String,
        password: String,
    },
    CramMd5 {
        username: String,
        response: cram_md5::CramMd5Response,
    },
    XOAuth2 {
        user: String,
        token: String,
    },
}

/// Mid-exchange state retained on the connection between inbound lines.
#[derive(Debug, Clone)]
pub enum AuthState {
    Plain,
    LoginUsername,
    LoginPassword { username: String },
    CramMd5 { challenge: String },
    XOAuth2,
    XOAuth2Aborting,
}

/// The result of feeding one line (or the initial argument) to a mechanism.
pub enum AuthStep {
    /// Send this base64 payload as a `334` challenge and await the next line.
    Challenge(String, AuthState),
    /// The exchange produced credentials ready for `on_auth`.
    Done(Box<AuthCredentials>),
    /// Abort the exchange with this reply code and message; `on_auth` is not called.
    Abort(u16, String),
}

pub(crate) fn b64_decode(input: &str) -> Option<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(input.trim()).ok()
}

pub(crate) fn b64_encode(input: impl AsRef<[u8]>) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(input)
}

/// Starts a SASL exchange for `mechanism`. `initial_response` is the token
/// (if any) that followed `AUTH <mechanism>` on the command line.
pub fn start(mechanism: AuthMechanism, initial_response: Option<&str>, server_name: &str) -> AuthStep {
    match mechanism {
        AuthMechanism::Plain => plain::start(initial_response),
        AuthMechanism::Login => login::start(initial_response),
        AuthMechanism::CramMd5 => cram_md5::start(server_name),
        AuthMechanism::XOAuth2 => xoauth2::start(initial_response),
    }
}

/// Feeds the next inbound line to a mechanism already mid-exchange.
pub fn continue_with(state: AuthState, line: &str) -> AuthStep {
    match state {
        AuthState::Plain => plain::continue_with(line),
        AuthState::LoginUsername => login::continue_username(line),
        AuthState::LoginPassword { username } => login::continue_password(username, line),
        AuthState::CramMd5 { challenge } => cram_md5::continue_with(challenge, line),
        AuthState::XOAuth2 => xoauth2::continue_with(line),
        AuthState::XOAuth2Aborting => xoauth2::aborting_reply(),
    }
}
