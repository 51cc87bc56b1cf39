//! The connection context (spec §3 "Connection context" + §4.4
//! initialization): the pure state half of a connection, independent of the
//! socket it rides on.

use std::net::IpAddr;

use crate::auth::AuthState;
use crate::session::Session;

/// Per-connection bookkeeping that is not part of the `Session` object
/// handed to callbacks, but governs how `process_line` behaves.
pub struct ConnectionContext {
    pub session: Session,
    pub ready: bool,
    pub upgrading: bool,
    pub authenticated: bool,
    pub lmtp: bool,
    /// Whether the supervisor's `connect` event has fired for this
    /// connection yet (spec §4.4 MAIL: "emit connect event if still
    /// pending" — a defensive re-check on top of the normal emission during
    /// initialization).
    pub connect_emitted: bool,
    /// The "exactly one pending continuation" slot for multi-step AUTH
    /// (spec §9 "Callback-with-continuation for AUTH").
    pub next_auth: Option<AuthState>,
    pub unknown_count: u32,
    pub unauth_count: u32,
    /// `HELO`/`EHLO`/`LHLO`, once seen.
    pub opening_command: Option<String>,
    /// The client-declared hostname from the HELO/EHLO/LHLO argument,
    /// lowercased.
    pub host_name_appears_as: Option<String>,
    /// The address XCLIENT overrode, so it can be attributed back if needed.
    pub xclient_default_addr: Option<IpAddr>,
}

impl ConnectionContext {
    pub fn new(session: Session, lmtp: bool) -> Self {
        ConnectionContext {
            session,
            ready: false,
            upgrading: false,
            authenticated: false,
            lmtp,
            connect_emitted: false,
            next_auth: None,
            unknown_count: 0,
            unauth_count: 0,
            opening_command: None,
            host_name_appears_as: None,
            xclient_default_addr: None,
        }
    }

    /// Clears transaction state after STARTTLS (spec: "no prior
    /// `hostNameAppearsAs`, `openingCommand`, authenticated user, or
    /// envelope data persists").
    pub fn reset_after_starttls(&mut self) {
        self.opening_command = None;
        self.host_name_appears_as = None;
        self.authenticated = false;
        self.session.user = None;
        self.session.envelope.reset();
        self.unknown_count = 0;
        self.unauth_count = 0;
    }

    pub fn has_opening_command(&self) -> bool {
        self.opening_command.is_some()
    }
}
