//! Server configuration (spec §3): immutable once a [`Server`](crate::server::Server)
//! is constructed from it. TLS material is the exception — it lives on
//! `Server` itself so it can be hot-rotated (see `Server::update_secure_context`).

use std::collections::HashSet;
use std::time::Duration;

/// A SASL mechanism the server may be configured to advertise and accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMechanism {
    Plain,
    Login,
    CramMd5,
    XOAuth2,
}

impl AuthMechanism {
    /// The token as it appears in the `AUTH` EHLO capability line and in the
    /// client's `AUTH <mechanism>` command.
    pub fn as_str(self) -> &'static str {
        match self {
            AuthMechanism::Plain => "PLAIN",
            AuthMechanism::Login => "LOGIN",
            AuthMechanism::CramMd5 => "CRAM-MD5",
            AuthMechanism::XOAuth2 => "XOAUTH2",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_uppercase().as_str() {
            "PLAIN" => Some(AuthMechanism::Plain),
            "LOGIN" => Some(AuthMechanism::Login),
            "CRAM-MD5" => Some(AuthMechanism::CramMd5),
            "XOAUTH2" => Some(AuthMechanism::XOAuth2),
            _ => None,
        }
    }
}

/// Immutable, read-only-at-the-connection-level server configuration
/// (spec §3 "Server configuration").
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_name: String,
    pub banner: Option<String>,
    pub lmtp: bool,

    pub auth_methods: Vec<AuthMechanism>,
    pub auth_optional: bool,
    pub allow_insecure_auth: bool,
    pub auth_required_message: String,

    pub hide_starttls: bool,
    pub hide_size: bool,
    pub hide_pipelining: bool,
    pub hide_dsn: bool,
    pub hide_enhanced_status_codes: bool,
    pub hide_require_tls: bool,
    pub hide_eightbitmime: bool,
    pub hide_smtp_utf8: bool,

    /// Upper-cased command names the server refuses to run even if it
    /// otherwise knows them.
    pub disabled_commands: HashSet<String>,

    /// Maximum DATA body size in bytes; `0` means unlimited.
    pub size_limit: usize,

    pub max_clients: usize,
    pub socket_timeout: Duration,
    pub close_timeout: Duration,

    /// Maximum non-AUTH commands an unauthenticated client may send before
    /// the connection is dropped. `None` disables the limit.
    pub max_unauthenticated_commands: Option<usize>,

    pub trust_xclient: bool,
    pub trust_xforward: bool,

    /// Template for the first line of the HELO/EHLO reply. `{server}` and
    /// `{client}` are substituted with the server name and the
    /// reverse-resolved (or bracketed literal) client hostname.
    pub helo_greeting: String,

    pub reverse_dns_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            server_name: "localhost".to_string(),
            banner: None,
            lmtp: false,
            auth_methods: Vec::new(),
            auth_optional: true,
            allow_insecure_auth: false,
            auth_required_message: "Error: authentication required".to_string(),
            hide_starttls: false,
            hide_size: false,
            hide_pipelining: false,
            hide_dsn: false,
            hide_enhanced_status_codes: false,
            hide_require_tls: false,
            hide_eightbitmime: false,
            hide_smtp_utf8: false,
            disabled_commands: HashSet::new(),
            size_limit: 0,
            max_clients: 1000,
            socket_timeout: Duration::from_secs(60),
            close_timeout: Duration::from_secs(30),
            max_unauthenticated_commands: Some(10),
            trust_xclient: false,
            trust_xforward: false,
            helo_greeting: "{server} Nice to meet you, {client}".to_string(),
            reverse_dns_enabled: false,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    pub fn with_banner(mut self, banner: impl Into<String>) -> Self {
        self.banner = Some(banner.into());
        self
    }

    pub fn with_lmtp(mut self, lmtp: bool) -> Self {
        self.lmtp = lmtp;
        self
    }

    pub fn with_auth_methods(mut self, methods: Vec<AuthMechanism>) -> Self {
        self.auth_methods = methods;
        self
    }

    pub fn with_auth_optional(mut self, optional: bool) -> Self {
        self.auth_optional = optional;
        self
    }

    pub fn with_allow_insecure_auth(mut self, allow: bool) -> Self {
        self.allow_insecure_auth = allow;
        self
    }

    pub fn with_size_limit(mut self, bytes: usize) -> Self {
        self.size_limit = bytes;
        self
    }

    pub fn with_max_clients(mut self, max: usize) -> Self {
        self.max_clients = max;
        self
    }

    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn with_disabled_commands(mut self, commands: impl IntoIterator<Item = String>) -> Self {
        self.disabled_commands = commands.into_iter().map(|c| c.to_ascii_uppercase()).collect();
        self
    }

    pub fn with_trust_xclient(mut self, trust: bool) -> Self {
        self.trust_xclient = trust;
        self
    }

    pub fn with_trust_xforward(mut self, trust: bool) -> Self {
        self.trust_xforward = trust;
        self
    }

    pub fn with_reverse_dns_enabled(mut self, enabled: bool) -> Self {
        self.reverse_dns_enabled = enabled;
        self
    }

    /// Whether AUTH is configured at all (at least one mechanism enabled).
    pub fn auth_configured(&self) -> bool {
        !self.auth_methods.is_empty()
    }

    pub fn command_disabled(&self, command: &str) -> bool {
        self.disabled_commands.contains(&command.to_ascii_uppercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_conservative() {
        let config = ServerConfig::default();
        assert!(!config.lmtp);
        assert!(!config.auth_configured());
        assert_eq!(config.size_limit, 0);
        assert!(!config.allow_insecure_auth);
    }

    #[test]
    fn mechanism_round_trips_through_its_token() {
        for mech in [
            AuthMechanism::Plain,
            AuthMechanism::Login,
            AuthMechanism::CramMd5,
            AuthMechanism::XOAuth2,
        ] {
            assert_eq!(AuthMechanism::parse(mech.as_str()), Some(mech));
            assert_eq!(AuthMechanism::parse(&mech.as_str().to_ascii_lowercase()), Some(mech));
        }
    }

    #[test]
    fn disabled_commands_are_case_insensitive() {
        let config = ServerConfig::default().with_disabled_commands(["vrfy".to_string()]);
        assert!(config.command_disabled("VRFY"));
        assert!(config.command_disabled("vrfy"));
    }
}
