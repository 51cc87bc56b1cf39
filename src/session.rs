//! The `Session` object handed to embedding callbacks, and the envelope it
//! carries (spec §3 "Connection context" → Session / Envelope).

use std::net::IpAddr;

/// Opaque, embedder-defined identity attached to a session after a
/// successful AUTH (spec: "authenticated user opaque value").
pub type AuthenticatedUser = serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyType {
    SevenBit,
    EightBitMime,
}

impl Default for BodyType {
    fn default() -> Self {
        BodyType::SevenBit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsnRet {
    Full,
    Hdrs,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DsnEnvelope {
    pub ret: Option<DsnRet>,
    pub envid: Option<String>,
}

/// The triple negotiated by MAIL/RCPT/DATA: sender, recipients, and the
/// per-message parameters those commands carried.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    /// `None` until MAIL FROM is accepted. `Some(String::new())` is the null
    /// reverse-path (`MAIL FROM:<>`).
    pub sender: Option<String>,
    pub recipients: Vec<String>,
    pub body_type: BodyType,
    pub smtp_utf8: bool,
    pub require_tls: bool,
    pub dsn: Option<DsnEnvelope>,
}

impl Envelope {
    pub fn reset(&mut self) {
        *self = Envelope::default();
    }

    pub fn has_sender(&self) -> bool {
        self.sender.is_some()
    }

    /// Appends a recipient, overwriting (not duplicating) any existing entry
    /// that compares equal under ASCII case-insensitivity (spec §4.4 RCPT).
    pub fn add_recipient(&mut self, address: String) {
        if let Some(existing) = self
            .recipients
            .iter_mut()
            .find(|r| r.eq_ignore_ascii_case(&address))
        {
            *existing = address;
        } else {
            self.recipients.push(address);
        }
    }
}

#[derive(Debug, Clone)]
pub struct TlsCipherInfo {
    pub protocol_version: String,
    pub cipher_suite: String,
}

/// Computes the five-position transmission-type identifier
/// `(E)(L?)SMTP(S?)(A?)` (spec GLOSSARY).
pub fn transmission_type(opened_with_ehlo: bool, lmtp: bool, secure: bool, authenticated: bool) -> String {
    let mut s = String::with_capacity(8);
    if opened_with_ehlo {
        s.push('E');
    }
    if lmtp {
        s.push('L');
    }
    s.push_str("SMTP");
    if secure {
        s.push('S');
    }
    if authenticated {
        s.push('A');
    }
    s
}

/// The session object visible to embedding callbacks (spec §3 "Session
/// object"). Cloned cheaply per callback invocation; the connection's
/// authoritative state lives on `ConnectionContext`.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub secure: bool,
    pub server_name: String,
    pub local_address: IpAddr,
    pub local_port: u16,
    pub remote_address: IpAddr,
    pub remote_port: u16,
    /// Reverse-resolved client hostname, or the bracketed IP literal
    /// fallback (`[ip]`).
    pub client_hostname: String,
    pub transmission_type: String,
    pub tls_cipher: Option<TlsCipherInfo>,
    pub user: Option<AuthenticatedUser>,
    pub transaction: u64,
    pub envelope: Envelope,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transmission_type_strings() {
        assert_eq!(transmission_type(false, false, false, false), "SMTP");
        assert_eq!(transmission_type(true, false, false, false), "ESMTP");
        assert_eq!(transmission_type(true, true, false, false), "ELSMTP");
        assert_eq!(transmission_type(true, false, true, true), "ESMTPSA");
        assert_eq!(transmission_type(false, true, false, false), "LSMTP");
    }

    #[test]
    fn recipients_dedup_case_insensitively_and_overwrite() {
        let mut env = Envelope::default();
        env.add_recipient("User@Example.com".to_string());
        env.add_recipient("other@example.com".to_string());
        env.add_recipient("user@EXAMPLE.com".to_string());
        assert_eq!(env.recipients, vec!["user@EXAMPLE.com", "other@example.com"]);
    }
}
