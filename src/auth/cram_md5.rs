//! AUTH CRAM-MD5 (RFC 2195).

use hmac::{Hmac, Mac};
use md5::Md5;
use rand::Rng;

use super::{b64_decode, b64_encode, AuthCredentials, AuthState, AuthStep};

type HmacMd5 = Hmac<Md5>;

/// The client's response half of a CRAM-MD5 exchange: a username and a
/// lowercase hex HMAC-MD5 digest the embedding validates against the
/// password it looks up for that username.
#[derive(Debug, Clone)]
pub struct CramMd5Response {
    pub challenge: String,
    pub digest_hex: String,
}

impl CramMd5Response {
    /// `HMAC-MD5(key = password, message = challenge).hex().lower() == digest_hex`.
    pub fn validate(&self, password: &str) -> bool {
        let Ok(mut mac) = HmacMd5::new_from_slice(password.as_bytes()) else {
            return false;
        };
        mac.update(self.challenge.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());
        computed.eq_ignore_ascii_case(&self.digest_hex)
    }
}

pub fn start(server_name: &str) -> AuthStep {
    let mut rng = rand::thread_rng();
    let mantissa: u32 = rng.gen_range(0..100_000_000);
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let challenge = format!("<{mantissa:08}{ts}@{server_name}>");
    AuthStep::Challenge(b64_encode(&challenge), AuthState::CramMd5 { challenge })
}

pub fn continue_with(challenge: String, line: &str) -> AuthStep {
    if line.trim() == "*" {
        return AuthStep::Abort(501, "Authentication cancelled".to_string());
    }
    let Some(decoded) = b64_decode(line) else {
        return AuthStep::Abort(501, "Invalid base64 payload".to_string());
    };
    let text = String::from_utf8_lossy(&decoded);
    let Some(space) = text.rfind(' ') else {
        return AuthStep::Abort(501, "Malformed CRAM-MD5 response".to_string());
    };
    let username = text[..space].to_string();
    let digest_hex = text[space + 1..].to_ascii_lowercase();
    if username.is_empty() || digest_hex.is_empty() {
        return AuthStep::Abort(501, "Malformed CRAM-MD5 response".to_string());
    }

    AuthStep::Done(Box::new(AuthCredentials::CramMd5 {
        username,
        response: CramMd5Response { challenge, digest_hex },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_is_wrapped_in_angle_brackets() {
        match start("mail.example.com") {
            AuthStep::Challenge(c, AuthState::CramMd5 { challenge }) => {
                assert!(challenge.starts_with('<') && challenge.ends_with('>'));
                assert!(challenge.contains("mail.example.com"));
                assert_eq!(b64_decode(&c).unwrap(), challenge.as_bytes());
            }
            _ => panic!("expected a challenge"),
        }
    }

    #[test]
    fn validates_matching_hmac() {
        let challenge = "<123456789.1234@mail.example.com>".to_string();
        let mut mac = HmacMd5::new_from_slice(b"secret").unwrap();
        mac.update(challenge.as_bytes());
        let digest_hex = hex::encode(mac.finalize().into_bytes());
        let response = CramMd5Response { challenge, digest_hex };
        assert!(response.validate("secret"));
        assert!(!response.validate("wrong"));
    }

    #[test]
    fn response_is_split_on_last_space() {
        let challenge = "<c@server>".to_string();
        let line = b64_encode("user name deadbeef");
        match continue_with(challenge, &line) {
            AuthStep::Done(creds) => match *creds {
                AuthCredentials::CramMd5 { username, response } => {
                    assert_eq!(username, "user name");
                    assert_eq!(response.digest_hex, "deadbeef");
                }
                _ => panic!("wrong variant"),
            },
            _ => panic!("expected completion"),
        }
    }

    #[test]
    fn missing_space_aborts() {
        let line = b64_encode("nouser");
        assert!(matches!(continue_with("<c@s>".to_string(), &line), AuthStep::Abort(501, _)));
    }
}
