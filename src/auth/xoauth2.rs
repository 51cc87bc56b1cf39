//! AUTH XOAUTH2 (Google/Microsoft extension, never formally RFC'd).

use super::{b64_decode, b64_encode, AuthCredentials, AuthState, AuthStep};

pub fn start(initial_response: Option<&str>) -> AuthStep {
    match initial_response {
        Some(token) => continue_with(token),
        None => AuthStep::Challenge(String::new(), AuthState::XOAuth2),
    }
}

pub fn continue_with(line: &str) -> AuthStep {
    let Some(decoded) = b64_decode(line) else {
        return AuthStep::Abort(501, "Invalid base64 payload".to_string());
    };
    let text = String::from_utf8_lossy(&decoded);

    let mut user = None;
    let mut token = None;
    for field in text.split('\x01') {
        if let Some(rest) = field.strip_prefix("user=") {
            user = Some(rest.to_string());
        } else if let Some(rest) = field.strip_prefix("auth=Bearer ") {
            token = Some(rest.to_string());
        }
    }

    match (user, token) {
        (Some(user), Some(token)) => AuthStep::Done(Box::new(AuthCredentials::XOAuth2 { user, token })),
        _ => AuthStep::Abort(535, "Malformed XOAUTH2 response".to_string()),
    }
}

/// Sends the embedding's failure-detail JSON as a `334` challenge and
/// installs the one-shot abort handler that swallows the client's
/// `\x01*\x01` continuation.
pub fn challenge_with_failure_detail(detail_json: &str) -> AuthStep {
    AuthStep::Challenge(b64_encode(detail_json), AuthState::XOAuth2Aborting)
}

pub fn aborting_reply() -> AuthStep {
    AuthStep::Abort(535, "Error: Authentication credentials invalid".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_xoauth2(user: &str, token: &str) -> String {
        b64_encode(format!("user={user}\x01auth=Bearer {token}\x01\x01"))
    }

    #[test]
    fn parses_user_and_bearer_token() {
        let token = encode_xoauth2("alice@example.com", "ya29.abc");
        match start(Some(&token)) {
            AuthStep::Done(creds) => match *creds {
                AuthCredentials::XOAuth2 { user, token } => {
                    assert_eq!(user, "alice@example.com");
                    assert_eq!(token, "ya29.abc");
                }
                _ => panic!("wrong variant"),
            },
            _ => panic!("expected completion"),
        }
    }

    #[test]
    fn no_initial_response_sends_empty_challenge() {
        match start(None) {
            AuthStep::Challenge(c, AuthState::XOAuth2) => assert_eq!(c, ""),
            _ => panic!("expected a challenge"),
        }
    }

    #[test]
    fn missing_fields_fail_with_535() {
        let token = b64_encode("garbage");
        assert!(matches!(continue_with(&token), AuthStep::Abort(535, _)));
    }

    #[test]
    fn abort_sequence_always_replies_535() {
        match aborting_reply() {
            AuthStep::Abort(code, _) => assert_eq!(code, 535),
            _ => panic!("expected abort"),
        }
    }
}
