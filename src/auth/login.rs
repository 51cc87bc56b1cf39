//! AUTH LOGIN.

use super::{b64_decode, b64_encode, AuthCredentials, AuthState, AuthStep};

const USERNAME_PROMPT: &str = "Username:";
const PASSWORD_PROMPT: &str = "Password:";

pub fn start(initial_response: Option<&str>) -> AuthStep {
    match initial_response {
        Some(token) => continue_username(token),
        None => AuthStep::Challenge(b64_encode(USERNAME_PROMPT), AuthState::LoginUsername),
    }
}

pub fn continue_username(line: &str) -> AuthStep {
    if line.trim() == "*" {
        return AuthStep::Abort(501, "Authentication cancelled".to_string());
    }
    let Some(decoded) = b64_decode(line) else {
        return AuthStep::Abort(501, "Invalid base64 payload".to_string());
    };
    let username = String::from_utf8_lossy(&decoded).into_owned();
    AuthStep::Challenge(b64_encode(PASSWORD_PROMPT), AuthState::LoginPassword { username })
}

pub fn continue_password(username: String, line: &str) -> AuthStep {
    if line.trim() == "*" {
        return AuthStep::Abort(501, "Authentication cancelled".to_string());
    }
    let Some(decoded) = b64_decode(line) else {
        return AuthStep::Abort(501, "Invalid base64 payload".to_string());
    };
    let password = String::from_utf8_lossy(&decoded).into_owned();
    AuthStep::Done(Box::new(AuthCredentials::Plain {
        authzid: None,
        username,
        password,
    }))
}
