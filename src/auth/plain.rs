//! AUTH PLAIN (RFC 4616).

use super::{b64_decode, b64_encode, AuthCredentials, AuthState, AuthStep};

pub fn start(initial_response: Option<&str>) -> AuthStep {
    match initial_response {
        None => AuthStep::Challenge(b64_encode(""), AuthState::Plain),
        Some(token) => continue_with(token),
    }
}

pub fn continue_with(line: &str) -> AuthStep {
    if line.trim() == "*" {
        return AuthStep::Abort(501, "Authentication cancelled".to_string());
    }
    let Some(decoded) = b64_decode(line) else {
        return AuthStep::Abort(501, "Invalid base64 payload".to_string());
    };

    let mut parts = decoded.split(|&b| b == 0);
    let authzid = parts.next().unwrap_or(b"");
    let authcid = parts.next();
    let password = parts.next();

    let (username_bytes, password_bytes) = match (authcid, password) {
        (Some(cid), Some(pw)) if !cid.is_empty() => (cid, pw),
        (Some(_), Some(pw)) => (authzid, pw),
        _ => return AuthStep::Abort(501, "Malformed AUTH PLAIN response".to_string()),
    };

    let username = String::from_utf8_lossy(username_bytes).into_owned();
    let password = String::from_utf8_lossy(password_bytes).into_owned();
    let authzid = if authzid.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(authzid).into_owned())
    };

    AuthStep::Done(Box::new(AuthCredentials::Plain {
        authzid,
        username,
        password,
    }))
}
