//! The MAIL FROM / RCPT TO argument parser and xtext codec (spec §4.2).

use std::collections::HashMap;

/// The value of an ESMTP parameter: either a bare flag (`KEY`) or a
/// `KEY=VALUE` pair, xtext-decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Flag,
    Value(String),
}

impl ParamValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Value(v) => Some(v),
            ParamValue::Flag => None,
        }
    }
}

/// A successfully parsed `MAIL FROM:` / `RCPT TO:` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPath {
    pub address: String,
    pub args: HashMap<String, ParamValue>,
}

/// Parses a `MAIL FROM:<...>` or `RCPT TO:<...>` command line. `prefix` is
/// matched case-insensitively against the text before the first colon.
/// Returns `None` on any validation failure (spec §4.2).
pub fn parse_path(prefix: &str, line: &str) -> Option<ParsedPath> {
    let colon = line.find(':')?;
    if line[..colon].trim().to_ascii_uppercase() != prefix.to_ascii_uppercase() {
        return None;
    }

    let mut tokens = line[colon + 1..].split_whitespace();
    let bracketed = tokens.next()?;
    if bracketed.len() < 2 || !bracketed.starts_with('<') || !bracketed.ends_with('>') {
        return None;
    }
    let inner = &bracketed[1..bracketed.len() - 1];
    if inner.contains('<') || inner.contains('>') {
        return None;
    }
    let address = inner.to_string();

    let mut args = HashMap::new();
    for token in tokens {
        let key_end = token.find('=');
        let (raw_key, value) = match key_end {
            Some(pos) => (&token[..pos], Some(xtext_decode(&token[pos + 1..]))),
            None => (token, None),
        };
        let key = raw_key.to_ascii_uppercase();
        if key.is_empty() {
            continue;
        }
        args.insert(key, value.map(ParamValue::Value).unwrap_or(ParamValue::Flag));
    }

    if !address.is_empty() && !is_valid_address(&address) {
        return None;
    }

    Some(ParsedPath { address, args })
}

fn is_valid_address(address: &str) -> bool {
    if address.len() > 254 {
        return false;
    }
    let at = match address.find('@') {
        Some(pos) if pos != 0 && pos != address.len() - 1 => pos,
        _ => return false,
    };
    let local = &address[..at];
    let domain = &address[at + 1..];

    if local.len() > 64 {
        return false;
    }
    if local.starts_with('.') || local.ends_with('.') || local.contains("..") {
        return false;
    }

    if let Some(literal) = domain.strip_prefix('[').and_then(|d| d.strip_suffix(']')) {
        return if let Some(v6) = literal.strip_prefix("IPV6:") {
            is_valid_ipv6_literal(v6)
        } else {
            is_valid_ipv4_literal(literal)
        };
    }

    is_valid_domain(domain)
}

fn is_valid_ipv6_literal(s: &str) -> bool {
    !s.is_empty() && s.contains(':') && s.chars().all(|c| c.is_ascii_hexdigit() || c == ':')
}

fn is_valid_ipv4_literal(s: &str) -> bool {
    let parts: Vec<&str> = s.split('.').collect();
    parts.len() == 4 && parts.iter().all(|p| !p.is_empty() && p.parse::<u8>().is_ok())
}

fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.starts_with('.') || domain.ends_with('.') {
        return false;
    }
    if domain.contains("..") || domain.contains(".-") || domain.contains("-.") {
        return false;
    }
    domain
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || (c as u32) >= 0x80)
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Decodes xtext `+HH` hex escapes in an ESMTP parameter value.
pub fn xtext_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'+' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                out.push(hi * 16 + lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Encodes a value as xtext, escaping `+`, `=`, control bytes, and anything
/// outside printable ASCII.
pub fn xtext_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        if b == b'+' || b == b'=' || b <= 0x20 || b >= 0x7f {
            out.push_str(&format!("+{:02X}", b));
        } else {
            out.push(b as char);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_null_reverse_path() {
        let parsed = parse_path("MAIL FROM", "MAIL FROM:<>").unwrap();
        assert_eq!(parsed.address, "");
    }

    #[test]
    fn prefix_match_is_case_insensitive() {
        assert!(parse_path("mail from", "MAIL FROM:<a@b.com>").is_some());
        assert!(parse_path("MAIL FROM", "mail from:<a@b.com>").is_some());
    }

    #[test]
    fn rejects_missing_colon() {
        assert!(parse_path("MAIL FROM", "MAIL FROM <a@b.com>").is_none());
    }

    #[test]
    fn rejects_wrong_prefix() {
        assert!(parse_path("RCPT TO", "MAIL FROM:<a@b.com>").is_none());
    }

    #[test]
    fn rejects_nested_brackets() {
        assert!(parse_path("MAIL FROM", "MAIL FROM:<<a@b.com>>").is_none());
    }

    #[test]
    fn parses_esmtp_parameters() {
        let parsed = parse_path("MAIL FROM", "MAIL FROM:<a@b.com> SIZE=1024 BODY=8BITMIME").unwrap();
        assert_eq!(parsed.args.get("SIZE"), Some(&ParamValue::Value("1024".to_string())));
        assert_eq!(parsed.args.get("BODY"), Some(&ParamValue::Value("8BITMIME".to_string())));
    }

    #[test]
    fn parses_flag_parameters() {
        let parsed = parse_path("RCPT TO", "RCPT TO:<a@b.com> NOTIFY").unwrap();
        assert_eq!(parsed.args.get("NOTIFY"), Some(&ParamValue::Flag));
    }

    #[test]
    fn rejects_empty_key() {
        let parsed = parse_path("MAIL FROM", "MAIL FROM:<a@b.com> =value").unwrap();
        assert!(parsed.args.is_empty());
    }

    #[test]
    fn validates_local_part_and_domain() {
        assert!(parse_path("MAIL FROM", "MAIL FROM:<a@b.com>").is_some());
        assert!(parse_path("MAIL FROM", "MAIL FROM:<@b.com>").is_none());
        assert!(parse_path("MAIL FROM", "MAIL FROM:<a@>").is_none());
        assert!(parse_path("MAIL FROM", "MAIL FROM:<a..b@c.com>").is_none());
        assert!(parse_path("MAIL FROM", "MAIL FROM:<.a@c.com>").is_none());
        assert!(parse_path("MAIL FROM", "MAIL FROM:<a@c..com>").is_none());
        assert!(parse_path("MAIL FROM", "MAIL FROM:<a@.c.com>").is_none());
    }

    #[test]
    fn validates_address_literals() {
        assert!(parse_path("MAIL FROM", "MAIL FROM:<a@[192.168.0.1]>").is_some());
        assert!(parse_path("MAIL FROM", "MAIL FROM:<a@[256.0.0.1]>").is_none());
        assert!(parse_path("MAIL FROM", "MAIL FROM:<a@[IPV6:fe80::1]>").is_some());
        assert!(parse_path("MAIL FROM", "MAIL FROM:<a@[IPV6:zz]>").is_none());
    }

    #[test]
    fn xtext_decode_handles_escapes() {
        assert_eq!(xtext_decode("a+2Bb"), "a+b");
        assert_eq!(xtext_decode("no+escapes"), "no\x0escapes".replace('\x0e', "+"));
        assert_eq!(xtext_decode("plain"), "plain");
    }

    #[test]
    fn xtext_decode_is_left_inverse_of_encode() {
        for s in ["hello world", "a+b=c", "unicode: café", "\tcontrol\x01chars"] {
            assert_eq!(xtext_decode(&xtext_encode(s)), s);
        }
    }
}
