//! SMTP reply/status-code composition, including RFC 3463 enhanced status
//! codes (spec §4.4 "Reply building").

/// A contextual tag a handler or command path can attach to a reply to
/// override the table lookup with a specific enhanced status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyContext {
    MailFromOk,
    RcptToOk,
    DataOk,
    AuthSuccess,
    AuthRequired,
    AuthInvalidCredentials,
    TlsRequired,
}

impl ReplyContext {
    fn enhanced(self) -> &'static str {
        match self {
            ReplyContext::MailFromOk => "2.1.0",
            ReplyContext::RcptToOk => "2.1.5",
            ReplyContext::DataOk => "2.6.0",
            ReplyContext::AuthSuccess => "2.7.0",
            ReplyContext::AuthRequired => "5.7.0",
            ReplyContext::AuthInvalidCredentials => "5.7.8",
            ReplyContext::TlsRequired => "5.7.0",
        }
    }
}

/// RFC 3463 table lookup by exact numeric reply code.
fn enhanced_from_code_table(code: u16) -> Option<&'static str> {
    match code {
        211 => Some("2.0.0"),
        214 => Some("2.0.0"),
        220 => Some("2.0.0"),
        221 => Some("2.0.0"),
        235 => Some("2.7.0"),
        250 => Some("2.0.0"),
        251 => Some("2.1.5"),
        252 => Some("2.5.0"),
        354 => Some("2.0.0"),
        421 => Some("4.4.2"),
        450 => Some("4.2.0"),
        451 => Some("4.3.0"),
        452 => Some("4.5.3"),
        454 => Some("4.7.0"),
        500 => Some("5.5.2"),
        501 => Some("5.5.4"),
        502 => Some("5.5.1"),
        503 => Some("5.5.1"),
        504 => Some("5.5.4"),
        521 => Some("5.0.0"),
        530 => Some("5.7.0"),
        535 => Some("5.7.8"),
        550 => Some("5.1.1"),
        551 => Some("5.1.6"),
        552 => Some("5.2.2"),
        553 => Some("5.1.3"),
        554 => Some("5.0.0"),
        _ => None,
    }
}

fn enhanced_fallback(code: u16) -> &'static str {
    match code / 100 {
        2 => "2.0.0",
        4 => "4.0.0",
        5 => "5.0.0",
        _ => "5.0.0",
    }
}

/// Resolves the enhanced status code string for `code`, honoring an
/// explicit `context` override before falling back to the table and then
/// the first-digit default.
pub fn resolve_enhanced(code: u16, context: Option<ReplyContext>) -> String {
    if let Some(ctx) = context {
        return ctx.enhanced().to_string();
    }
    enhanced_from_code_table(code)
        .map(|s| s.to_string())
        .unwrap_or_else(|| enhanced_fallback(code).to_string())
}

/// Whether a command name belongs to the "EHLO family" that suppresses
/// enhanced status codes on its own multi-line capability reply.
fn is_ehlo_family(command: Option<&str>) -> bool {
    matches!(command.map(|c| c.to_ascii_uppercase()).as_deref(), Some("EHLO") | Some("HELO") | Some("LHLO"))
}

/// Formats a (possibly multi-line) SMTP reply. `lines` must be non-empty;
/// the enhanced status code (if not suppressed) is prefixed only to the
/// first line, matching how real servers and this engine's own EHLO banner
/// behave — the remaining capability lines are plain text.
pub fn format_reply(
    code: u16,
    context: Option<ReplyContext>,
    command: Option<&str>,
    hide_enhanced_status_codes: bool,
    lines: &[String],
) -> String {
    assert!(!lines.is_empty(), "a reply must have at least one line");

    let suppress = hide_enhanced_status_codes || (300..400).contains(&code) || is_ehlo_family(command);
    let enhanced = if suppress { None } else { Some(resolve_enhanced(code, context)) };

    let mut out = String::new();
    let last = lines.len() - 1;
    for (i, line) in lines.iter().enumerate() {
        let sep = if i == last { ' ' } else { '-' };
        match (&enhanced, i) {
            (Some(e), 0) => out.push_str(&format!("{code}{sep}{e} {line}\r\n")),
            _ => out.push_str(&format!("{code}{sep}{line}\r\n")),
        }
    }
    out
}

/// A single-line convenience wrapper around [`format_reply`].
pub fn simple_reply(code: u16, context: Option<ReplyContext>, command: Option<&str>, hide_enhanced_status_codes: bool, message: &str) -> String {
    format_reply(code, context, command, hide_enhanced_status_codes, std::slice::from_ref(&message.to_string()))
}

/// Whether `code` should schedule an asynchronous socket close once the
/// reply has drained (spec: "A reply with code 421 schedules...").
pub fn triggers_close(code: u16) -> bool {
    code == 421
}
