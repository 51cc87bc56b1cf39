//! `processLine` and the per-command handlers (spec §4.4).

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::address::{parse_path, ParamValue};
use crate::auth::{self, AuthStep};
use crate::config::AuthMechanism;
use crate::handler::{AuthResult, DataOutcome, DataStream};
use crate::parser::DataEnd;
use crate::reply::{self, ReplyContext};
use crate::session::{BodyType, DsnEnvelope, DsnRet};

use super::Connection;

const MAX_UNKNOWN_COMMANDS: u32 = 10;

fn looks_like_http_request(line: &str) -> bool {
    const VERBS: &[&str] = &["GET", "POST", "HEAD", "PUT", "DELETE", "OPTIONS", "CONNECT", "PATCH", "TRACE"];
    let mut parts = line.split_whitespace();
    let Some(verb) = parts.next() else { return false };
    if !VERBS.contains(&verb.to_ascii_uppercase().as_str()) {
        return false;
    }
    let Some(_path) = parts.next() else { return false };
    let Some(version) = parts.next() else { return false };
    parts.next().is_none() && version.to_ascii_uppercase().starts_with("HTTP/")
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Connection<S> {
    fn hide_enhanced(&self) -> bool {
        self.config.hide_enhanced_status_codes
    }

    /// Sends a reply and reports whether the connection should stay open:
    /// `false` if the write failed, or if `code` is one that schedules a
    /// close once the reply has drained (spec: "a reply with code 421
    /// schedules an asynchronous socket close").
    async fn reply_simple(&mut self, code: u16, context: Option<ReplyContext>, command: Option<&str>, message: &str) -> bool {
        let text = reply::simple_reply(code, context, command, self.hide_enhanced(), message);
        self.send_reply(text).await && !reply::triggers_close(code)
    }

    async fn reply_lines(&mut self, code: u16, command: Option<&str>, lines: &[String]) -> bool {
        let text = reply::format_reply(code, None, command, self.hide_enhanced(), lines);
        self.send_reply(text).await
    }

    pub(super) async fn process_line(&mut self, raw: &str) -> bool {
        if !self.ctx.ready {
            return self.reply_simple(421, None, None, "You talk too soon").await;
        }

        if looks_like_http_request(raw) {
            return self.reply_simple(421, None, None, "HTTP requests not allowed").await;
        }

        if self.ctx.upgrading {
            return true;
        }

        if let Some(state) = self.ctx.next_auth.take() {
            let step = auth::continue_with(state, raw);
            return self.handle_auth_step(step).await;
        }

        let mut words = raw.splitn(2, char::is_whitespace);
        let command = words.next().unwrap_or("").to_ascii_uppercase();
        let rest = words.next().unwrap_or("").trim_start();

        if self.shared_closing.load(std::sync::atomic::Ordering::Relaxed) {
            return self.reply_simple(421, None, None, "Server shutting down").await;
        }

        let command = if self.ctx.lmtp && command == "LHLO" {
            "EHLO".to_string()
        } else if self.ctx.lmtp && (command == "HELO" || command == "EHLO") {
            self.reply_simple(500, None, None, "Command not recognized").await;
            return true;
        } else {
            command
        };

        if !self.is_known_command(&command) || self.config.command_disabled(&command) {
            self.ctx.unknown_count += 1;
            return if self.ctx.unknown_count >= MAX_UNKNOWN_COMMANDS {
                self.reply_simple(421, None, None, "too many unrecognized commands").await
            } else {
                self.reply_simple(500, None, None, "command not recognized").await
            };
        }

        if !self.ctx.authenticated && self.config.auth_configured() && !self.config.auth_optional && command != "AUTH" {
            self.ctx.unauth_count += 1;
            if let Some(max) = self.config.max_unauthenticated_commands {
                if self.ctx.unauth_count as usize >= max {
                    return self.reply_simple(421, None, None, "too many unauthenticated commands").await;
                }
            }
        }

        if !self.ctx.has_opening_command() && matches!(command.as_str(), "MAIL" | "RCPT" | "DATA" | "AUTH") {
            let greeting = if self.ctx.lmtp { "LHLO" } else { "HELO/EHLO" };
            return self.reply_simple(503, None, None, &format!("Error: send {greeting} first")).await;
        }

        if self.config.auth_configured() && !self.config.auth_optional && !self.ctx.authenticated && matches!(command.as_str(), "MAIL" | "RCPT" | "DATA") {
            let message = self.config.auth_required_message.clone();
            return self.reply_simple(530, Some(ReplyContext::AuthRequired), None, &message).await;
        }

        self.dispatch(&command, rest).await
    }

    fn is_known_command(&self, command: &str) -> bool {
        matches!(
            command,
            "EHLO" | "HELO" | "STARTTLS" | "AUTH" | "MAIL" | "RCPT" | "DATA" | "RSET" | "NOOP" | "QUIT" | "VRFY" | "HELP" | "XCLIENT" | "XFORWARD" | "WIZ" | "SHELL" | "KILL"
        )
    }

    async fn dispatch(&mut self, command: &str, rest: &str) -> bool {
        match command {
            "EHLO" => self.cmd_ehlo(rest).await,
            "HELO" => self.cmd_helo(rest).await,
            "STARTTLS" => self.cmd_starttls().await,
            "AUTH" => self.cmd_auth(rest).await,
            "MAIL" => self.cmd_mail(rest).await,
            "RCPT" => self.cmd_rcpt(rest).await,
            "DATA" => self.cmd_data().await,
            "RSET" => {
                self.ctx.session.envelope.reset();
                self.reply_simple(250, None, None, "Flushed").await
            }
            "NOOP" => self.reply_simple(250, None, None, "OK").await,
            "QUIT" => {
                self.reply_simple(221, None, None, "Bye").await;
                false
            }
            "VRFY" => self.reply_simple(252, None, None, "Try to send something. No promises though").await,
            "HELP" => self.reply_simple(214, None, None, "See RFC 5321").await,
            "XCLIENT" => self.cmd_xclient(rest).await,
            "XFORWARD" => self.cmd_xforward(rest).await,
            "WIZ" | "SHELL" | "KILL" => self.reply_simple(500, None, None, "Command not recognized").await,
            _ => self.reply_simple(500, None, None, "command not recognized").await,
        }
    }

    fn helo_greeting(&self) -> String {
        self.config
            .helo_greeting
            .replace("{server}", &self.config.server_name)
            .replace("{client}", &self.ctx.session.client_hostname)
    }

    async fn cmd_ehlo(&mut self, rest: &str) -> bool {
        let arg = rest.trim();
        if arg.is_empty() || arg.split_whitespace().count() != 1 {
            return self.reply_simple(501, None, Some("EHLO"), "Syntax: EHLO hostname").await;
        }
        self.ctx.host_name_appears_as = Some(arg.to_ascii_lowercase());
        self.ctx.opening_command = Some("EHLO".to_string());
        self.ctx.session.envelope.reset();
        self.ctx.session.transmission_type = self.current_transmission_type();

        let mut lines = vec![self.helo_greeting()];
        if !self.config.hide_pipelining {
            lines.push("PIPELINING".to_string());
        }
        if !self.config.hide_eightbitmime {
            lines.push("8BITMIME".to_string());
        }
        if !self.config.hide_smtp_utf8 {
            lines.push("SMTPUTF8".to_string());
        }
        if !self.config.hide_enhanced_status_codes {
            lines.push("ENHANCEDSTATUSCODES".to_string());
        }
        if !self.config.hide_dsn {
            lines.push("DSN".to_string());
        }
        if self.config.auth_configured() && !self.ctx.authenticated {
            let methods = self.config.auth_methods.iter().map(|m| m.as_str()).collect::<Vec<_>>().join(" ");
            lines.push(format!("AUTH {methods}"));
        }
        if !self.config.hide_starttls && !self.ctx.session.secure {
            lines.push("STARTTLS".to_string());
        }
        if !self.config.hide_require_tls && self.ctx.session.secure {
            lines.push("REQUIRETLS".to_string());
        }
        if !self.config.hide_size {
            if self.config.size_limit > 0 {
                lines.push(format!("SIZE {}", self.config.size_limit));
            } else {
                lines.push("SIZE".to_string());
            }
        }
        if self.config.trust_xclient {
            lines.push("XCLIENT NAME ADDR PORT PROTO HELO LOGIN".to_string());
        }
        if self.config.trust_xforward {
            lines.push("XFORWARD NAME ADDR PORT PROTO HELO IDENT SOURCE".to_string());
        }

        self.reply_lines(250, Some("EHLO"), &lines).await
    }

    async fn cmd_helo(&mut self, rest: &str) -> bool {
        let arg = rest.trim();
        if arg.is_empty() || arg.split_whitespace().count() != 1 {
            return self.reply_simple(501, None, Some("HELO"), "Syntax: HELO hostname").await;
        }
        self.ctx.host_name_appears_as = Some(arg.to_ascii_lowercase());
        self.ctx.opening_command = Some("HELO".to_string());
        self.ctx.session.envelope.reset();
        self.ctx.session.transmission_type = self.current_transmission_type();
        let greeting = self.helo_greeting();
        self.reply_simple(250, None, Some("HELO"), &greeting).await
    }

    async fn cmd_starttls(&mut self) -> bool {
        if self.ctx.session.secure {
            return self.reply_simple(503, None, None, "Already in TLS mode").await;
        }
        if !self.reply_simple(220, None, None, "Ready to start TLS").await {
            return false;
        }
        self.ctx.upgrading = true;
        let ok = self.upgrade_to_tls().await;
        self.ctx.upgrading = false;
        ok
    }

    async fn cmd_auth(&mut self, rest: &str) -> bool {
        let mut parts = rest.split_whitespace();
        let Some(method_token) = parts.next() else {
            return self.reply_simple(504, None, None, "Authentication mechanism not supported").await;
        };
        let initial = parts.next();

        let Some(mechanism) = AuthMechanism::parse(method_token) else {
            return self.reply_simple(504, None, None, "Authentication mechanism not supported").await;
        };
        if !self.config.auth_methods.contains(&mechanism) {
            return self.reply_simple(504, None, None, "Authentication mechanism not supported").await;
        }
        if !self.ctx.session.secure && !self.config.allow_insecure_auth {
            return self.reply_simple(538, None, None, "Encryption required for requested authentication mechanism").await;
        }
        if self.ctx.authenticated {
            return self.reply_simple(503, None, None, "Already authenticated").await;
        }

        let step = auth::start(mechanism, initial, &self.config.server_name);
        self.handle_auth_step(step).await
    }

    async fn handle_auth_step(&mut self, step: AuthStep) -> bool {
        match step {
            AuthStep::Challenge(payload, state) => {
                self.ctx.next_auth = Some(state);
                self.reply_simple(334, None, None, &payload).await
            }
            AuthStep::Abort(code, message) => {
                self.ctx.next_auth = None;
                self.reply_simple(code, None, None, &message).await
            }
            AuthStep::Done(credentials) => {
                self.ctx.next_auth = None;
                let result = self.handler.on_auth(&credentials, &self.ctx.session).await;
                match result {
                    AuthResult::Accept { user, message } => {
                        self.ctx.authenticated = true;
                        self.ctx.session.user = Some(user);
                        self.ctx.session.transmission_type = self.current_transmission_type();
                        let message = message.unwrap_or_else(|| "Authentication successful".to_string());
                        self.reply_simple(235, Some(ReplyContext::AuthSuccess), None, &message).await
                    }
                    AuthResult::Reject(reject) => self.reply_simple(reject.code, None, None, &reject.message).await,
                    AuthResult::XOAuth2Challenge(detail) => {
                        let json = serde_json::to_string(&detail).unwrap_or_default();
                        match auth::xoauth2::challenge_with_failure_detail(&json) {
                            AuthStep::Challenge(payload, state) => {
                                self.ctx.next_auth = Some(state);
                                self.reply_simple(334, None, None, &payload).await
                            }
                            _ => unreachable!("challenge_with_failure_detail always returns a Challenge"),
                        }
                    }
                }
            }
        }
    }

    async fn cmd_mail(&mut self, rest: &str) -> bool {
        self.emit_connect_if_pending();
        let Some(parsed) = parse_path("FROM", rest) else {
            return self.reply_simple(501, None, None, "Bad sender address syntax").await;
        };
        if self.ctx.session.envelope.has_sender() {
            return self.reply_simple(503, None, None, "nested MAIL command").await;
        }

        if let Some(ParamValue::Value(size)) = parsed.args.get("SIZE") {
            if let Ok(size) = size.parse::<usize>() {
                if self.config.size_limit > 0 && size > self.config.size_limit {
                    return self.reply_simple(552, None, None, "Message size exceeds fixed limit").await;
                }
            }
        }

        let body_type = match parsed.args.get("BODY") {
            None => BodyType::SevenBit,
            Some(ParamValue::Value(v)) if v.eq_ignore_ascii_case("7BIT") => BodyType::SevenBit,
            Some(ParamValue::Value(v)) if v.eq_ignore_ascii_case("8BITMIME") => BodyType::EightBitMime,
            _ => return self.reply_simple(501, None, None, "Invalid BODY parameter").await,
        };

        if let Some(ParamValue::Value(_)) = parsed.args.get("REQUIRETLS") {
            return self.reply_simple(501, None, None, "REQUIRETLS takes no value").await;
        }
        let require_tls = parsed.args.contains_key("REQUIRETLS");

        let smtp_utf8 = parsed.args.contains_key("SMTPUTF8");

        let mut dsn = None;
        if !self.config.hide_dsn {
            let ret = match parsed.args.get("RET") {
                None => None,
                Some(ParamValue::Value(v)) if v.eq_ignore_ascii_case("FULL") => Some(DsnRet::Full),
                Some(ParamValue::Value(v)) if v.eq_ignore_ascii_case("HDRS") => Some(DsnRet::Hdrs),
                _ => return self.reply_simple(501, None, None, "Invalid RET parameter").await,
            };
            let envid = match parsed.args.get("ENVID") {
                Some(ParamValue::Value(v)) => Some(v.clone()),
                _ => None,
            };
            if ret.is_some() || envid.is_some() {
                dsn = Some(DsnEnvelope { ret, envid });
            }
        }

        self.ctx.session.envelope.body_type = body_type;
        self.ctx.session.envelope.smtp_utf8 = smtp_utf8;
        self.ctx.session.envelope.require_tls = require_tls;
        self.ctx.session.envelope.dsn = dsn;

        match self.handler.on_mail_from(&parsed, &self.ctx.session).await {
            Ok(()) => {
                self.ctx.session.envelope.sender = Some(parsed.address);
                self.reply_simple(250, Some(ReplyContext::MailFromOk), None, "Accepted").await
            }
            Err(reject) => self.reply_simple(reject.code, None, None, &reject.message).await,
        }
    }

    async fn cmd_rcpt(&mut self, rest: &str) -> bool {
        let Some(parsed) = parse_path("TO", rest) else {
            return self.reply_simple(501, None, None, "Bad recipient address syntax").await;
        };
        if parsed.address.is_empty() {
            return self.reply_simple(501, None, None, "Bad recipient address syntax").await;
        }
        if !self.ctx.session.envelope.has_sender() {
            return self.reply_simple(503, None, None, "need MAIL before RCPT").await;
        }

        if let Some(ParamValue::Value(notify)) = parsed.args.get("NOTIFY") {
            let values: Vec<&str> = notify.split(',').collect();
            let valid = values.iter().all(|v| matches!(v.to_ascii_uppercase().as_str(), "NEVER" | "SUCCESS" | "FAILURE" | "DELAY"));
            let has_never = values.iter().any(|v| v.eq_ignore_ascii_case("NEVER"));
            if !valid || (has_never && values.len() > 1) {
                return self.reply_simple(501, None, None, "Bad NOTIFY parameter").await;
            }
        }

        match self.handler.on_rcpt_to(&parsed, &self.ctx.session).await {
            Ok(()) => {
                self.ctx.session.envelope.add_recipient(parsed.address);
                self.reply_simple(250, Some(ReplyContext::RcptToOk), None, "Accepted").await
            }
            Err(reject) => self.reply_simple(reject.code, None, None, &reject.message).await,
        }
    }

    async fn cmd_data(&mut self) -> bool {
        if self.ctx.session.envelope.recipients.is_empty() {
            return self.reply_simple(503, None, None, "need RCPT before DATA").await;
        }
        if !self.reply_simple(354, None, None, "End data with <CR><LF>.<CR><LF>").await {
            return false;
        }
        let max_bytes = if self.config.size_limit > 0 { Some(self.config.size_limit as u64) } else { None };
        self.data_body.clear();
        self.data_mode_carry = self.parser.start_data_mode(max_bytes);
        true
    }

    pub(super) async fn finish_data(&mut self, body: Vec<u8>, end: DataEnd) -> bool {
        let (tx, rx) = mpsc::channel(1);
        if !body.is_empty() {
            let _ = tx.send(Ok(Bytes::from(body))).await;
        }
        drop(tx);

        let stream = DataStream::new(rx, end.byte_count, end.size_exceeded);
        let outcome = self.handler.on_data(stream, &self.ctx.session).await;

        let ok = match outcome {
            DataOutcome::Accepted { message } => {
                let message = message.unwrap_or_else(|| "OK: message queued".to_string());
                self.reply_simple(250, Some(ReplyContext::DataOk), None, &message).await
            }
            DataOutcome::PerRecipient(results) => {
                let mut ok = true;
                for r in results {
                    if !self.reply_simple(r.code, None, None, &r.message).await {
                        ok = false;
                        break;
                    }
                }
                ok
            }
            DataOutcome::Rejected(reject) => self.reply_simple(reject.code, None, None, &reject.message).await,
        };

        self.ctx.session.transaction += 1;
        self.ctx.session.envelope.reset();
        self.ctx.unknown_count = 0;
        ok
    }

    async fn cmd_xclient(&mut self, rest: &str) -> bool {
        if !self.config.trust_xclient || self.ctx.session.envelope.has_sender() {
            return self.reply_simple(501, None, None, "XCLIENT not permitted").await;
        }
        self.apply_proxy_params(rest, &["NAME", "ADDR", "PORT", "PROTO", "HELO", "LOGIN"]).await;
        let banner = format!("220 {} {}\r\n", self.config.server_name, self.current_transmission_type());
        self.send_reply(banner).await
    }

    async fn cmd_xforward(&mut self, rest: &str) -> bool {
        if !self.config.trust_xforward || self.ctx.session.envelope.has_sender() {
            return self.reply_simple(501, None, None, "XFORWARD not permitted").await;
        }
        self.apply_proxy_params(rest, &["NAME", "ADDR", "PORT", "PROTO", "HELO", "IDENT", "SOURCE"]).await;
        self.reply_simple(250, None, None, "Ok").await
    }

    async fn apply_proxy_params(&mut self, rest: &str, recognized: &[&str]) {
        for token in rest.split_whitespace() {
            let Some((key, value)) = token.split_once('=') else { continue };
            let key = key.to_ascii_uppercase();
            if !recognized.contains(&key.as_str()) {
                continue;
            }
            let value = crate::address::xtext_decode(value);
            let unavailable = value.eq_ignore_ascii_case("[UNAVAILABLE]") || value.eq_ignore_ascii_case("[TEMPUNAVAIL]");

            match key.as_str() {
                "ADDR" if !unavailable => {
                    if let Ok(addr) = value.parse() {
                        self.ctx.xclient_default_addr = Some(self.ctx.session.remote_address);
                        self.ctx.session.remote_address = addr;
                    }
                }
                "NAME" if !unavailable => {
                    self.ctx.session.client_hostname = value;
                }
                "LOGIN" if !unavailable => {
                    let credentials = crate::auth::AuthCredentials::Plain {
                        authzid: None,
                        username: value,
                        password: String::new(),
                    };
                    let _ = self.handler.on_auth(&credentials, &self.ctx.session).await;
                }
                _ => {}
            }
        }
    }
}
