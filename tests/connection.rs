//! End-to-end connection behavior driven over an in-memory duplex pair,
//! standing in for a real socket (the wire parser and transport are already
//! unit-tested on their own).

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use smtp_engine::address::ParsedPath;
use smtp_engine::auth::AuthCredentials;
use smtp_engine::config::AuthMechanism;
use smtp_engine::connection::SharedTlsConfig;
use smtp_engine::resolver::NoopResolver;
use smtp_engine::server::NoopEvents;
use smtp_engine::{AuthResult, Connection, DataOutcome, DataStream, Handler, Reject, ServerConfig, Session};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::RwLock;

struct RecordingHandler {
    last_session: Mutex<Option<Session>>,
    bodies: Mutex<Vec<Vec<u8>>>,
    rejected: Mutex<u32>,
}

impl RecordingHandler {
    fn new() -> Arc<Self> {
        Arc::new(RecordingHandler {
            last_session: Mutex::new(None),
            bodies: Mutex::new(Vec::new()),
            rejected: Mutex::new(0),
        })
    }

    fn snapshot(&self) -> Session {
        self.last_session.lock().unwrap().clone().expect("no callback has run yet")
    }

    fn bodies(&self) -> Vec<Vec<u8>> {
        self.bodies.lock().unwrap().clone()
    }

    fn rejected_count(&self) -> u32 {
        *self.rejected.lock().unwrap()
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    async fn on_connect(&self, session: &Session) -> Result<(), Reject> {
        *self.last_session.lock().unwrap() = Some(session.clone());
        Ok(())
    }

    async fn on_auth(&self, credentials: &AuthCredentials, session: &Session) -> AuthResult {
        *self.last_session.lock().unwrap() = Some(session.clone());
        match credentials {
            AuthCredentials::Plain { username, password, .. } if username == "tester" && password == "secret" => AuthResult::Accept {
                user: serde_json::json!({ "username": username }),
                message: None,
            },
            _ => AuthResult::Reject(Reject::new(535, "Authentication credentials invalid")),
        }
    }

    async fn on_mail_from(&self, _path: &ParsedPath, session: &Session) -> Result<(), Reject> {
        *self.last_session.lock().unwrap() = Some(session.clone());
        Ok(())
    }

    async fn on_rcpt_to(&self, path: &ParsedPath, session: &Session) -> Result<(), Reject> {
        *self.last_session.lock().unwrap() = Some(session.clone());
        if path.address.eq_ignore_ascii_case("reject@example.com") {
            Err(Reject::new(550, "Mailbox unavailable"))
        } else {
            Ok(())
        }
    }

    async fn on_data(&self, body: DataStream, session: &Session) -> DataOutcome {
        *self.last_session.lock().unwrap() = Some(session.clone());
        match body.collect().await {
            Ok(bytes) => {
                self.bodies.lock().unwrap().push(bytes);
                DataOutcome::Accepted { message: None }
            }
            Err(_) => {
                *self.rejected.lock().unwrap() += 1;
                DataOutcome::Rejected(Reject::new(451, "message body not fully received"))
            }
        }
    }
}

fn spawn_connection(config: ServerConfig, handler: Arc<RecordingHandler>) -> DuplexStream {
    let (client, server) = duplex(64 * 1024);
    let config = Arc::new(config);
    let resolver = Arc::new(NoopResolver);
    let events = Arc::new(NoopEvents);
    let tls_config: SharedTlsConfig = Arc::new(RwLock::new(None));
    let closing = Arc::new(AtomicBool::new(false));
    let local: SocketAddr = "127.0.0.1:25".parse().unwrap();
    let remote: SocketAddr = "127.0.0.1:5555".parse().unwrap();

    let connection = Connection::new(server, config, handler, resolver, events, tls_config, closing, local, remote, None);
    tokio::spawn(connection.run());
    client
}

/// Reads from `stream` until the accumulated text contains `needle` or the
/// budget runs out, so pipelined replies that trickle in over several reads
/// don't produce a flaky test.
async fn read_until(stream: &mut DuplexStream, needle: &str) -> String {
    let mut acc = String::new();
    for _ in 0..100 {
        if acc.contains(needle) {
            return acc;
        }
        let mut buf = [0u8; 4096];
        match tokio::time::timeout(Duration::from_millis(300), stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
            Ok(Ok(n)) => acc.push_str(&String::from_utf8_lossy(&buf[..n])),
        }
    }
    acc
}

async fn write_line(stream: &mut DuplexStream, line: &str) {
    stream.write_all(line.as_bytes()).await.unwrap();
}

#[tokio::test]
async fn plain_transaction_is_accepted() {
    let handler = RecordingHandler::new();
    let mut client = spawn_connection(ServerConfig::new().with_server_name("mx.example.com"), handler.clone());

    let banner = read_until(&mut client, "220").await;
    assert!(banner.starts_with("220 "));

    write_line(&mut client, "EHLO client.example\r\n").await;
    let ehlo = read_until(&mut client, "250 ").await;
    assert!(ehlo.contains("PIPELINING"));
    assert!(ehlo.contains("8BITMIME"));

    write_line(&mut client, "MAIL FROM:<alice@example.com>\r\n").await;
    assert!(read_until(&mut client, "250").await.contains("250"));

    write_line(&mut client, "RCPT TO:<bob@example.com>\r\n").await;
    assert!(read_until(&mut client, "250").await.contains("250"));

    write_line(&mut client, "DATA\r\n").await;
    assert!(read_until(&mut client, "354").await.contains("354"));

    write_line(&mut client, "Subject: hi\r\n\r\nHello there\r\n.\r\n").await;
    let final_reply = read_until(&mut client, "250").await;
    assert!(final_reply.starts_with("250"));

    assert_eq!(handler.bodies(), vec![b"Subject: hi\r\n\r\nHello there\r\n".to_vec()]);
}

#[tokio::test]
async fn dot_stuffed_leading_dot_is_unescaped() {
    let handler = RecordingHandler::new();
    let mut client = spawn_connection(ServerConfig::new(), handler.clone());

    read_until(&mut client, "220").await;
    write_line(&mut client, "EHLO client.example\r\n").await;
    read_until(&mut client, "250 ").await;
    write_line(&mut client, "MAIL FROM:<a@b.com>\r\n").await;
    read_until(&mut client, "250").await;
    write_line(&mut client, "RCPT TO:<c@d.com>\r\n").await;
    read_until(&mut client, "250").await;
    write_line(&mut client, "DATA\r\n").await;
    read_until(&mut client, "354").await;

    write_line(&mut client, "..leading dot\r\nplain line\r\n.\r\n").await;
    read_until(&mut client, "250").await;

    assert_eq!(handler.bodies(), vec![b".leading dot\r\nplain line\r\n".to_vec()]);
}

#[tokio::test]
async fn pipelined_mail_rcpt_data_all_get_replies() {
    let handler = RecordingHandler::new();
    let mut client = spawn_connection(ServerConfig::new(), handler.clone());

    read_until(&mut client, "220").await;
    write_line(&mut client, "EHLO client.example\r\n").await;
    read_until(&mut client, "250 ").await;

    write_line(&mut client, "MAIL FROM:<a@b.com>\r\nRCPT TO:<c@d.com>\r\nDATA\r\n").await;
    let replies = read_until(&mut client, "354").await;
    assert_eq!(replies.matches("250").count(), 2, "expected MAIL and RCPT to each reply 250: {replies:?}");
    assert!(replies.contains("354"));

    write_line(&mut client, "body\r\n.\r\n").await;
    let final_reply = read_until(&mut client, "250").await;
    assert!(final_reply.starts_with("250"));
    assert_eq!(handler.bodies(), vec![b"body\r\n".to_vec()]);
}

#[tokio::test]
async fn rset_clears_envelope_so_rcpt_requires_mail_again() {
    let handler = RecordingHandler::new();
    let mut client = spawn_connection(ServerConfig::new(), handler.clone());

    read_until(&mut client, "220").await;
    write_line(&mut client, "EHLO client.example\r\n").await;
    read_until(&mut client, "250 ").await;

    write_line(&mut client, "MAIL FROM:<a@b.com>\r\n").await;
    read_until(&mut client, "250").await;

    write_line(&mut client, "RSET\r\n").await;
    assert!(read_until(&mut client, "250").await.contains("250"));

    write_line(&mut client, "RCPT TO:<c@d.com>\r\n").await;
    let reply = read_until(&mut client, "503").await;
    assert!(reply.starts_with("503"), "expected RCPT without a live MAIL to be rejected: {reply:?}");
}

#[tokio::test]
async fn auth_plain_success_adds_a_suffix_to_transmission_type() {
    let handler = RecordingHandler::new();
    let config = ServerConfig::new()
        .with_auth_methods(vec![AuthMechanism::Plain])
        .with_allow_insecure_auth(true);
    let mut client = spawn_connection(config, handler.clone());

    read_until(&mut client, "220").await;
    write_line(&mut client, "EHLO client.example\r\n").await;
    let ehlo = read_until(&mut client, "250 ").await;
    assert!(ehlo.contains("AUTH PLAIN"));

    let token = base64::engine::general_purpose::STANDARD.encode(b"\0tester\0secret");
    write_line(&mut client, &format!("AUTH PLAIN {token}\r\n")).await;
    let reply = read_until(&mut client, "235").await;
    assert!(reply.starts_with("235"));

    let session = handler.snapshot();
    assert!(session.transmission_type.ends_with('A'), "got {:?}", session.transmission_type);
    assert!(session.transmission_type.starts_with('E'), "EHLO should add the E prefix: {:?}", session.transmission_type);
}

#[tokio::test]
async fn split_write_data_body_is_not_truncated() {
    let handler = RecordingHandler::new();
    let mut client = spawn_connection(ServerConfig::new(), handler.clone());

    read_until(&mut client, "220").await;
    write_line(&mut client, "EHLO client.example\r\n").await;
    read_until(&mut client, "250 ").await;
    write_line(&mut client, "MAIL FROM:<a@b.com>\r\n").await;
    read_until(&mut client, "250").await;
    write_line(&mut client, "RCPT TO:<c@d.com>\r\n").await;
    read_until(&mut client, "250").await;
    write_line(&mut client, "DATA\r\n").await;
    read_until(&mut client, "354").await;

    // Write the body across two separate writes with a delay between them,
    // so the connection's read loop consumes the first half in its own
    // `feed()` call — and its own socket `read()` — before the second half
    // ever arrives.
    write_line(&mut client, "line one\r\nline ").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    write_line(&mut client, "two\r\n.\r\n").await;

    let final_reply = read_until(&mut client, "250").await;
    assert!(final_reply.starts_with("250"));
    assert_eq!(handler.bodies(), vec![b"line one\r\nline two\r\n".to_vec()]);
}

#[tokio::test]
async fn dirty_disconnect_during_data_rejects_via_the_body_stream() {
    let handler = RecordingHandler::new();
    let mut client = spawn_connection(ServerConfig::new(), handler.clone());

    read_until(&mut client, "220").await;
    write_line(&mut client, "EHLO client.example\r\n").await;
    read_until(&mut client, "250 ").await;
    write_line(&mut client, "MAIL FROM:<a@b.com>\r\n").await;
    read_until(&mut client, "250").await;
    write_line(&mut client, "RCPT TO:<c@d.com>\r\n").await;
    read_until(&mut client, "250").await;
    write_line(&mut client, "DATA\r\n").await;
    read_until(&mut client, "354").await;

    write_line(&mut client, "an unterminated body").await;
    drop(client);

    for _ in 0..50 {
        if handler.rejected_count() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(handler.rejected_count(), 1, "on_data should run once with a connection-closed error");
    assert!(handler.bodies().is_empty());
}

#[tokio::test]
async fn mail_is_blocked_with_530_until_auth_succeeds_when_required() {
    let handler = RecordingHandler::new();
    let config = ServerConfig::new()
        .with_auth_methods(vec![AuthMechanism::Plain])
        .with_auth_optional(false)
        .with_allow_insecure_auth(true);
    let mut client = spawn_connection(config, handler.clone());

    read_until(&mut client, "220").await;
    write_line(&mut client, "EHLO client.example\r\n").await;
    read_until(&mut client, "250 ").await;

    write_line(&mut client, "MAIL FROM:<a@b.com>\r\n").await;
    let reply = read_until(&mut client, "530").await;
    assert!(reply.starts_with("530"), "expected auth-required rejection: {reply:?}");
}
