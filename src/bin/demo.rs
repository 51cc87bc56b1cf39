//! A minimal embedder: accepts mail from anyone, for anyone, and logs the
//! body. Shows the shape of a real integration without being one.

use std::sync::Arc;

use async_trait::async_trait;
use log::{error, info};
use smtp_engine::{AuthResult, DataOutcome, DataStream, Handler, Reject, Server, ServerConfig, Session};
use smtp_engine::address::ParsedPath;
use smtp_engine::auth::AuthCredentials;
use smtp_engine::session::TlsCipherInfo;

struct DemoHandler;

#[async_trait]
impl Handler for DemoHandler {
    async fn on_connect(&self, session: &Session) -> Result<(), Reject> {
        info!("connect {} from {}", session.id, session.remote_address);
        Ok(())
    }

    async fn on_secure(&self, tls: &TlsCipherInfo, session: &Session) -> Result<(), Reject> {
        info!("connection {} is now TLS ({})", session.id, tls.cipher_suite);
        Ok(())
    }

    async fn on_auth(&self, credentials: &AuthCredentials, _session: &Session) -> AuthResult {
        match credentials {
            AuthCredentials::Plain { username, .. } => AuthResult::Accept {
                user: serde_json::json!({ "username": username }),
                message: None,
            },
            _ => AuthResult::Reject(Reject::new(535, "Authentication credentials invalid")),
        }
    }

    async fn on_mail_from(&self, path: &ParsedPath, _session: &Session) -> Result<(), Reject> {
        info!("MAIL FROM <{}>", path.address);
        Ok(())
    }

    async fn on_rcpt_to(&self, path: &ParsedPath, _session: &Session) -> Result<(), Reject> {
        info!("RCPT TO <{}>", path.address);
        Ok(())
    }

    async fn on_data(&self, body: DataStream, session: &Session) -> DataOutcome {
        match body.collect().await {
            Ok(bytes) => {
                info!("message for connection {}: {} byte(s)", session.id, bytes.len());
                DataOutcome::Accepted { message: None }
            }
            Err(e) => {
                error!("connection {}: {e}", session.id);
                DataOutcome::Rejected(Reject::new(451, "message body not fully received"))
            }
        }
    }

    async fn on_close(&self, session: &Session) {
        info!("connection {} closed", session.id);
    }
}

#[tokio::main]
async fn main() {
    env_logger::init_from_env(env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"));

    let config = ServerConfig::new().with_server_name("demo.example.com").with_banner("smtp-engine demo");
    let server = Server::new(config, Arc::new(DemoHandler));

    info!("smtp-engine demo listening on 0.0.0.0:2525");
    if let Err(e) = server.listen(2525, None).await {
        error!("server error: {e}");
        std::process::exit(1);
    }
}
