//! An embeddable SMTP/LMTP server core: wire protocol, SASL, and connection
//! state machine behind a small callback contract.
//!
//! This crate does not decide what to do with mail; it decides whether a
//! command is syntactically and procedurally valid, and hands every
//! semantic decision (accept this sender? this recipient? this message?) to
//! the embedding application through [`Handler`]. [`Server`] owns the
//! listening socket and the set of live connections; [`Connection`] drives
//! one client through RFC 5321/2033 to completion.

pub mod address;
pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
mod id;
pub mod parser;
pub mod reply;
pub mod resolver;
pub mod server;
pub mod session;

pub use config::ServerConfig;
pub use connection::Connection;
pub use error::{Reject, SmtpError};
pub use handler::{AuthResult, DataOutcome, DataStream, Handler, RecipientResult};
pub use server::{Server, ServerEvents};
pub use session::Session;
