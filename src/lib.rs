//! An embeddable ESMTP server for testing mail clients.
//!
//! The server speaks RFC 5321 with STARTTLS, SASL AUTH (PLAIN, LOGIN and
//! CRAM-MD5) and XCLIENT. Messages, recipients and credentials are handed
//! to caller-supplied callbacks, and a [`ChaosEngine`] can inject temporary
//! failures into MAIL, RCPT and AUTH with a configured probability.

pub mod auth;
pub mod chaos;
pub mod config;
pub mod error;
pub mod handler;
pub mod parser;
pub mod server;
pub mod session;
pub mod tls;

pub use auth::Mechanism;
pub use chaos::{ChaosEngine, ChaosError, Trigger, TriggerKind, Triggers};
pub use config::{ListenAddr, ServerConfig};
pub use error::SmtpdError;
pub use handler::{AuthHandler, Direction, LineLogger, MessageHandler, PeerAddr, RecipientHandler};
pub use server::{Listener, Server};
pub use tls::load_tls_config;
