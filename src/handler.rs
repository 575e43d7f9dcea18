//! Collaborator callbacks injected into the server.
//!
//! All callbacks are synchronous and run on the session task that invokes
//! them, so they must return promptly.

use std::fmt;
use std::net::SocketAddr;

use crate::auth::Mechanism;

/// Address of the connected peer, as seen by the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddr {
    Tcp(SocketAddr),
    Unix,
}

impl PeerAddr {
    /// The peer IP as text. Unix socket peers report the loopback address.
    pub fn ip(&self) -> String {
        match self {
            PeerAddr::Tcp(addr) => addr.ip().to_string(),
            PeerAddr::Unix => "127.0.0.1".to_string(),
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Tcp(addr) => write!(f, "{}", addr),
            PeerAddr::Unix => write!(f, "unix"),
        }
    }
}

/// Receives a completed message. The returned id, if any, is reported as
/// `250 2.0.0 Ok: queued as <id>`. An error whose text already looks like an
/// SMTP reply (`^[2-5]\d\d[ -]`) is sent to the client verbatim.
pub trait MessageHandler: Send + Sync {
    fn handle(
        &self,
        peer: &PeerAddr,
        from: &str,
        to: &[String],
        data: Vec<u8>,
    ) -> anyhow::Result<Option<String>>;
}

impl<F> MessageHandler for F
where
    F: Fn(&PeerAddr, &str, &[String], Vec<u8>) -> anyhow::Result<Option<String>> + Send + Sync,
{
    fn handle(
        &self,
        peer: &PeerAddr,
        from: &str,
        to: &[String],
        data: Vec<u8>,
    ) -> anyhow::Result<Option<String>> {
        self(peer, from, to, data)
    }
}

/// Decides whether a single RCPT TO address is accepted.
pub trait RecipientHandler: Send + Sync {
    fn accept(&self, peer: &PeerAddr, from: &str, to: &str) -> bool;
}

impl<F> RecipientHandler for F
where
    F: Fn(&PeerAddr, &str, &str) -> bool + Send + Sync,
{
    fn accept(&self, peer: &PeerAddr, from: &str, to: &str) -> bool {
        self(peer, from, to)
    }
}

/// Checks credentials for every SASL mechanism.
///
/// For CRAM-MD5 `secret` is the client's hex HMAC-MD5 digest and
/// `challenge` the challenge it was computed over; the server does not
/// verify the digest itself.
pub trait AuthHandler: Send + Sync {
    fn authenticate(
        &self,
        peer: &PeerAddr,
        mechanism: Mechanism,
        identity: &[u8],
        secret: &[u8],
        challenge: Option<&[u8]>,
    ) -> anyhow::Result<bool>;
}

impl<F> AuthHandler for F
where
    F: Fn(&PeerAddr, Mechanism, &[u8], &[u8], Option<&[u8]>) -> anyhow::Result<bool>
        + Send
        + Sync,
{
    fn authenticate(
        &self,
        peer: &PeerAddr,
        mechanism: Mechanism,
        identity: &[u8],
        secret: &[u8],
        challenge: Option<&[u8]>,
    ) -> anyhow::Result<bool> {
        self(peer, mechanism, identity, secret, challenge)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => write!(f, "READ"),
            Direction::Write => write!(f, "WRITE"),
        }
    }
}

/// Diagnostic sink for every protocol line.
pub trait LineLogger: Send + Sync {
    fn log_line(&self, remote_ip: &str, direction: Direction, line: &str);
}

impl<F> LineLogger for F
where
    F: Fn(&str, Direction, &str) + Send + Sync,
{
    fn log_line(&self, remote_ip: &str, direction: Direction, line: &str) {
        self(remote_ip, direction, line)
    }
}
