//! SASL mechanisms offered through AUTH (RFC 4954).

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chrono::Utc;
use rand::rngs::OsRng;
use rand::Rng;

use crate::session::Session;

const ERR_DECODE: &str = "501 5.5.2 Syntax error (unable to decode)";
const ERR_PARSE: &str = "501 5.5.2 Syntax error (unable to parse)";
const ERR_CANCELLED: &str = "501 5.7.0 Authentication cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Mechanism {
    Login,
    Plain,
    CramMd5,
}

impl Mechanism {
    pub const ALL: [Mechanism; 3] = [Mechanism::Login, Mechanism::Plain, Mechanism::CramMd5];

    pub fn as_str(self) -> &'static str {
        match self {
            Mechanism::Login => "LOGIN",
            Mechanism::Plain => "PLAIN",
            Mechanism::CramMd5 => "CRAM-MD5",
        }
    }

    /// RFC 4954 only allows the plaintext mechanisms over TLS. Explicit
    /// overrides replace that default either way.
    pub fn is_allowed(self, tls: bool, overrides: &HashMap<Mechanism, bool>) -> bool {
        if let Some(allowed) = overrides.get(&self) {
            return *allowed;
        }
        match self {
            Mechanism::Login | Mechanism::Plain => tls,
            Mechanism::CramMd5 => true,
        }
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mechanism {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "LOGIN" => Ok(Mechanism::Login),
            "PLAIN" => Ok(Mechanism::Plain),
            "CRAM-MD5" => Ok(Mechanism::CramMd5),
            other => Err(format!("unsupported mechanism {}", other)),
        }
    }
}

/// Mechanisms currently offered, in EHLO order.
pub fn allowed_mechanisms(tls: bool, overrides: &HashMap<Mechanism, bool>) -> Vec<Mechanism> {
    Mechanism::ALL
        .into_iter()
        .filter(|mech| mech.is_allowed(tls, overrides))
        .collect()
}

/// Why an exchange ended without a verdict from the authenticator.
#[derive(Debug)]
pub(crate) enum AuthAbort {
    /// Protocol error, answered with this reply.
    Reply(&'static str),
    Io(io::Error),
}

impl From<io::Error> for AuthAbort {
    fn from(err: io::Error) -> Self {
        AuthAbort::Io(err)
    }
}

fn decode(input: &str) -> Result<Vec<u8>, AuthAbort> {
    B64.decode(input).map_err(|_| AuthAbort::Reply(ERR_DECODE))
}

impl Session {
    pub(crate) async fn auth_plain(&mut self, initial: &str) -> Result<bool, AuthAbort> {
        let response = if initial.is_empty() {
            self.reply("334 ").await?;
            self.read_line().await?
        } else {
            initial.to_string()
        };

        let payload = decode(&response)?;
        let fields: Vec<&[u8]> = payload.split(|b| *b == 0).collect();
        if fields.len() != 3 {
            return Err(AuthAbort::Reply(ERR_PARSE));
        }

        Ok(self.check_credentials(Mechanism::Plain, fields[1], fields[2], None))
    }

    pub(crate) async fn auth_login(&mut self, initial: &str) -> Result<bool, AuthAbort> {
        let username = if initial.is_empty() {
            self.reply(&format!("334 {}", B64.encode("Username:"))).await?;
            let line = self.read_line().await?;
            decode(&line)?
        } else {
            decode(initial)?
        };

        self.reply(&format!("334 {}", B64.encode("Password:"))).await?;
        let line = self.read_line().await?;
        let password = decode(&line)?;

        Ok(self.check_credentials(Mechanism::Login, &username, &password, None))
    }

    pub(crate) async fn auth_cram_md5(&mut self) -> Result<bool, AuthAbort> {
        let challenge = format!(
            "<{}.{}@{}>",
            OsRng.gen_range(100_000_000u32..1_000_000_000),
            Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            self.hostname()
        );
        self.reply(&format!("334 {}", B64.encode(&challenge))).await?;

        let line = self.read_line().await?;
        if line == "*" {
            return Err(AuthAbort::Reply(ERR_CANCELLED));
        }

        let decoded = decode(&line)?;
        let text = String::from_utf8_lossy(&decoded);
        let fields: Vec<&str> = text.split(' ').collect();
        if fields.len() < 2 {
            return Err(AuthAbort::Reply(ERR_PARSE));
        }

        Ok(self.check_credentials(
            Mechanism::CramMd5,
            fields[0].as_bytes(),
            fields[1].as_bytes(),
            Some(challenge.as_bytes()),
        ))
    }

    /// Handler errors count as a failed login.
    fn check_credentials(
        &self,
        mechanism: Mechanism,
        identity: &[u8],
        secret: &[u8],
        challenge: Option<&[u8]>,
    ) -> bool {
        let Some(handler) = self.config().auth_handler.as_ref() else {
            return false;
        };
        handler
            .authenticate(self.peer(), mechanism, identity, secret, challenge)
            .unwrap_or(false)
    }
}
