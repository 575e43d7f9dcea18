//! Command line parsing.

use std::net::IpAddr;
use std::sync::LazyLock;

use regex::Regex;

// "MAIL FROM:<>" is how delivery status notifications are sent.
static MAIL_FROM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^FROM: ?<(|[^<>\v]+)>( |$)(.*)?").unwrap());
static RCPT_TO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^TO: ?<([^<>\v]+)>( |$)(.*)?").unwrap());
static SIZE_PARAM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:^| |,)SIZE=([^ ,]*)").unwrap());

/// One decoded command verb. Arguments stay as raw text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Helo,
    Ehlo,
    Mail,
    Rcpt,
    Data,
    Rset,
    Noop,
    Quit,
    Help,
    Vrfy,
    Expn,
    Xclient,
    StartTls,
    Auth,
    Unknown,
}

impl Command {
    pub fn from_verb(verb: &str) -> Self {
        match verb {
            "HELO" => Command::Helo,
            "EHLO" => Command::Ehlo,
            "MAIL" => Command::Mail,
            "RCPT" => Command::Rcpt,
            "DATA" => Command::Data,
            "RSET" => Command::Rset,
            "NOOP" => Command::Noop,
            "QUIT" => Command::Quit,
            "HELP" => Command::Help,
            "VRFY" => Command::Vrfy,
            "EXPN" => Command::Expn,
            "XCLIENT" => Command::Xclient,
            "STARTTLS" => Command::StartTls,
            "AUTH" => Command::Auth,
            _ => Command::Unknown,
        }
    }
}

/// Split a line into its uppercased verb and trimmed arguments.
pub fn parse_line(line: &str) -> (String, String) {
    let line = line.trim();
    match line.split_once(' ') {
        Some((verb, args)) => (verb.to_uppercase(), args.trim().to_string()),
        None => (line.to_uppercase(), String::new()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathArgs {
    pub address: String,
    /// ESMTP parameters following the path, if any were given.
    pub params: Option<String>,
}

fn parse_path(re: &Regex, args: &str) -> Option<PathArgs> {
    let caps = re.captures(args)?;
    let address = caps[1].to_string();
    let params = match caps.get(2) {
        Some(sep) if !sep.as_str().is_empty() => {
            Some(caps.get(3).map_or("", |m| m.as_str()).to_string())
        }
        _ => None,
    };
    Some(PathArgs { address, params })
}

/// Parse the arguments of `MAIL`, e.g. `FROM:<a@example.com> SIZE=1024`.
pub fn parse_mail_from(args: &str) -> Option<PathArgs> {
    parse_path(&MAIL_FROM_RE, args)
}

/// Parse the arguments of `RCPT`, e.g. `TO:<b@example.com>`.
pub fn parse_rcpt_to(args: &str) -> Option<PathArgs> {
    parse_path(&RCPT_TO_RE, args)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SizeParamError {
    /// SIZE= was present but not a number.
    Invalid,
    /// The declared size is above the configured limit.
    TooLarge { limit: u64 },
}

/// Extract a declared message size from MAIL parameters. Parameters other
/// than SIZE are ignored. A `max_size` of 0 disables the limit.
pub fn parse_size_param(params: &str, max_size: u64) -> Result<Option<u64>, SizeParamError> {
    let Some(caps) = SIZE_PARAM_RE.captures(params) else {
        return Ok(None);
    };
    let size: u64 = caps[1].parse().map_err(|_| SizeParamError::Invalid)?;
    if max_size > 0 && size > max_size {
        return Err(SizeParamError::TooLarge { limit: max_size });
    }
    Ok(Some(size))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XclientArgs {
    pub addr: Option<String>,
    pub name: Option<String>,
}

/// Parse `ADDR=` and `NAME=` from XCLIENT arguments. Anything malformed is
/// skipped.
pub fn parse_xclient(args: &str) -> XclientArgs {
    let mut parsed = XclientArgs::default();
    for arg in args.split(' ') {
        let Some((key, value)) = arg.trim().split_once('=') else {
            continue;
        };
        match key.to_uppercase().as_str() {
            "ADDR" if value.parse::<IpAddr>().is_ok() => {
                parsed.addr = Some(value.to_string());
            }
            "NAME" if !value.is_empty() && value != "[UNAVAILABLE]" => {
                parsed.name = Some(value.to_string());
            }
            _ => {}
        }
    }
    parsed
}
