//! One SMTP connection: state, command dispatch and DATA framing.

use std::io;
use std::net::IpAddr;
use std::sync::{Arc, LazyLock};

use chrono::Local;
use hickory_resolver::TokioAsyncResolver;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

use crate::auth::{allowed_mechanisms, AuthAbort, Mechanism};
use crate::chaos::{ChaosEngine, TriggerKind};
use crate::config::ServerConfig;
use crate::handler::{Direction, PeerAddr};
use crate::parser::{self, Command, SizeParamError};

static SMTP_REPLY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([2-5][0-9]{2})[\s\-](.+)$").unwrap());

/// Longest command line accepted, CRLF included. Leaves room for AUTH
/// responses well past the 512 octets of RFC 5321 section 4.5.3.1.4.
const MAX_LINE_LENGTH: u64 = 16 * 1024;

/// Shortest body line ceiling when a size limit is set (RFC 5321 section 4.5.3.1.6).
const MIN_TEXT_LINE_LENGTH: u64 = 1000;

static RESOLVER: LazyLock<Option<TokioAsyncResolver>> =
    LazyLock::new(|| TokioAsyncResolver::tokio_from_system_conf().ok());

/// Any byte stream a session can run over: plain TCP, a Unix socket or TLS.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedConnection = Box<dyn Connection>;

enum Flow {
    Continue,
    Close,
}

/// The mail transaction in progress.
#[derive(Debug, Default)]
pub(crate) struct Transaction {
    from: Option<String>,
    recipients: Vec<String>,
}

impl Transaction {
    fn reset(&mut self) {
        self.from = None;
        self.recipients.clear();
    }

    fn in_progress(&self) -> bool {
        self.from.is_some() || !self.recipients.is_empty()
    }
}

pub struct Session {
    config: Arc<ServerConfig>,
    conn: BufReader<BoxedConnection>,
    peer: PeerAddr,
    remote_ip: String,
    /// Reverse DNS name, or the name given by a trusted XCLIENT.
    remote_host: String,
    /// Name the client gave with HELO/EHLO.
    remote_name: String,
    xclient_trusted: bool,
    xclient_addr: Option<String>,
    xclient_name: Option<String>,
    tls: bool,
    authenticated: bool,
    transaction: Transaction,
}

async fn lookup_host(ip: &str) -> String {
    let (Some(resolver), Ok(ip)) = (RESOLVER.as_ref(), ip.parse::<IpAddr>()) else {
        return "unknown".to_string();
    };
    match resolver.reverse_lookup(ip).await {
        Ok(names) => names
            .iter()
            .next()
            .map(|name| name.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        Err(_) => "unknown".to_string(),
    }
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "timeout exceeded")
}

#[derive(Debug, thiserror::Error)]
#[error("line too long")]
struct LineTooLong;

fn is_line_too_long(err: &io::Error) -> bool {
    err.get_ref().is_some_and(|inner| inner.is::<LineTooLong>())
}

impl Session {
    pub async fn new(
        config: Arc<ServerConfig>,
        conn: BoxedConnection,
        peer: PeerAddr,
        tls: bool,
    ) -> Self {
        let remote_ip = peer.ip();
        let remote_host = if config.disable_reverse_dns {
            "unknown".to_string()
        } else {
            lookup_host(&remote_ip).await
        };
        let xclient_trusted = config.xclient_allowed.iter().any(|ip| *ip == remote_ip);

        Self {
            config,
            conn: BufReader::new(conn),
            peer,
            remote_ip,
            remote_host,
            remote_name: String::new(),
            xclient_trusted,
            xclient_addr: None,
            xclient_name: None,
            tls,
            authenticated: false,
            transaction: Transaction::default(),
        }
    }

    pub(crate) fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub(crate) fn peer(&self) -> &PeerAddr {
        &self.peer
    }

    pub(crate) fn hostname(&self) -> &str {
        &self.config.hostname
    }

    fn timeout_reply(&self) -> String {
        format!(
            "421 4.4.2 {} {} ESMTP Service closing transmission channel after timeout exceeded",
            self.config.hostname, self.config.app_name
        )
    }

    /// Run the command loop until QUIT, a transport error or a timeout.
    pub async fn serve(mut self) {
        let banner = format!(
            "220 {} {} ESMTP Service ready",
            self.config.hostname, self.config.app_name
        );
        if self.reply(&banner).await.is_err() {
            return;
        }

        loop {
            let result = match self.read_line().await {
                Ok(line) => self.dispatch(&line).await,
                Err(err) => Err(err),
            };

            match result {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => break,
                Err(err) if is_line_too_long(&err) => {
                    if self.reply("500 5.5.2 Line too long").await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    if err.kind() == io::ErrorKind::TimedOut {
                        let reply = self.timeout_reply();
                        let _ = self.reply(&reply).await;
                    }
                    break;
                }
            }
        }

        let _ = self.conn.get_mut().shutdown().await;
    }

    async fn dispatch(&mut self, line: &str) -> io::Result<Flow> {
        let (verb, args) = parser::parse_line(line);

        match Command::from_verb(&verb) {
            Command::Helo => {
                self.remote_name = args;
                self.transaction.reset();
                let reply = format!("250 {} greets {}", self.config.hostname, self.remote_name);
                self.reply(&reply).await?;
            }
            Command::Ehlo => {
                self.remote_name = args;
                self.transaction.reset();
                let reply = self.ehlo_response();
                self.reply(&reply).await?;
            }
            Command::Mail => self.handle_mail(&args).await?,
            Command::Rcpt => self.handle_rcpt(&args).await?,
            Command::Data => self.handle_data().await?,
            Command::Rset => {
                if self.needs_tls() {
                    self.reply("530 5.7.0 Must issue a STARTTLS command first").await?;
                } else {
                    self.transaction.reset();
                    self.reply("250 2.0.0 Ok").await?;
                }
            }
            Command::Noop => self.reply("250 2.0.0 Ok").await?,
            Command::Quit => {
                let reply = format!(
                    "221 2.0.0 {} {} ESMTP Service closing transmission channel",
                    self.config.hostname, self.config.app_name
                );
                self.reply(&reply).await?;
                return Ok(Flow::Close);
            }
            Command::Help | Command::Vrfy | Command::Expn => {
                // RFC 5321 section 4.2.4
                self.reply("502 5.5.1 Command not implemented").await?;
            }
            Command::Xclient => self.handle_xclient(&args).await?,
            Command::StartTls => self.handle_starttls(&args).await?,
            Command::Auth => return self.handle_auth(&args).await,
            Command::Unknown => {
                self.reply("500 5.5.2 Syntax error, command unrecognized").await?;
            }
        }

        Ok(Flow::Continue)
    }

    fn needs_tls(&self) -> bool {
        self.config.tls_enforced() && !self.tls
    }

    fn needs_auth(&self) -> bool {
        self.config.auth_enforced() && !self.authenticated
    }

    /// Reply with a 530 if TLS or authentication must come first.
    async fn check_gates(&mut self) -> io::Result<bool> {
        if self.needs_tls() {
            self.reply("530 5.7.0 Must issue a STARTTLS command first").await?;
            return Ok(false);
        }
        if self.needs_auth() {
            self.reply("530 5.7.0 Authentication required").await?;
            return Ok(false);
        }
        Ok(true)
    }

    fn chaos(&self, kind: TriggerKind) -> Option<String> {
        self.config
            .chaos
            .trigger(kind)
            .map(|code| ChaosEngine::reply(kind, code))
    }

    async fn handle_mail(&mut self, args: &str) -> io::Result<()> {
        if !self.check_gates().await? {
            return Ok(());
        }

        let Some(path) = parser::parse_mail_from(args) else {
            self.transaction.recipients.clear();
            return self
                .reply("501 5.5.4 Syntax error in parameters or arguments (invalid FROM parameter)")
                .await;
        };

        if let Some(reply) = self.chaos(TriggerKind::Sender) {
            return self.reply(&reply).await;
        }

        self.transaction.recipients.clear();
        if let Some(params) = &path.params {
            match parser::parse_size_param(params, self.config.max_size) {
                Ok(_) => {}
                Err(SizeParamError::Invalid) => {
                    return self
                        .reply("501 5.5.4 Syntax error in parameters or arguments (invalid SIZE parameter)")
                        .await;
                }
                Err(SizeParamError::TooLarge { limit }) => {
                    return self.reply(&size_exceeded(limit)).await;
                }
            }
        }

        self.transaction.from = Some(path.address);
        self.reply("250 2.1.0 Ok").await
    }

    async fn handle_rcpt(&mut self, args: &str) -> io::Result<()> {
        if !self.check_gates().await? {
            return Ok(());
        }
        let Some(from) = self.transaction.from.clone() else {
            return self
                .reply("503 5.5.1 Bad sequence of commands (MAIL required before RCPT)")
                .await;
        };

        let Some(path) = parser::parse_rcpt_to(args) else {
            return self
                .reply("501 5.5.4 Syntax error in parameters or arguments (invalid TO parameter)")
                .await;
        };

        if let Some(reply) = self.chaos(TriggerKind::Recipient) {
            return self.reply(&reply).await;
        }

        if self.transaction.recipients.len() >= self.config.max_recipients {
            return self.reply("452 4.5.3 Too many recipients").await;
        }

        let accepted = match &self.config.recipient_handler {
            Some(handler) => handler.accept(&self.peer, &from, &path.address),
            None => true,
        };
        if !accepted {
            return self
                .reply("550 5.1.0 Requested action not taken: mailbox unavailable")
                .await;
        }

        self.transaction.recipients.push(path.address);
        self.reply("250 2.1.5 Ok").await
    }

    async fn handle_data(&mut self) -> io::Result<()> {
        if !self.check_gates().await? {
            return Ok(());
        }
        if self.transaction.from.is_none() || self.transaction.recipients.is_empty() {
            return self
                .reply("503 5.5.1 Bad sequence of commands (MAIL & RCPT required before DATA)")
                .await;
        }

        self.reply("354 Start mail input; end with <CR><LF>.<CR><LF>").await?;

        let Some(body) = self.read_data().await? else {
            // the transaction survives an oversized body
            return self.reply(&size_exceeded(self.config.max_size)).await;
        };

        let from = self.transaction.from.take().unwrap_or_default();
        let to = std::mem::take(&mut self.transaction.recipients);
        self.transaction.reset();

        let mut message = self.received_header(&to);
        message.extend_from_slice(&body);

        let reply = match &self.config.message_handler {
            Some(handler) => match handler.handle(&self.peer, &from, &to, message) {
                Ok(Some(id)) if !id.is_empty() => format!("250 2.0.0 Ok: queued as {}", id),
                Ok(_) => "250 2.0.0 Ok: queued".to_string(),
                Err(err) => {
                    let text = err.to_string();
                    if SMTP_REPLY_RE.is_match(&text) {
                        text
                    } else {
                        "451 4.3.5 Unable to process mail".to_string()
                    }
                }
            },
            None => "250 2.0.0 Ok: queued".to_string(),
        };
        self.reply(&reply).await
    }

    async fn handle_xclient(&mut self, args: &str) -> io::Result<()> {
        if self.xclient_trusted {
            let parsed = parser::parse_xclient(args);
            if parsed.addr.is_some() {
                self.xclient_addr = parsed.addr;
            }
            if parsed.name.is_some() {
                self.xclient_name = parsed.name;
            }

            if let Some(addr) = self.xclient_addr.clone() {
                self.remote_ip = addr;
                self.remote_host = match &self.xclient_name {
                    Some(name) => name.clone(),
                    None if self.config.disable_reverse_dns => "unknown".to_string(),
                    None => lookup_host(&self.remote_ip).await,
                };
            }
        }
        self.reply("250 2.0.0 Ok").await
    }

    async fn handle_starttls(&mut self, args: &str) -> io::Result<()> {
        // RFC 3207 section 4: no parameters
        if !args.is_empty() {
            return self.reply("501 5.5.2 Syntax error (no parameters allowed)").await;
        }
        let Some(tls_config) = self.config.tls.clone() else {
            return self.reply("502 5.5.1 Command not implemented").await;
        };
        if self.tls {
            return self
                .reply("503 5.5.1 Bad sequence of commands (TLS already in use)")
                .await;
        }

        self.reply("220 2.0.0 Ready to start TLS").await?;

        // Anything the client pipelined before the handshake is dropped
        // along with the plaintext buffer.
        let placeholder: BoxedConnection = Box::new(tokio::io::duplex(1).0);
        let plain = std::mem::replace(&mut self.conn, BufReader::new(placeholder)).into_inner();

        let acceptor = TlsAcceptor::from(tls_config);
        let handshake = timeout(self.config.timeout, acceptor.accept(plain).into_fallible());
        // a stalled handshake ends the session like any other timeout
        match handshake.await.map_err(|_| timed_out())? {
            Ok(stream) => {
                let secured: BoxedConnection = Box::new(stream);
                self.conn = BufReader::new(secured);
                self.tls = true;
                // RFC 3207: forget everything learned before the handshake
                self.remote_name.clear();
                self.transaction.reset();
                Ok(())
            }
            Err((_, plain)) => {
                self.conn = BufReader::new(plain);
                self.reply("403 4.7.0 TLS handshake failed").await
            }
        }
    }

    async fn handle_auth(&mut self, args: &str) -> io::Result<Flow> {
        if self.needs_tls() {
            self.reply("530 5.7.0 Must issue a STARTTLS command first").await?;
            return Ok(Flow::Continue);
        }
        if self.config.auth_handler.is_none() {
            self.reply("502 5.5.1 Command not implemented").await?;
            return Ok(Flow::Continue);
        }
        if self.authenticated {
            self.reply("503 5.5.1 Bad sequence of commands (already authenticated for this session)")
                .await?;
            return Ok(Flow::Continue);
        }
        if self.transaction.in_progress() {
            self.reply("503 5.5.1 Bad sequence of commands (AUTH not permitted during mail transaction)")
                .await?;
            return Ok(Flow::Continue);
        }

        let (mech_name, initial) = parser::parse_line(args);
        if mech_name.is_empty() {
            self.reply("501 5.5.4 Malformed AUTH input (argument required)").await?;
            return Ok(Flow::Continue);
        }

        let mechanism = match mech_name.parse::<Mechanism>() {
            Ok(mech) if mech.is_allowed(self.tls, &self.config.auth_mechs) => mech,
            _ => {
                self.reply("504 5.5.4 Unrecognized authentication type").await?;
                return Ok(Flow::Continue);
            }
        };

        if let Some(reply) = self.chaos(TriggerKind::Authentication) {
            self.reply(&reply).await?;
            return Ok(Flow::Continue);
        }

        let outcome = match mechanism {
            Mechanism::Plain => self.auth_plain(&initial).await,
            Mechanism::Login => self.auth_login(&initial).await,
            Mechanism::CramMd5 => self.auth_cram_md5().await,
        };

        match outcome {
            Ok(true) => {
                self.authenticated = true;
                self.reply("235 2.7.0 Authentication successful").await?;
            }
            Ok(false) => {
                self.reply("535 5.7.8 Authentication credentials invalid").await?;
            }
            Err(AuthAbort::Reply(reply)) => self.reply(reply).await?,
            Err(AuthAbort::Io(err)) => return Err(err),
        }
        Ok(Flow::Continue)
    }

    fn ehlo_response(&self) -> String {
        let mut response = format!(
            "250-{} greets {}\r\n",
            self.config.hostname, self.remote_name
        );

        // RFC 1870: SIZE 0 means no limit
        response.push_str(&format!("250-SIZE {}\r\n", self.config.max_size));

        if self.config.tls.is_some() && !self.tls {
            response.push_str("250-STARTTLS\r\n");
        }

        if self.config.auth_handler.is_some() {
            let mechs = allowed_mechanisms(self.tls, &self.config.auth_mechs);
            if !mechs.is_empty() {
                let names: Vec<&str> = mechs.iter().map(|mech| mech.as_str()).collect();
                response.push_str(&format!("250-AUTH {}\r\n", names.join(" ")));
            }
        }

        response.push_str("250 ENHANCEDSTATUSCODES");
        response
    }

    /// Trace header required by RFC 5321 section 4.4.
    fn received_header(&self, to: &[String]) -> Vec<u8> {
        let now = Local::now().format("%a, %-d %b %Y %H:%M:%S %z (%Z)");
        let first = to.first().map(String::as_str).unwrap_or_default();
        format!(
            "Received: from {} ({} [{}])\r\n        by {} ({}) with SMTP\r\n        for <{}>; {}\r\n",
            self.remote_name,
            self.remote_host,
            self.remote_ip,
            self.config.hostname,
            self.config.app_name,
            first,
            now
        )
        .into_bytes()
    }

    /// Read the message body after a 354. Returns `None` if the body went
    /// over the size limit; it is still read through to the final dot.
    async fn read_data(&mut self) -> io::Result<Option<Vec<u8>>> {
        let max_size = self.config.max_size;
        let line_limit = match max_size {
            0 => u64::MAX,
            limit => limit.max(MIN_TEXT_LINE_LENGTH) + 2,
        };
        let mut data = Vec::new();
        let mut received: u64 = 0;
        let mut exceeded = false;
        let mut line = Vec::new();

        loop {
            line.clear();
            if !self.read_bounded_line(&mut line, line_limit).await? {
                exceeded = true;
                continue;
            }

            if line == b".\r\n" || line == b".\n" {
                break;
            }

            received += line.len() as u64;
            if max_size > 0 && received > max_size {
                exceeded = true;
            }
            if exceeded {
                continue;
            }

            // RFC 5321 section 4.5.2
            let unstuffed = match line.first() {
                Some(b'.') => &line[1..],
                _ => &line[..],
            };
            data.extend_from_slice(unstuffed);
        }

        Ok((!exceeded).then_some(data))
    }

    /// Read one LF-terminated line of at most `limit` bytes into `buf`.
    /// Returns `false` for a longer line, whose remainder is read and dropped.
    async fn read_bounded_line(&mut self, buf: &mut Vec<u8>, limit: u64) -> io::Result<bool> {
        let read = timeout(
            self.config.timeout,
            (&mut self.conn).take(limit).read_until(b'\n', buf),
        )
        .await
        .map_err(|_| timed_out())??;
        if buf.last() == Some(&b'\n') {
            return Ok(true);
        }
        if (read as u64) < limit {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }

        loop {
            let (used, done) = {
                let available = timeout(self.config.timeout, self.conn.fill_buf())
                    .await
                    .map_err(|_| timed_out())??;
                if available.is_empty() {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                match available.iter().position(|&b| b == b'\n') {
                    Some(end) => (end + 1, true),
                    None => (available.len(), false),
                }
            };
            self.conn.consume(used);
            if done {
                return Ok(false);
            }
        }
    }

    pub(crate) async fn read_line(&mut self) -> io::Result<String> {
        let mut buf = Vec::new();
        if !self.read_bounded_line(&mut buf, MAX_LINE_LENGTH).await? {
            return Err(io::Error::new(io::ErrorKind::InvalidData, LineTooLong));
        }

        let line = String::from_utf8_lossy(&buf).trim().to_string();
        if let Some(logger) = &self.config.log_read {
            logger.log_line(&self.remote_ip, Direction::Read, &line);
        }
        Ok(line)
    }

    pub(crate) async fn reply(&mut self, line: &str) -> io::Result<()> {
        let payload = format!("{}\r\n", line);
        timeout(self.config.timeout, async {
            self.conn.write_all(payload.as_bytes()).await?;
            self.conn.flush().await
        })
        .await
        .map_err(|_| timed_out())??;

        if let Some(logger) = &self.config.log_write {
            logger.log_line(&self.remote_ip, Direction::Write, line);
        }
        Ok(())
    }
}

/// RFC 5321 wording in preference to RFC 1870; RFC 3463 x.3.4 is
/// "message too big for system".
fn size_exceeded(limit: u64) -> String {
    format!(
        "552 5.3.4 Requested mail action aborted: exceeded storage allocation ({})",
        limit
    )
}
