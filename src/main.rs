mod utils;

use anyhow::{bail, Context, Result};
use chaos_smtpd::{
    load_tls_config, ListenAddr, Mechanism, PeerAddr, Server, ServerConfig, SmtpdError,
};
use chrono::Utc;
use rand::rngs::OsRng;
use rand::Rng;
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;

use utils::{Level, Logger};

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "chaos-smtpd",
    about = "An SMTP server for testing mail clients, with fault injection"
)]
pub struct Opt {
    /// Listen address, host:port or unix:<path>:<mode>
    #[structopt(short = "l", long = "listen", default_value = "0.0.0.0:1025")]
    pub listen: String,

    /// Hostname announced in the banner (default: system hostname)
    #[structopt(long = "hostname", default_value = "")]
    pub hostname: String,

    /// Label appended to the application name in banners
    #[structopt(long = "label")]
    pub label: Option<String>,

    /// TLS certificate file (PEM)
    #[structopt(long = "tls-cert", parse(from_os_str))]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key file (PEM)
    #[structopt(long = "tls-key", parse(from_os_str))]
    pub tls_key: Option<PathBuf>,

    /// Require STARTTLS before mail transactions
    #[structopt(long = "require-starttls")]
    pub require_starttls: bool,

    /// Accept implicit TLS connections only
    #[structopt(long = "require-tls")]
    pub require_tls: bool,

    /// Maximum message size in bytes, 0 for unlimited
    #[structopt(long = "max-size", default_value = "0")]
    pub max_size: u64,

    /// Maximum recipients per message
    #[structopt(long = "max-recipients", default_value = "100")]
    pub max_recipients: usize,

    /// Idle timeout in seconds
    #[structopt(long = "timeout", default_value = "300")]
    pub timeout: u64,

    /// Accepted credentials as user:password (can be specified multiple times)
    #[structopt(long = "auth", number_of_values = 1)]
    pub auth: Vec<String>,

    /// Accept any credentials
    #[structopt(long = "auth-accept-any")]
    pub auth_accept_any: bool,

    /// Offer PLAIN and LOGIN without TLS
    #[structopt(long = "auth-allow-insecure")]
    pub auth_allow_insecure: bool,

    /// Only accept recipients matching this regular expression
    #[structopt(long = "allowed-recipients")]
    pub allowed_recipients: Option<String>,

    /// Peer IP allowed to use XCLIENT (can be specified multiple times)
    #[structopt(long = "xclient-allowed", number_of_values = 1)]
    pub xclient_allowed: Vec<String>,

    /// Skip reverse DNS lookups of connecting peers
    #[structopt(long = "disable-reverse-dns")]
    pub disable_reverse_dns: bool,

    /// Fault injection, e.g. Sender:451:10,Recipient:452:5,Authentication:535:20
    #[structopt(long = "chaos-triggers")]
    pub chaos_triggers: Option<String>,

    /// Directory to save received messages
    #[structopt(long = "data", parse(from_os_str))]
    pub data_dir: Option<PathBuf>,

    /// Log file path
    #[structopt(long = "logs", parse(from_os_str))]
    pub log_file: Option<PathBuf>,

    /// Verbose mode - display a summary of every message
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,

    /// Enable raw display (not filtered) - DANGEROUS
    #[structopt(short = "r", long = "raw")]
    pub raw_display: bool,
}

fn parse_credentials(entries: &[String]) -> Result<HashMap<String, String>> {
    let mut credentials = HashMap::new();
    for entry in entries {
        let Some((user, password)) = entry.split_once(':') else {
            bail!("invalid --auth value {:?}, expected user:password", entry);
        };
        if user.is_empty() {
            bail!("invalid --auth value {:?}, empty user", entry);
        }
        credentials.insert(user.to_string(), password.to_string());
    }
    Ok(credentials)
}

fn queue_id() -> String {
    format!(
        "{:X}{:05X}",
        Utc::now().timestamp_micros(),
        OsRng.gen_range(0u32..0x10_0000)
    )
}

/// Store each message as `<queue id>.eml` in `data_dir`.
fn spool_handler(
    data_dir: Option<PathBuf>,
    logger: Arc<Logger>,
) -> impl Fn(&PeerAddr, &str, &[String], Vec<u8>) -> anyhow::Result<Option<String>> + Send + Sync {
    move |peer: &PeerAddr,
          from: &str,
          to: &[String],
          data: Vec<u8>|
          -> anyhow::Result<Option<String>> {
        let id = queue_id();

        if let Some(dir) = &data_dir {
            let path = dir.join(format!("{}.eml", id));
            std::fs::write(&path, &data)
                .with_context(|| format!("failed to write {:?}", path))?;
        }

        logger.log(
            Level::Info,
            &peer.ip(),
            &format!(
                "queued {} from=<{}> to={:?} size={}",
                id,
                from,
                to,
                data.len()
            ),
        );
        logger.log_verbose(
            &peer.ip(),
            &format!("message {}", id),
            &String::from_utf8_lossy(&data),
        );

        Ok(Some(id))
    }
}

fn build_config(opt: &Opt, logger: Arc<Logger>) -> Result<ServerConfig> {
    let addr: ListenAddr = opt
        .listen
        .parse::<ListenAddr>()
        .with_context(|| format!("invalid --listen value {:?}", opt.listen))?;

    let mut config = ServerConfig {
        addr,
        hostname: opt.hostname.clone(),
        max_size: opt.max_size,
        max_recipients: opt.max_recipients,
        timeout: Duration::from_secs(opt.timeout),
        disable_reverse_dns: opt.disable_reverse_dns,
        xclient_allowed: opt.xclient_allowed.clone(),
        log_read: Some(logger.clone()),
        log_write: Some(logger.clone()),
        ..Default::default()
    };

    if let Some(label) = &opt.label {
        config.app_name = format!("{} ({})", config.app_name, label);
    }

    match (&opt.tls_cert, &opt.tls_key) {
        (Some(cert), Some(key)) => {
            config.tls = Some(load_tls_config(cert, key).context("failed to load TLS material")?);
            config.tls_required = opt.require_starttls;
            config.tls_listener = opt.require_tls;
        }
        (None, None) => {}
        _ => bail!("--tls-cert and --tls-key must be given together"),
    }

    let credentials = parse_credentials(&opt.auth)?;
    if !credentials.is_empty() || opt.auth_accept_any {
        let accept_any = opt.auth_accept_any;
        config.auth_required = !credentials.is_empty();
        config.auth_mechs = if opt.auth_allow_insecure {
            HashMap::from([
                (Mechanism::CramMd5, false),
                (Mechanism::Plain, true),
                (Mechanism::Login, true),
            ])
        } else {
            HashMap::from([(Mechanism::CramMd5, false)])
        };
        config.auth_handler = Some(Arc::new(
            move |_: &PeerAddr,
                  mechanism: Mechanism,
                  identity: &[u8],
                  secret: &[u8],
                  _: Option<&[u8]>|
                  -> anyhow::Result<bool> {
                if accept_any {
                    return Ok(true);
                }
                if mechanism == Mechanism::CramMd5 {
                    return Ok(false);
                }
                let user = String::from_utf8_lossy(identity);
                Ok(credentials
                    .get(&*user)
                    .is_some_and(|password| password.as_bytes() == secret))
            },
        ));
    }

    if let Some(pattern) = &opt.allowed_recipients {
        let allowed = Regex::new(pattern)
            .with_context(|| format!("invalid --allowed-recipients pattern {:?}", pattern))?;
        config.recipient_handler = Some(Arc::new(
            move |_: &PeerAddr, _: &str, to: &str| -> bool { allowed.is_match(to) },
        ));
    }

    if let Some(triggers) = &opt.chaos_triggers {
        config
            .chaos
            .apply_spec(triggers)
            .with_context(|| format!("invalid --chaos-triggers value {:?}", triggers))?;
    }

    config.message_handler = Some(Arc::new(spool_handler(opt.data_dir.clone(), logger)));

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::from_args();

    println!("==========================================");
    println!("chaos-smtpd v{}", env!("CARGO_PKG_VERSION"));
    println!("==========================================");

    eprintln!("[INFO] PID: {}", std::process::id());

    if let Some(data_dir) = &opt.data_dir {
        if !data_dir.exists() {
            std::fs::create_dir_all(data_dir)?;
            eprintln!("[INFO] Created data directory: {:?}", data_dir);
        }
    }

    let logger = Arc::new(Logger::new(opt.log_file.clone(), opt.raw_display, opt.verbose)?);

    let config = match build_config(&opt, logger) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("[ERROR] {:#}", e);
            std::process::exit(1);
        }
    };
    let server = Server::new(config);

    eprintln!("[INFO] Listening on {}", server.config().addr);
    eprintln!("[INFO] Hostname: {}", server.config().hostname);
    if server.config().tls.is_some() {
        eprintln!(
            "[INFO] TLS enabled (STARTTLS required: {}, implicit TLS: {})",
            server.config().tls_required,
            server.config().tls_listener
        );
    }
    if server.config().auth_handler.is_some() {
        eprintln!("[INFO] AUTH enabled (required: {})", server.config().auth_required);
    }
    if server.chaos().is_enabled() {
        eprintln!("[INFO] Chaos triggers: {:?}", server.chaos().triggers());
    }
    eprintln!("[INFO] Press Ctrl+C to stop");

    tokio::select! {
        result = server.listen_and_serve() => {
            if let Err(e) = result {
                eprintln!("[ERROR] Server error: {}", e);
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            eprintln!("[INFO] Shutting down, waiting for open sessions...");
            match server.shutdown(SHUTDOWN_DEADLINE).await {
                Ok(()) => eprintln!("[INFO] All sessions closed"),
                Err(SmtpdError::ShutdownTimeout(open)) => {
                    eprintln!("[ERROR] Gave up waiting for {} session(s)", open);
                }
                Err(e) => eprintln!("[ERROR] Shutdown failed: {}", e),
            }
        }
    }

    Ok(())
}
