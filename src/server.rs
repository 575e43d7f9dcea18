//! Listener lifecycle, per-connection tasks and shutdown.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(unix)]
use std::path::{Path, PathBuf};

use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

use crate::chaos::ChaosEngine;
use crate::config::{ListenAddr, ServerConfig};
use crate::error::{Result, SmtpdError};
use crate::handler::PeerAddr;
use crate::session::{BoxedConnection, Session};

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix { listener: UnixListener, path: PathBuf },
}

impl Listener {
    /// Bound TCP address; `None` for Unix sockets.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            Listener::Unix { .. } => None,
        }
    }

    async fn accept(&self) -> io::Result<(BoxedConnection, PeerAddr)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                let conn: BoxedConnection = Box::new(stream);
                Ok((conn, PeerAddr::Tcp(addr)))
            }
            #[cfg(unix)]
            Listener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                let conn: BoxedConnection = Box::new(stream);
                Ok((conn, PeerAddr::Unix))
            }
        }
    }
}

#[cfg(unix)]
impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Refuse a socket path that something is still listening on, and clear a
/// stale one.
#[cfg(unix)]
async fn prepare_socket(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    if UnixStream::connect(path).await.is_ok() {
        return Err(SmtpdError::SocketInUse(path.display().to_string()));
    }
    std::fs::remove_file(path)?;
    Ok(())
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

/// Keeps the open-session count accurate however the task ends.
struct SessionGuard {
    open_sessions: Arc<AtomicUsize>,
}

impl SessionGuard {
    fn new(open_sessions: Arc<AtomicUsize>) -> Self {
        open_sessions.fetch_add(1, Ordering::SeqCst);
        Self { open_sessions }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Server {
    config: Arc<ServerConfig>,
    in_shutdown: AtomicBool,
    open_sessions: Arc<AtomicUsize>,
    shutdown_tx: watch::Sender<bool>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config: Arc::new(config.with_defaults()),
            in_shutdown: AtomicBool::new(false),
            open_sessions: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The fault-injection engine shared by every session of this server.
    pub fn chaos(&self) -> &Arc<ChaosEngine> {
        &self.config.chaos
    }

    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    fn is_shutting_down(&self) -> bool {
        self.in_shutdown.load(Ordering::SeqCst)
    }

    fn implicit_tls(&self) -> Option<TlsAcceptor> {
        match &self.config.tls {
            Some(tls) if self.config.tls_listener => Some(TlsAcceptor::from(tls.clone())),
            _ => None,
        }
    }

    /// Bind the configured TCP address or Unix socket.
    pub async fn bind(&self) -> Result<Listener> {
        if self.is_shutting_down() {
            return Err(SmtpdError::ServerClosed);
        }

        match &self.config.addr {
            ListenAddr::Tcp(addr) => Ok(Listener::Tcp(TcpListener::bind(addr).await?)),
            #[cfg(unix)]
            ListenAddr::Unix { path, mode } => {
                use std::os::unix::fs::PermissionsExt;

                prepare_socket(path).await?;
                let listener = UnixListener::bind(path)?;
                let listener = Listener::Unix {
                    listener,
                    path: path.clone(),
                };
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(*mode))?;
                Ok(listener)
            }
            #[cfg(not(unix))]
            ListenAddr::Unix { .. } => Err(SmtpdError::InvalidListenAddr(
                self.config.addr.to_string(),
            )),
        }
    }

    pub async fn listen_and_serve(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections until [`Server::close`] or [`Server::shutdown`]
    /// is called, which makes this return [`SmtpdError::ServerClosed`].
    pub async fn serve(&self, listener: Listener) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            if self.is_shutting_down() {
                return Err(SmtpdError::ServerClosed);
            }

            let accepted = tokio::select! {
                _ = shutdown_rx.changed() => return Err(SmtpdError::ServerClosed),
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((conn, peer)) => self.spawn_session(conn, peer),
                Err(err) if is_transient(&err) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn spawn_session(&self, conn: BoxedConnection, peer: PeerAddr) {
        let guard = SessionGuard::new(self.open_sessions.clone());
        let config = self.config.clone();
        let implicit_tls = self.implicit_tls();

        tokio::spawn(async move {
            let _guard = guard;
            let (conn, tls) = match implicit_tls {
                // plaintext and silent clients on a TLS listener are dropped here
                Some(acceptor) => match timeout(config.timeout, acceptor.accept(conn)).await {
                    Ok(Ok(stream)) => (Box::new(stream) as BoxedConnection, true),
                    _ => return,
                },
                None => (conn, false),
            };
            Session::new(config, conn, peer, tls).await.serve().await;
        });
    }

    fn stop_accepting(&self) {
        self.in_shutdown.store(true, Ordering::SeqCst);
        self.shutdown_tx.send_replace(true);
    }

    /// Stop accepting immediately. Sessions already running are left alone
    /// and not waited for.
    pub fn close(&self) {
        self.stop_accepting();
    }

    /// Stop accepting, then wait for open sessions to finish on their own.
    /// Fails with [`SmtpdError::ShutdownTimeout`] if some are still open
    /// when `deadline` elapses.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        self.stop_accepting();

        let started = Instant::now();
        loop {
            let open = self.open_sessions();
            if open == 0 {
                return Ok(());
            }
            if started.elapsed() >= deadline {
                return Err(SmtpdError::ShutdownTimeout(open));
            }
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL.min(deadline)).await;
        }
    }
}
