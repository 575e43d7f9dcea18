#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chaos_smtpd::{ListenAddr, PeerAddr, Server, ServerConfig};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// A message as seen by the message handler.
#[derive(Debug, Clone)]
pub struct Received {
    pub from: String,
    pub to: Vec<String>,
    pub data: String,
}

pub type Inbox = Arc<Mutex<Vec<Received>>>;

pub fn config() -> ServerConfig {
    ServerConfig {
        addr: ListenAddr::Tcp("127.0.0.1:0".to_string()),
        hostname: "mx.test".to_string(),
        disable_reverse_dns: true,
        ..Default::default()
    }
}

/// Install a message handler that records every message and answers with
/// `queue_id`.
pub fn with_inbox(mut config: ServerConfig, queue_id: Option<&str>) -> (ServerConfig, Inbox) {
    let inbox: Inbox = Arc::new(Mutex::new(Vec::new()));
    let sink = inbox.clone();
    let queue_id = queue_id.map(str::to_string);
    config.message_handler = Some(Arc::new(
        move |_: &PeerAddr,
              from: &str,
              to: &[String],
              data: Vec<u8>|
              -> anyhow::Result<Option<String>> {
            sink.lock().unwrap().push(Received {
                from: from.to_string(),
                to: to.to_vec(),
                data: String::from_utf8_lossy(&data).into_owned(),
            });
            Ok(queue_id.clone())
        },
    ));
    (config, inbox)
}

/// Bind on an ephemeral loopback port and serve in the background.
pub async fn start(config: ServerConfig) -> (Arc<Server>, SocketAddr) {
    let server = Arc::new(Server::new(config));
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (server, addr)
}

pub struct Client<S> {
    stream: BufReader<S>,
}

impl Client<TcpStream> {
    /// Connect and consume the 220 greeting.
    pub async fn connect(addr: SocketAddr) -> (Self, String) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client = Client::new(stream);
        let greeting = client.read_reply().await;
        (client, greeting)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Client<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }

    pub async fn send(&mut self, line: &str) {
        self.write_raw(format!("{}\r\n", line).as_bytes()).await;
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) {
        let stream = self.stream.get_mut();
        stream.write_all(bytes).await.unwrap();
        stream.flush().await.unwrap();
    }

    /// Read one line without its line ending; empty at end of stream.
    pub async fn read_line(&mut self) -> String {
        let mut line = String::new();
        timeout(IO_TIMEOUT, self.stream.read_line(&mut line))
            .await
            .expect("timed out waiting for the server")
            .unwrap();
        line.trim_end_matches(['\r', '\n']).to_string()
    }

    /// Read a complete, possibly multi-line, reply. Lines are joined with `\n`.
    pub async fn read_reply(&mut self) -> String {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await;
            let last = line.as_bytes().get(3) != Some(&b'-');
            lines.push(line);
            if last {
                break;
            }
        }
        lines.join("\n")
    }

    pub async fn cmd(&mut self, line: &str) -> String {
        self.send(line).await;
        self.read_reply().await
    }

    /// MAIL, RCPT and DATA for a single recipient, returning the final reply.
    pub async fn deliver(&mut self, from: &str, to: &str, body: &str) -> String {
        assert!(self.cmd(&format!("MAIL FROM:<{}>", from)).await.starts_with("250"));
        assert!(self.cmd(&format!("RCPT TO:<{}>", to)).await.starts_with("250"));
        assert!(self.cmd("DATA").await.starts_with("354"));
        self.write_raw(body.as_bytes()).await;
        self.write_raw(b".\r\n").await;
        self.read_reply().await
    }
}
