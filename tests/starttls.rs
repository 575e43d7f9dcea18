mod common;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chaos_smtpd::{load_tls_config, Server, ServerConfig};
use common::{config, start, with_inbox, Client};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, ServerName};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

struct VerifyAll;

impl ServerCertVerifier for VerifyAll {
    fn verify_server_cert(
        &self,
        _: &Certificate,
        _: &[Certificate],
        _: &ServerName,
        _: &mut dyn Iterator<Item = &[u8]>,
        _: &[u8],
        _: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

/// Server config with a freshly generated self-signed certificate.
fn tls_config() -> ServerConfig {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, certified.cert.pem()).unwrap();
    std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();

    ServerConfig {
        tls: Some(load_tls_config(&cert_path, &key_path).unwrap()),
        ..config()
    }
}

fn connector() -> TlsConnector {
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(VerifyAll))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

async fn handshake<S>(stream: S) -> Client<tokio_rustls::client::TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let name = ServerName::try_from("localhost").unwrap();
    let stream = connector().connect(name, stream).await.unwrap();
    Client::new(stream)
}

async fn starttls(mut client: Client<TcpStream>) -> Client<tokio_rustls::client::TlsStream<TcpStream>> {
    assert_eq!(client.cmd("STARTTLS").await, "220 2.0.0 Ready to start TLS");
    handshake(client.into_inner()).await
}

#[tokio::test]
async fn test_ehlo_advertises_starttls_until_upgraded() {
    let (_server, addr) = start(tls_config()).await;
    let (mut client, _) = Client::connect(addr).await;

    assert!(client.cmd("EHLO client.test").await.contains("\n250-STARTTLS\n"));

    let mut client = starttls(client).await;
    assert!(!client.cmd("EHLO client.test").await.contains("STARTTLS"));
}

#[tokio::test]
async fn test_starttls_resets_transaction() {
    let (_server, addr) = start(tls_config()).await;
    let (mut client, _) = Client::connect(addr).await;

    client.cmd("EHLO client.test").await;
    assert_eq!(client.cmd("MAIL FROM:<alice@x.com>").await, "250 2.1.0 Ok");
    assert_eq!(client.cmd("RCPT TO:<bob@x.com>").await, "250 2.1.5 Ok");

    let mut client = starttls(client).await;
    assert_eq!(
        client.cmd("DATA").await,
        "503 5.5.1 Bad sequence of commands (MAIL & RCPT required before DATA)"
    );
}

#[tokio::test]
async fn test_delivery_over_starttls() {
    let (config, inbox) = with_inbox(tls_config(), None);
    let (_server, addr) = start(config).await;
    let (client, _) = Client::connect(addr).await;

    let mut client = starttls(client).await;
    client.cmd("EHLO client.test").await;
    let reply = client.deliver("alice@x.com", "bob@x.com", "secret body\r\n").await;
    assert_eq!(reply, "250 2.0.0 Ok: queued");
    assert!(inbox.lock().unwrap()[0].data.ends_with("\r\nsecret body\r\n"));
    client.cmd("QUIT").await;
}

#[tokio::test]
async fn test_tls_required_gates_commands() {
    let (_server, addr) = start(ServerConfig {
        tls_required: true,
        ..tls_config()
    })
    .await;
    let (mut client, _) = Client::connect(addr).await;

    for line in ["MAIL FROM:<alice@x.com>", "RCPT TO:<bob@x.com>", "DATA", "RSET", "AUTH PLAIN"] {
        assert_eq!(
            client.cmd(line).await,
            "530 5.7.0 Must issue a STARTTLS command first"
        );
    }
    assert_eq!(client.cmd("NOOP").await, "250 2.0.0 Ok");

    let mut client = starttls(client).await;
    assert_eq!(client.cmd("MAIL FROM:<alice@x.com>").await, "250 2.1.0 Ok");
}

#[tokio::test]
async fn test_starttls_errors() {
    let (_server, addr) = start(tls_config()).await;
    let (mut client, _) = Client::connect(addr).await;

    assert_eq!(
        client.cmd("STARTTLS now").await,
        "501 5.5.2 Syntax error (no parameters allowed)"
    );

    let mut client = starttls(client).await;
    assert_eq!(
        client.cmd("STARTTLS").await,
        "503 5.5.1 Bad sequence of commands (TLS already in use)"
    );
}

#[tokio::test]
async fn test_starttls_without_certificate() {
    let (_server, addr) = start(config()).await;
    let (mut client, _) = Client::connect(addr).await;

    assert_eq!(
        client.cmd("STARTTLS").await,
        "502 5.5.1 Command not implemented"
    );
}

#[tokio::test]
async fn test_failed_handshake() {
    let (_server, addr) = start(tls_config()).await;
    let (mut client, _) = Client::connect(addr).await;

    assert_eq!(client.cmd("STARTTLS").await, "220 2.0.0 Ready to start TLS");
    // not a TLS record; the server gives up on the handshake and answers in
    // plaintext, possibly after a TLS alert
    client.write_raw(b"HELLO\r\n").await;
    let mut reply = client.read_line().await;
    while !reply.is_empty() && !reply.ends_with("403 4.7.0 TLS handshake failed") {
        reply = client.read_line().await;
    }
    assert!(reply.ends_with("403 4.7.0 TLS handshake failed"), "{:?}", reply);
    assert_eq!(client.cmd("NOOP").await, "250 2.0.0 Ok");
}

#[tokio::test]
async fn test_tls_listener() {
    let (_server, addr) = start(ServerConfig {
        tls_listener: true,
        ..tls_config()
    })
    .await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut client = handshake(stream).await;
    assert_eq!(
        client.read_reply().await,
        "220 mx.test smtpd ESMTP Service ready"
    );

    let ehlo = client.cmd("EHLO client.test").await;
    assert!(!ehlo.contains("STARTTLS"));
    assert_eq!(client.cmd("MAIL FROM:<alice@x.com>").await, "250 2.1.0 Ok");
}

#[tokio::test]
async fn test_tls_listener_drops_plaintext_clients() {
    let (_server, addr) = start(ServerConfig {
        tls_listener: true,
        ..tls_config()
    })
    .await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut client = Client::new(stream);
    client.write_raw(b"EHLO client.test\r\n").await;
    // at most a TLS alert comes back before the connection closes
    loop {
        let line = client.read_line().await;
        assert!(!line.contains("220 "), "{:?}", line);
        if line.is_empty() {
            break;
        }
    }
}

async fn wait_for_no_sessions(server: &Server) {
    for _ in 0..100 {
        if server.open_sessions() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.open_sessions(), 0);
}

#[tokio::test]
async fn test_stalled_starttls_handshake_times_out() {
    let (server, addr) = start(ServerConfig {
        timeout: Duration::from_millis(200),
        ..tls_config()
    })
    .await;
    let (mut client, _) = Client::connect(addr).await;

    assert_eq!(client.cmd("STARTTLS").await, "220 2.0.0 Ready to start TLS");
    // no ClientHello follows
    assert_eq!(client.read_line().await, "");
    wait_for_no_sessions(&server).await;
    assert!(server.shutdown(Duration::from_secs(1)).await.is_ok());
}

#[tokio::test]
async fn test_tls_listener_drops_silent_clients() {
    let (server, addr) = start(ServerConfig {
        timeout: Duration::from_millis(200),
        tls_listener: true,
        ..tls_config()
    })
    .await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut client = Client::new(stream);
    assert_eq!(client.read_line().await, "");
    wait_for_no_sessions(&server).await;
    assert!(server.shutdown(Duration::from_secs(1)).await.is_ok());
}
