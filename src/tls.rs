use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};

use crate::error::{Result, SmtpdError};

fn read_private_key(key_path: &Path) -> Result<PrivateKey> {
    let mut key_reader = BufReader::new(File::open(key_path)?);
    let mut keys = pkcs8_private_keys(&mut key_reader)
        .map_err(|_| SmtpdError::Tls(format!("failed to parse private key {:?}", key_path)))?;

    if keys.is_empty() {
        // fall back to PKCS#1 "BEGIN RSA PRIVATE KEY" files
        let mut key_reader = BufReader::new(File::open(key_path)?);
        keys = rsa_private_keys(&mut key_reader)
            .map_err(|_| SmtpdError::Tls(format!("failed to parse private key {:?}", key_path)))?;
    }

    if keys.is_empty() {
        return Err(SmtpdError::Tls(format!("no private key found in {:?}", key_path)));
    }

    Ok(PrivateKey(keys.remove(0)))
}

/// Build a rustls server configuration from PEM encoded certificate chain
/// and private key files.
pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    let mut cert_reader = BufReader::new(File::open(cert_path)?);
    let cert_chain: Vec<Certificate> = certs(&mut cert_reader)
        .map_err(|_| SmtpdError::Tls(format!("failed to parse certificate {:?}", cert_path)))?
        .into_iter()
        .map(Certificate)
        .collect();

    if cert_chain.is_empty() {
        return Err(SmtpdError::Tls(format!("no certificate found in {:?}", cert_path)));
    }

    let private_key = read_private_key(key_path)?;

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .map_err(|e| SmtpdError::Tls(format!("failed to build TLS config: {}", e)))?;

    Ok(Arc::new(config))
}
