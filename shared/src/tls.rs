//! Loading PEM material into rustls acceptors and connectors.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use crate::{Error, Result};

fn tls_error(message: String) -> Error {
    Error::Connection(message)
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| tls_error(format!("failed to open certificate '{}': {e}", path.display())))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| tls_error(format!("failed to parse certificate '{}': {e}", path.display())))?;
    if certs.is_empty() {
        return Err(tls_error(format!("no certificates in '{}'", path.display())));
    }
    debug!(path = %path.display(), count = certs.len(), "Loaded certificates");
    Ok(certs)
}

pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| tls_error(format!("failed to open key '{}': {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| tls_error(format!("failed to parse key '{}': {e}", path.display())))?
        .ok_or_else(|| tls_error(format!("no private key in '{}'", path.display())))
}

/// Server-side TLS for the TLS control port and the HTTPS vhost port.
pub fn acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor> {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(load_certs(cert)?, load_private_key(key)?)
        .map_err(|e| tls_error(format!("invalid certificate/key pair: {e}")))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Client-side TLS trusting only the certificates in `ca`.
pub fn connector(ca: &Path) -> Result<TlsConnector> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca)? {
        roots
            .add(cert)
            .map_err(|e| tls_error(format!("invalid CA certificate: {e}")))?;
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host)
        .map(|name| name.to_owned())
        .map_err(|_| tls_error(format!("invalid TLS server name '{host}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_files() {
        assert!(load_certs(Path::new("/nonexistent/cert.pem")).is_err());
        assert!(acceptor(Path::new("/nonexistent/c.pem"), Path::new("/nonexistent/k.pem")).is_err());
    }

    #[test]
    fn test_pem_without_certificates() {
        let path = std::env::temp_dir().join(format!("lt-empty-{}.pem", std::process::id()));
        File::create(&path).unwrap().write_all(b"not a pem file\n").unwrap();
        assert!(load_certs(&path).is_err());
        assert!(load_private_key(&path).is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("relay.example.com").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("bad name!").is_err());
    }
}
