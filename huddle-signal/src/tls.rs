//! TLS acceptor built from PEM files on disk.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;

use crate::config::TlsPaths;
use crate::server::ServerError;

/// Load the key and certificate chain and build an acceptor.
pub fn load_acceptor(paths: &TlsPaths) -> Result<TlsAcceptor, ServerError> {
    let certs = load_certs(&paths.cert)?;
    let key = load_key(&paths.key)?;

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(certs, key)?;

    log::debug!("Loaded TLS certificate from {}", paths.cert.display());
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(ServerError::MissingCert(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| ServerError::MissingKey(path.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn pem_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_missing_files_are_io_errors() {
        let paths = TlsPaths {
            key: "/nonexistent/key.pem".into(),
            cert: "/nonexistent/cert.pem".into(),
        };
        assert!(matches!(load_acceptor(&paths), Err(ServerError::Io(_))));
    }

    #[test]
    fn test_cert_file_without_certificates() {
        let cert = pem_file("not a certificate\n");
        let key = pem_file("");
        let paths = TlsPaths { key: key.path().into(), cert: cert.path().into() };
        match load_acceptor(&paths) {
            Err(ServerError::MissingCert(path)) => assert_eq!(path, cert.path()),
            Err(other) => panic!("expected MissingCert, got {other}"),
            Ok(_) => panic!("accepted a file with no certificate"),
        }
    }

    #[test]
    fn test_key_file_without_key() {
        let key = pem_file("-----BEGIN NOTHING-----\n-----END NOTHING-----\n");
        assert!(matches!(load_key(key.path()), Err(ServerError::MissingKey(_))));
    }
}
