//! TLS configuration and certificate loading.
//!
//! # Responsibilities
//! - Load the server chain, private key and client CA bundle (PEM)
//! - Apply the protocol floor and cipher-suite allow-list
//! - Select the client certificate policy
//! - Advertise `h2` over ALPN
//!
//! # Design Decisions
//! - Everything is resolved at startup; a bad file fails `listen`, not a handshake
//! - Cipher suites are matched by their IANA-style names

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ServerConnection, WebPkiClientVerifier};
use rustls::{RootCertStore, ServerConfig, SupportedProtocolVersion};
use tokio_rustls::TlsAcceptor;

use crate::config::schema::{ClientAuth, TlsConfig, TlsVersion};
use crate::net::connection::TlsSession;

/// ALPN identifier for HTTP/2.
pub const ALPN_H2: &[u8] = b"h2";

/// Error building the TLS acceptor.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(String),

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error("client_auth requires root_ca_path")]
    MissingRootCa,

    #[error("none of the configured cipher suites is supported: {0:?}")]
    NoCipherSuites(Vec<String>),

    #[error("invalid TLS settings: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("invalid client CA bundle: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),
}

/// Build a TLS acceptor from configuration.
pub fn build_acceptor(config: &TlsConfig) -> Result<TlsAcceptor, TlsError> {
    Ok(TlsAcceptor::from(Arc::new(build_server_config(config)?)))
}

/// Build the rustls server configuration.
pub fn build_server_config(config: &TlsConfig) -> Result<ServerConfig, TlsError> {
    let provider = Arc::new(crypto_provider(&config.cipher_suites)?);

    let versions: &[&'static SupportedProtocolVersion] = match config.min_version {
        TlsVersion::Tls12 => &[&rustls::version::TLS13, &rustls::version::TLS12],
        TlsVersion::Tls13 => &[&rustls::version::TLS13],
    };
    let builder = ServerConfig::builder_with_provider(Arc::clone(&provider)).with_protocol_versions(versions)?;

    let builder = match config.client_auth {
        ClientAuth::None => builder.with_no_client_auth(),
        policy => {
            let ca_path = config.root_ca_path.as_deref().ok_or(TlsError::MissingRootCa)?;
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca_path)? {
                roots.add(cert)?;
            }
            let mut verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider));
            if policy == ClientAuth::VerifyIfGiven {
                verifier = verifier.allow_unauthenticated();
            }
            builder.with_client_cert_verifier(verifier.build()?)
        }
    };

    let certs = load_certs(&config.cert_path)?;
    let key = load_private_key(&config.key_path)?;
    let mut server_config = builder.with_single_cert(certs, key)?;
    server_config.alpn_protocols = vec![ALPN_H2.to_vec()];

    tracing::info!(
        min_version = ?config.min_version,
        client_auth = ?config.client_auth,
        cipher_suites = provider.cipher_suites.len(),
        "TLS configured"
    );
    Ok(server_config)
}

/// The ring provider, restricted to `allowed` when it is not empty.
fn crypto_provider(allowed: &[String]) -> Result<CryptoProvider, TlsError> {
    let mut provider = ring::default_provider();
    if !allowed.is_empty() {
        provider.cipher_suites.retain(|suite| {
            let name = format!("{:?}", suite.suite());
            allowed.iter().any(|wanted| wanted.eq_ignore_ascii_case(&name))
        });
        if provider.cipher_suites.is_empty() {
            return Err(TlsError::NoCipherSuites(allowed.to_vec()));
        }
    }
    Ok(provider)
}

/// Load every certificate in a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = BufReader::new(open(path)?);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| io_error(path, source))?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.display().to_string()));
    }
    Ok(certs)
}

/// Load the first private key (PKCS#1, PKCS#8 or SEC1) in a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = BufReader::new(open(path)?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| io_error(path, source))?
        .ok_or_else(|| TlsError::NoPrivateKey(path.display().to_string()))
}

/// Describe an established session.
pub fn session_info(connection: &ServerConnection) -> TlsSession {
    TlsSession {
        protocol_version: connection
            .protocol_version()
            .map(|v| format!("{:?}", v))
            .unwrap_or_default(),
        cipher_suite: connection
            .negotiated_cipher_suite()
            .map(|s| format!("{:?}", s.suite()))
            .unwrap_or_default(),
        peer_certificates: Arc::new(
            connection
                .peer_certificates()
                .map(|certs| certs.iter().map(|c| c.clone().into_owned()).collect())
                .unwrap_or_default(),
        ),
    }
}

fn open(path: &Path) -> Result<File, TlsError> {
    File::open(path).map_err(|source| io_error(path, source))
}

fn io_error(path: &Path, source: std::io::Error) -> TlsError {
    TlsError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_identity(dir: &Path) -> TlsConfig {
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        let cert_path = dir.join("server.pem");
        let key_path = dir.join("server.key");
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key.serialize_pem()).unwrap();
        TlsConfig {
            cert_path,
            key_path,
            root_ca_path: None,
            client_auth: ClientAuth::None,
            min_version: TlsVersion::Tls12,
            cipher_suites: Vec::new(),
            handshake_timeout_secs: 10,
        }
    }

    #[test]
    fn builds_with_h2_alpn() {
        let dir = tempfile::tempdir().unwrap();
        let config = build_server_config(&write_identity(dir.path())).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec()]);
    }

    #[test]
    fn cipher_allow_list_is_applied() {
        let provider = crypto_provider(&["TLS13_AES_256_GCM_SHA384".to_string()]).unwrap();
        assert_eq!(provider.cipher_suites.len(), 1);

        let err = crypto_provider(&["TLS_NULL_WITH_NULL_NULL".to_string()]).unwrap_err();
        assert!(matches!(err, TlsError::NoCipherSuites(_)));
    }

    #[test]
    fn tls12_only_suites_with_tls13_floor_fail() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = write_identity(dir.path());
        config.min_version = TlsVersion::Tls13;
        config.cipher_suites = vec!["TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256".to_string()];
        assert!(build_server_config(&config).is_err());
    }

    #[test]
    fn client_auth_without_ca_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = write_identity(dir.path());
        config.client_auth = ClientAuth::Require;
        assert!(matches!(build_server_config(&config), Err(TlsError::MissingRootCa)));
    }

    #[test]
    fn missing_files_name_the_path() {
        let err = load_certs(Path::new("/nonexistent/cert.pem")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/cert.pem"));
    }
}
