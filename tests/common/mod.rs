//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tempfile::TempDir;

use rpc_server::client::RpcClient;
use rpc_server::config::{ClientAuth, TlsConfig, TlsVersion};
use rpc_server::dispatch::RoutingTableBuilder;
use rpc_server::net::tls::ALPN_H2;
use rpc_server::{RpcServer, ServerConfig, ServerHandle};

pub type TestError = Box<dyn std::error::Error + Send + Sync>;

/// Cleartext config on an ephemeral port.
pub fn config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.shutdown.grace_period_secs = 5;
    config
}

pub async fn start(config: ServerConfig, routes: RoutingTableBuilder) -> ServerHandle {
    RpcServer::new(config).routes(routes).listen().await.unwrap()
}

pub async fn connect(handle: &ServerHandle) -> RpcClient {
    RpcClient::connect(handle.local_addr()).await.unwrap()
}

/// Await `future`, failing the test if it takes longer than `secs`.
pub async fn within<F: std::future::Future>(secs: u64, future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(secs), future)
        .await
        .expect("timed out")
}

/// A throwaway CA with a server certificate for `localhost` and one client certificate.
pub struct TestPki {
    pub dir: TempDir,
    pub ca_path: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    ca_der: CertificateDer<'static>,
    client_cert_der: CertificateDer<'static>,
    client_key_der: Vec<u8>,
}

impl TestPki {
    pub fn generate() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.distinguished_name.push(DnType::CommonName, "rpc-server test CA");
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let server_key = KeyPair::generate().unwrap();
        let server = leaf(&["localhost"], ExtendedKeyUsagePurpose::ServerAuth, &server_key, &ca, &ca_key);

        let client_key = KeyPair::generate().unwrap();
        let client = leaf(&["client.test"], ExtendedKeyUsagePurpose::ClientAuth, &client_key, &ca, &ca_key);

        let dir = tempfile::tempdir().unwrap();
        let ca_path = dir.path().join("ca.pem");
        let cert_path = dir.path().join("server.pem");
        let key_path = dir.path().join("server.key");
        std::fs::write(&ca_path, ca.pem()).unwrap();
        std::fs::write(&cert_path, server.pem()).unwrap();
        std::fs::write(&key_path, server_key.serialize_pem()).unwrap();

        Self {
            dir,
            ca_path,
            cert_path,
            key_path,
            ca_der: ca.der().clone(),
            client_cert_der: client.der().clone(),
            client_key_der: client_key.serialize_der(),
        }
    }

    pub fn tls_config(&self, client_auth: ClientAuth) -> TlsConfig {
        TlsConfig {
            cert_path: self.cert_path.clone(),
            key_path: self.key_path.clone(),
            root_ca_path: Some(self.ca_path.clone()),
            client_auth,
            min_version: TlsVersion::Tls12,
            cipher_suites: Vec::new(),
            handshake_timeout_secs: 5,
        }
    }

    fn client_config(&self, with_client_cert: bool, versions: &[&'static rustls::SupportedProtocolVersion]) -> rustls::ClientConfig {
        let mut roots = rustls::RootCertStore::empty();
        roots.add(self.ca_der.clone()).unwrap();
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = rustls::ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(versions)
            .unwrap()
            .with_root_certificates(roots);
        let mut config = if with_client_cert {
            let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.client_key_der.clone()));
            builder
                .with_client_auth_cert(vec![self.client_cert_der.clone()], key)
                .unwrap()
        } else {
            builder.with_no_client_auth()
        };
        config.alpn_protocols = vec![ALPN_H2.to_vec()];
        config
    }

    /// Connect over TLS and run the HTTP/2 handshake.
    pub async fn connect(&self, addr: SocketAddr, with_client_cert: bool) -> Result<RpcClient, TestError> {
        self.connect_with(addr, with_client_cert, rustls::DEFAULT_VERSIONS).await
    }

    pub async fn connect_with(
        &self,
        addr: SocketAddr,
        with_client_cert: bool,
        versions: &[&'static rustls::SupportedProtocolVersion],
    ) -> Result<RpcClient, TestError> {
        let config = self.client_config(with_client_cert, versions);
        let stream = tokio::net::TcpStream::connect(addr).await?;
        let tls = tokio_rustls::TlsConnector::from(Arc::new(config))
            .connect(ServerName::try_from("localhost")?, stream)
            .await?;
        Ok(RpcClient::handshake(tls, "localhost").await?)
    }
}

fn leaf(names: &[&str], usage: ExtendedKeyUsagePurpose, key: &KeyPair, ca: &Certificate, ca_key: &KeyPair) -> Certificate {
    let mut params = CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>()).unwrap();
    params.distinguished_name.push(DnType::CommonName, names[0]);
    params.extended_key_usages = vec![usage];
    params.signed_by(key, ca, ca_key).unwrap()
}
