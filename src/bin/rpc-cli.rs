use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use rustls::pki_types::ServerName;
use serde_json::json;

use rpc_server::client::{CallOptions, RpcClient};
use rpc_server::health::proto;
use rpc_server::net::tls::{load_certs, ALPN_H2};

#[derive(Parser)]
#[command(name = "rpc-cli")]
#[command(about = "Health and echo client for the RPC server", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "127.0.0.1:9001")]
    addr: SocketAddr,

    /// CA bundle; enables TLS.
    #[arg(long)]
    ca: Option<PathBuf>,

    /// Name to verify the server certificate against.
    #[arg(long, default_value = "localhost")]
    server_name: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Query serving status once ("" is the whole server)
    Check {
        #[arg(default_value = "")]
        service: String,
    },
    /// Stream serving status changes until interrupted
    Watch {
        #[arg(default_value = "")]
        service: String,
    },
    /// Call service.Echo/Ping
    Ping {
        #[arg(default_value = "ping")]
        message: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = connect(&cli).await?;
    let options = CallOptions::default();

    match cli.command {
        Commands::Check { service } => {
            let response = client
                .unary_with("/grpc.health.v1.Health/Check", proto::encode_request(&service), &options)
                .await?;
            let status = proto::decode_response(&response)?;
            print(json!({ "service": service, "status": status }))?;
        }
        Commands::Watch { service } => {
            let mut stream = client
                .server_streaming("/grpc.health.v1.Health/Watch", proto::encode_request(&service), &options)
                .await?;
            while let Some(message) = stream.message().await? {
                let status = proto::decode_response(&message)?;
                print(json!({ "service": service, "status": status }))?;
            }
        }
        Commands::Ping { message } => {
            let response = client.unary_with("/service.Echo/Ping", message, &options).await?;
            print(json!({ "echo": String::from_utf8_lossy(&response) }))?;
        }
    }

    Ok(())
}

async fn connect(cli: &Cli) -> Result<RpcClient, Box<dyn std::error::Error>> {
    let Some(ca) = &cli.ca else {
        return Ok(RpcClient::connect(cli.addr).await?);
    };

    let mut roots = rustls::RootCertStore::empty();
    for cert in load_certs(ca)? {
        roots.add(cert)?;
    }
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![ALPN_H2.to_vec()];

    let stream = tokio::net::TcpStream::connect(cli.addr).await?;
    let server_name = ServerName::try_from(cli.server_name.clone())?;
    let tls = tokio_rustls::TlsConnector::from(Arc::new(config))
        .connect(server_name, stream)
        .await?;
    Ok(RpcClient::handshake(tls, cli.server_name.clone()).await?)
}

fn print(value: serde_json::Value) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
