//! swarm-ca daemon - serves the cluster certificate authority

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use swarm_ca::model::{Cluster, ClusterRootCa, JoinTokens};
use swarm_ca::pki::{self, RootCa};
use swarm_ca::pki::external::ExternalCa;
use swarm_ca::proto::ca_server::CaServer as CaGrpcServer;
use swarm_ca::proto::node_ca_server::NodeCaServer as NodeCaGrpcServer;
use swarm_ca::security::SecurityConfig;
use swarm_ca::server::{root_ca_cert_path, CaServer, CaService};
use swarm_ca::store::MemoryStore;

/// Certificate authority control plane for the Swarm cluster orchestrator
#[derive(Parser, Debug)]
#[command(name = "swarm-ca", version, about, long_about = None)]
struct Cli {
    /// gRPC listen address
    #[arg(long, default_value = "0.0.0.0:4242")]
    listen_addr: SocketAddr,

    /// State directory (trust root and CA key material)
    #[arg(long, default_value = "./swarm-ca-state")]
    state_dir: PathBuf,

    /// Root rotation reconciliation interval in seconds
    #[arg(long, default_value = "3")]
    reconciliation_interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    tokio::fs::create_dir_all(&cli.state_dir).await?;
    let root_ca = load_or_generate_root_ca(&cli.state_dir).await?;

    // The cluster ID doubles as the certificate organization.
    let organization = pki::generate_id();

    let store = MemoryStore::new();
    store
        .update(|tx| {
            tx.create_cluster(Cluster {
                id: organization.clone(),
                root_ca: ClusterRootCa {
                    ca_cert: root_ca.certs_pem().to_string(),
                    ca_key: root_ca
                        .signer()
                        .map(|s| s.key_pem().to_string())
                        .unwrap_or_default(),
                    ca_cert_hash: pki::ca_cert_hash(root_ca.certs_pem()),
                    join_tokens: JoinTokens {
                        worker: root_ca.generate_join_token(),
                        manager: root_ca.generate_join_token(),
                    },
                    root_rotation: None,
                },
                ..Default::default()
            })
        })
        .await?;

    let cluster = store
        .view(|tx| tx.get_cluster())
        .await
        .ok_or_else(|| anyhow::anyhow!("cluster missing after creation"))?;
    tracing::info!(
        worker_token = %cluster.root_ca.join_tokens.worker,
        manager_token = %cluster.root_ca.join_tokens.manager,
        "cluster initialized"
    );

    let security = Arc::new(SecurityConfig::new(
        organization,
        root_ca,
        ExternalCa::empty(),
    ));

    let server = CaServer::new(
        store,
        security,
        root_ca_cert_path(&cli.state_dir),
    );
    server.set_root_reconciliation_interval(Duration::from_secs(
        cli.reconciliation_interval_secs,
    ));

    let run_handle = tokio::spawn(server.clone().run());
    server.ready().await;

    let service = CaService::new(server.clone());
    tracing::info!(addr = %cli.listen_addr, "CA server listening");

    tonic::transport::Server::builder()
        .add_service(CaGrpcServer::new(service.clone()))
        .add_service(NodeCaGrpcServer::new(service))
        .serve_with_shutdown(cli.listen_addr, async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    server.stop().await;
    run_handle.abort();
    Ok(())
}

/// Load the persisted root CA, or generate and persist a fresh one on
/// first start.
async fn load_or_generate_root_ca(state_dir: &std::path::Path) -> anyhow::Result<RootCa> {
    let cert_path = root_ca_cert_path(state_dir);
    let key_path = cert_path.with_extension("key");

    if cert_path.exists() && key_path.exists() {
        let cert_pem = tokio::fs::read_to_string(&cert_path).await?;
        let key_pem = tokio::fs::read_to_string(&key_path).await?;
        tracing::info!(path = %cert_path.display(), "loaded existing root CA");
        return Ok(RootCa::new(&cert_pem, Some((&cert_pem, &key_pem)), "")?);
    }

    let root_ca = RootCa::generate("swarm-ca")?;
    if let Some(parent) = cert_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&cert_path, root_ca.certs_pem()).await?;
    tokio::fs::write(&key_path, root_ca.signer()?.key_pem()).await?;
    tracing::info!(path = %cert_path.display(), "generated new root CA");
    Ok(root_ca)
}
