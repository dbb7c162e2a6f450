//! Prints the address lists resolved for a Kubernetes service.
//!
//! # Running in Kubernetes
//!
//! The demo expects to run inside a Kubernetes cluster (or with a local
//! kubeconfig) with permission to get and watch `endpoints`.
//!
//! # Environment Variables
//!
//! - `TARGET`: resolver target (default: `kubernetes:///kube-dns.kube-system:53`)
//! - `WATCH_SECONDS`: how long to watch before exiting (default: 60)

use std::env;
use std::sync::Arc;
use std::time::Duration;

use prometheus::{Encoder, TextEncoder};
use tonic_k8s_resolver::{
    Address, BoxError, BuildOptions, Builder, ClientConn, Error, Resolver, ResolverBuilder,
};
use tracing::{Level, info, warn};

struct PrintConn;

#[async_trait::async_trait]
impl ClientConn for PrintConn {
    async fn update_addresses(&self, addresses: Vec<Address>) -> Result<(), BoxError> {
        info!("{} addresses", addresses.len());
        for (i, a) in addresses.iter().enumerate() {
            info!(
                "{i}: {} (server name {}, target {:?})",
                a.addr, a.server_name, a.target_name
            );
        }
        Ok(())
    }

    fn report_error(&self, error: &Error) {
        warn!("resolver error: {error}");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .init();

    let target =
        env::var("TARGET").unwrap_or_else(|_| "kubernetes:///kube-dns.kube-system:53".to_string());
    let watch_seconds: u64 = env::var("WATCH_SECONDS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(60);

    let builder = Builder::in_cluster().await?;
    let resolver = builder.build(&target, Arc::new(PrintConn), BuildOptions::default())?;

    info!("watching {}", resolver.target());

    tokio::time::sleep(Duration::from_secs(watch_seconds / 2)).await;
    resolver.resolve_now();
    tokio::time::sleep(Duration::from_secs(watch_seconds - watch_seconds / 2)).await;

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
    println!("{}", String::from_utf8_lossy(&buffer));

    resolver.shutdown().await;
    Ok(())
}
