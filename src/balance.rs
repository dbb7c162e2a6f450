//! Feeds resolved addresses to a tonic balance channel.
//!
//! Tonic's [`Channel::balance_channel`](tonic::transport::Channel::balance_channel)
//! takes incremental `Change::Insert` / `Change::Remove` events, while resolvers
//! publish whole address lists. [`BalanceConn`] translates between the two.
//!
//! # Example
//!
//! ```ignore
//! use std::net::SocketAddr;
//! use std::time::Duration;
//! use tonic::transport::{Channel, Endpoint};
//! use tonic_k8s_resolver::discover;
//!
//! // Create your own balance channel
//! let (channel, tx) = Channel::balance_channel::<SocketAddr>(1024);
//!
//! // Start resolving - build function returns Endpoint for each address
//! let resolver = discover("kubernetes:///my-grpc-service.my-namespace:grpc", tx, |addr| {
//!     Endpoint::from_shared(format!("http://{addr}"))
//!         .unwrap()
//!         .connect_timeout(Duration::from_secs(5))
//! })
//! .await?;
//!
//! // Use the channel with your gRPC client
//! let client = MyServiceClient::new(channel);
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::sync::mpsc::Sender;
use tonic::transport::Endpoint;
use tonic::transport::channel::Change;

use crate::addresses::Address;
use crate::builder::{BuildOptions, Builder, ResolverBuilder};
use crate::error::{BoxError, Error, Result};
use crate::resolver::{ClientConn, KubeResolver};

/// [`ClientConn`] that drives a tonic balance channel.
pub struct BalanceConn<F> {
    tx: Sender<Change<SocketAddr, Endpoint>>,
    build: F,
    known: Mutex<HashSet<SocketAddr>>,
}

impl<F> BalanceConn<F>
where
    F: Fn(SocketAddr) -> Endpoint + Send + Sync,
{
    /// Creates a connection sending changes to `tx`, building each new
    /// endpoint with `build`.
    #[must_use]
    pub fn new(tx: Sender<Change<SocketAddr, Endpoint>>, build: F) -> Self {
        Self {
            tx,
            build,
            known: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait::async_trait]
impl<F> ClientConn for BalanceConn<F>
where
    F: Fn(SocketAddr) -> Endpoint + Send + Sync,
{
    async fn update_addresses(&self, addresses: Vec<Address>) -> std::result::Result<(), BoxError> {
        let mut known = self.known.lock().await;
        let current: HashSet<SocketAddr> = addresses.iter().map(|a| a.addr).collect();

        // known only tracks changes the channel has accepted
        for action in diff_endpoints(&known, &current) {
            let change = match action {
                EndpointAction::Insert(addr) => Change::Insert(addr, (self.build)(addr)),
                EndpointAction::Remove(addr) => Change::Remove(addr),
            };

            if self.tx.send(change).await.is_err() {
                tracing::warn!("balance channel closed, dropping endpoint changes");
                return Err(Error::ChannelClosed.into());
            }

            match action {
                EndpointAction::Insert(addr) => known.insert(addr),
                EndpointAction::Remove(addr) => known.remove(&addr),
            };
        }

        tracing::debug!("balance channel: {} endpoints", known.len());
        Ok(())
    }

    fn report_error(&self, error: &Error) {
        tracing::warn!("Kubernetes resolver error: {error}");
    }
}

/// Starts resolving `target` against the Kubernetes API and feeds the
/// results to a balance channel sender.
///
/// The watch runs until the returned resolver is closed or dropped.
///
/// # Errors
///
/// Fails if no Kubernetes configuration is found or `target` is invalid.
pub async fn discover<F>(
    target: &str,
    tx: Sender<Change<SocketAddr, Endpoint>>,
    build: F,
) -> Result<KubeResolver>
where
    F: Fn(SocketAddr) -> Endpoint + Send + Sync + 'static,
{
    let builder = Builder::in_cluster().await?;
    builder.build(target, Arc::new(BalanceConn::new(tx, build)), BuildOptions::default())
}

/// Represents an endpoint change action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndpointAction {
    Insert(SocketAddr),
    Remove(SocketAddr),
}

/// Returns the changes that bring `known` in line with `current`, removals first.
fn diff_endpoints(
    known: &HashSet<SocketAddr>,
    current: &HashSet<SocketAddr>,
) -> Vec<EndpointAction> {
    let removed = known.difference(current).map(|addr| {
        tracing::debug!("removing endpoint: {addr}");
        EndpointAction::Remove(*addr)
    });

    let added = current.difference(known).map(|addr| {
        tracing::debug!("adding endpoint: {addr}");
        EndpointAction::Insert(*addr)
    });

    removed.chain(added).collect()
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    fn set(addrs: &[&str]) -> HashSet<SocketAddr> {
        addrs.iter().map(|a| a.parse().unwrap()).collect()
    }

    fn address(addr: &str) -> Address {
        Address {
            addr: addr.parse().unwrap(),
            server_name: "svc.ns".to_string(),
            target_name: None,
        }
    }

    fn endpoint(addr: SocketAddr) -> Endpoint {
        Endpoint::from_shared(format!("http://{addr}")).unwrap()
    }

    // diff_endpoints tests

    #[test]
    fn diff_inserts_new_endpoints() {
        let known = HashSet::new();
        let actions = diff_endpoints(&known, &set(&["10.0.0.1:50051", "10.0.0.2:50051"]));

        assert_eq!(actions.len(), 2);
        assert!(actions.contains(&EndpointAction::Insert("10.0.0.1:50051".parse().unwrap())));
        assert!(actions.contains(&EndpointAction::Insert("10.0.0.2:50051".parse().unwrap())));
        assert!(known.is_empty());
    }

    #[test]
    fn diff_skips_known_endpoints() {
        let known = set(&["10.0.0.1:50051"]);
        let actions = diff_endpoints(&known, &set(&["10.0.0.1:50051", "10.0.0.2:50051"]));

        // Only 10.0.0.2 should be inserted since 10.0.0.1 is already known
        assert_eq!(
            actions,
            vec![EndpointAction::Insert("10.0.0.2:50051".parse().unwrap())]
        );
    }

    #[test]
    fn diff_removes_missing_endpoints() {
        let known = set(&["10.0.0.1:50051", "10.0.0.2:50051"]);
        let actions = diff_endpoints(&known, &set(&["10.0.0.2:50051"]));

        assert_eq!(
            actions,
            vec![EndpointAction::Remove("10.0.0.1:50051".parse().unwrap())]
        );
    }

    #[test]
    fn diff_empty_list_removes_everything() {
        let known = set(&["10.0.0.1:50051", "10.0.0.2:50051"]);
        let actions = diff_endpoints(&known, &HashSet::new());

        assert_eq!(actions.len(), 2);
        assert!(
            actions
                .iter()
                .all(|a| matches!(a, EndpointAction::Remove(_)))
        );
    }

    // BalanceConn tests

    #[tokio::test]
    async fn balance_conn_sends_changes() {
        let (tx, mut rx) = mpsc::channel(16);
        let conn = BalanceConn::new(tx, endpoint);

        conn.update_addresses(vec![address("10.0.0.1:9000"), address("10.0.0.2:9000")])
            .await
            .unwrap();
        conn.update_addresses(vec![address("10.0.0.2:9000")])
            .await
            .unwrap();

        let mut inserted = Vec::new();
        for _ in 0..2 {
            match rx.recv().await.unwrap() {
                Change::Insert(addr, _) => inserted.push(addr.to_string()),
                Change::Remove(addr) => panic!("unexpected removal of {addr}"),
            }
        }
        inserted.sort();
        assert_eq!(inserted, vec!["10.0.0.1:9000", "10.0.0.2:9000"]);

        match rx.recv().await.unwrap() {
            Change::Remove(addr) => assert_eq!(addr.to_string(), "10.0.0.1:9000"),
            Change::Insert(addr, _) => panic!("unexpected insertion of {addr}"),
        }
    }

    #[tokio::test]
    async fn balance_conn_fails_when_channel_closed() {
        let (tx, rx) = mpsc::channel(16);
        drop(rx);
        let conn = BalanceConn::new(tx, endpoint);

        let err = conn
            .update_addresses(vec![address("10.0.0.1:9000")])
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "balance channel closed");
        assert!(conn.known.lock().await.is_empty());
    }

    #[tokio::test]
    async fn balance_conn_keeps_only_delivered_changes() {
        let (tx, mut rx) = mpsc::channel(4);
        let conn = BalanceConn::new(tx, endpoint);

        conn.update_addresses(vec![address("10.0.0.1:9000")])
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(Change::Insert(..))));

        rx.close();
        let result = conn
            .update_addresses(vec![address("10.0.0.2:9000")])
            .await;

        assert!(result.is_err());
        assert_eq!(*conn.known.lock().await, set(&["10.0.0.1:9000"]));
    }
}
