//! Kubernetes `Endpoints` list and watch.
//!
//! [`EndpointSource`] is the narrow slice of the Kubernetes API the resolver
//! needs: a one-shot read of a service's `Endpoints` object and a change stream
//! starting after that read. [`KubeEndpointSource`] implements it with a
//! [`kube::Client`].
//!
//! # Requirements
//!
//! - The application must have RBAC permissions to get and watch `endpoints`
//! - Kubernetes client configuration (in-cluster or kubeconfig)

use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Endpoints;
use kube::api::WatchParams;
use kube::core::WatchEvent as KubeWatchEvent;
use kube::{Api, Client};

use crate::error::{Error, Result};

/// Server-side timeout for a single watch request, in seconds.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// A change to a watched `Endpoints` object.
#[derive(Clone, Debug)]
pub enum WatchEvent {
    /// The object was created.
    Added(Endpoints),
    /// The object was replaced.
    Modified(Endpoints),
    /// The object was deleted; carries its last known state.
    Deleted(Endpoints),
    /// A progress marker with no object change.
    Bookmark,
}

/// Stream of watch events. Ends when the server closes the watch.
pub type WatchStream = BoxStream<'static, Result<WatchEvent>>;

/// Source of `Endpoints` state for a namespace and service.
///
/// An empty `namespace` selects the source's default namespace.
#[async_trait::async_trait]
pub trait EndpointSource: Send + Sync {
    /// Reads the current `Endpoints` object of `service`.
    ///
    /// # Errors
    ///
    /// Fails if the object cannot be read, including when it does not exist.
    async fn list(&self, namespace: &str, service: &str) -> Result<Endpoints>;

    /// Watches `service` for changes after `resource_version`.
    ///
    /// # Errors
    ///
    /// Fails if the watch cannot be started. Failures after that are
    /// delivered as stream items.
    async fn watch(
        &self,
        namespace: &str,
        service: &str,
        resource_version: &str,
    ) -> Result<WatchStream>;
}

/// [`EndpointSource`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeEndpointSource {
    client: Client,
}

impl KubeEndpointSource {
    /// Creates a source using `client`.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Creates a source from the inferred client configuration
    /// (in-cluster service account or local kubeconfig).
    ///
    /// # Errors
    ///
    /// Fails if no usable Kubernetes configuration is found.
    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    fn api(&self, namespace: &str) -> Api<Endpoints> {
        let namespace = if namespace.is_empty() {
            self.client.default_namespace()
        } else {
            namespace
        };

        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl EndpointSource for KubeEndpointSource {
    async fn list(&self, namespace: &str, service: &str) -> Result<Endpoints> {
        Ok(self.api(namespace).get(service).await?)
    }

    async fn watch(
        &self,
        namespace: &str,
        service: &str,
        resource_version: &str,
    ) -> Result<WatchStream> {
        let stream = self
            .api(namespace)
            .watch(&watch_params(service), resource_version)
            .await?;

        tracing::debug!(
            "Starting Kubernetes endpoints watch for {namespace}/{service} at version {resource_version}"
        );

        Ok(stream
            .map_err(Error::from)
            .and_then(|event| async move { convert_event(event) })
            .boxed())
    }
}

fn watch_params(service: &str) -> WatchParams {
    WatchParams::default()
        .fields(&format!("metadata.name={service}"))
        .timeout(WATCH_TIMEOUT_SECS)
}

fn convert_event(event: KubeWatchEvent<Endpoints>) -> Result<WatchEvent> {
    match event {
        KubeWatchEvent::Added(endpoints) => Ok(WatchEvent::Added(endpoints)),
        KubeWatchEvent::Modified(endpoints) => Ok(WatchEvent::Modified(endpoints)),
        KubeWatchEvent::Deleted(endpoints) => Ok(WatchEvent::Deleted(endpoints)),
        KubeWatchEvent::Bookmark(_) => Ok(WatchEvent::Bookmark),
        KubeWatchEvent::Error(status) => Err(Error::Watch(format!("{status:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_params_select_service_by_name() {
        let params = watch_params("my-service");

        assert_eq!(params.field_selector.as_deref(), Some("metadata.name=my-service"));
        assert_eq!(params.timeout, Some(WATCH_TIMEOUT_SECS));
    }

    #[test]
    fn convert_event_keeps_object() {
        let endpoints = Endpoints::default();

        let got = convert_event(KubeWatchEvent::Modified(endpoints)).unwrap();
        assert!(matches!(got, WatchEvent::Modified(_)));
    }
}
