#![deny(missing_docs)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Kubernetes name resolution for [Tonic](https://docs.rs/tonic) gRPC clients.
//!
//! A resolver turns a target such as `kubernetes:///my-service.my-namespace:grpc`
//! into the live list of ready pod addresses backing the service, and keeps the
//! list current by watching the service's `Endpoints` object.
//!
//! # Features
//!
//! - **Target parsing**: `namespace/service`, `service.namespace` and fully
//!   qualified `service.namespace.svc.cluster.local` forms, with numeric,
//!   named or implicit ports
//! - **Watch-driven updates**: address lists are pushed only when they change
//! - **Self-healing**: watches restart with bounded exponential backoff and
//!   panics inside a session are contained and logged
//! - **Observability**: a Prometheus gauge with the time of the last update
//!
//! # Usage
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
//! let resolver = discover("kubernetes:///my-grpc-service.my-namespace:50051", tx, |addr| {
//!     Endpoint::from_shared(format!("http://{addr}"))
//!         .unwrap()
//!         .connect_timeout(Duration::from_secs(5))
//! })
//! .await?;
//!
//! // Use with your generated gRPC client
//! // let client = MyServiceClient::new(channel);
//! ```
//!
//! Other connection types plug in through [`ClientConn`] and
//! [`Builder`]; other endpoint backends through [`EndpointSource`].

mod addresses;
mod balance;
mod builder;
mod config;
mod error;
mod k8s;
mod logger;
mod metrics;
mod resolver;
mod retry;
mod target;

pub use addresses::{Address, make_addresses};
pub use balance::{BalanceConn, discover};
pub use builder::{BuildOptions, Builder, DEFAULT_SCHEME, ResolverBuilder};
pub use config::ResolverConfig;
pub use error::{BoxError, Error, Result};
pub use k8s::{EndpointSource, KubeEndpointSource, WatchEvent, WatchStream};
pub use logger::{Logger, SharedLogger, TracingLogger};
pub use metrics::ResolverMetrics;
pub use resolver::{ClientConn, KubeResolver, Resolver};
pub use retry::{Crash, contain, until};
pub use target::{Port, TargetInfo, parse_target};
