//! NfsPvc Operator
//!
//! A Kubernetes operator that exposes NFS exports to namespaces. Each
//! `NfsPvc` resource is materialized as a PersistentVolume / claim pair that
//! the operator keeps bound, reports on and tears down on deletion.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                       kube::runtime Controller                        │
//! │        (NfsPvc events + owned PersistentVolume / Claim events)        │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                       Reconciliation Driver                           │
//! │  ┌──────────────┐  ┌──────────────────────┐  ┌────────────────────┐   │
//! │  │  Finalizer   │─▶│  Storage Synchronizer │─▶│  Status Projector  │   │
//! │  └──────────────┘  └──────────────────────┘  └────────────────────┘   │
//! │                  all writes through conflict retry                    │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                     ClusterStore port                                 │
//! │        ┌────────────────────┐     ┌────────────────────┐             │
//! │        │  KubeStore (API)   │     │  InMemoryStore     │             │
//! │        └────────────────────┘     └────────────────────┘             │
//! └──────────────────────────────────────────────────────────────────────┘
//!
//!   Admission webhook ── NfsPvcValidator ── ClusterStore
//! ```
//!
//! # Modules
//!
//! - [`controller`]: reconciliation engine and controller wiring
//! - [`webhook`]: validating admission webhook
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: object store port
//! - [`store`]: store adapters
//! - [`config`]: operator configuration
//! - [`metrics`]: Prometheus metrics
//! - [`error`]: Error types and handling

pub mod config;
pub mod controller;
pub mod crd;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod store;
pub mod webhook;

// Re-export commonly used types
pub use config::{OperatorConfig, ReclaimPolicy};

pub use controller::{
    CleanupOutcome, ReconcileAction, Reconciler, RetryPolicy, StorageSynchronizer,
};

pub use crd::{NfsPvc, NfsPvcSpec, NfsPvcStatus};

pub use domain::ports::{ClusterStore, ClusterStoreRef};

pub use error::{Error, ErrorAction, Result};

pub use metrics::Metrics;

pub use store::{InMemoryStore, KubeStore};

pub use webhook::{NfsPvcValidator, Rejection, WebhookConfig, WebhookState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
