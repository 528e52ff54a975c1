//! Reconciliation driver
//!
//! Entry point for one pass over an NfsPvc. Sequences the finalizer
//! protocol, the storage synchronizer and the status projector, and turns
//! their outcomes into scheduling decisions for the host controller.

use super::finalizer::{self, CleanupOutcome};
use super::retry::RetryPolicy;
use super::status;
use super::storage::StorageSynchronizer;
use crate::config::OperatorConfig;
use crate::crd::NfsPvc;
use crate::domain::ClusterStoreRef;
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Delay before re-checking a terminating NfsPvc whose storage is still being removed
pub const CLEANUP_REQUEUE: Duration = Duration::from_secs(4);

/// Scheduling decision returned by a successful pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Nothing left to do until the next change event
    Done,
    /// Run again after the given delay
    Requeue(Duration),
}

/// Drives NfsPvc reconciliation against a [`crate::domain::ClusterStore`]
pub struct Reconciler {
    store: ClusterStoreRef,
    synchronizer: StorageSynchronizer,
    retry: RetryPolicy,
}

impl Reconciler {
    /// Create a reconciler with the default conflict retry policy
    pub fn new(store: ClusterStoreRef, config: Arc<OperatorConfig>) -> Self {
        Self::with_retry_policy(store, config, RetryPolicy::default())
    }

    /// Create a reconciler with a custom conflict retry policy
    pub fn with_retry_policy(
        store: ClusterStoreRef,
        config: Arc<OperatorConfig>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            synchronizer: StorageSynchronizer::new(store.clone(), config, retry.clone()),
            store,
            retry,
        }
    }

    /// Reconcile the NfsPvc `(name, namespace)`.
    ///
    /// On failure the resource is marked with an `Error` condition before the
    /// error is returned.
    #[instrument(skip(self))]
    pub async fn reconcile(&self, name: &str, namespace: &str) -> Result<ReconcileAction> {
        match self.reconcile_inner(name, namespace).await {
            Ok(action) => Ok(action),
            Err(err) => {
                warn!(error = %err, "Reconciliation failed");
                if let Err(mark_err) =
                    status::mark_error(self.store.as_ref(), &self.retry, name, namespace, &err).await
                {
                    warn!(error = %mark_err, "Could not record error condition");
                }
                Err(err)
            }
        }
    }

    async fn reconcile_inner(&self, name: &str, namespace: &str) -> Result<ReconcileAction> {
        let Some(nfspvc) = self.store.get_nfs_pvc(name, namespace).await? else {
            debug!("NfsPvc no longer exists");
            return Ok(ReconcileAction::Done);
        };

        if nfspvc.is_deleting() {
            return self.cleanup(&nfspvc).await;
        }

        if !finalizer::ensure(self.store.as_ref(), &self.retry, &nfspvc).await? {
            debug!("NfsPvc deleted before the finalizer was in place");
            return Ok(ReconcileAction::Done);
        }
        self.synchronizer.sync(&nfspvc).await?;
        status::project(self.store.as_ref(), &self.retry, &nfspvc).await?;

        Ok(ReconcileAction::Done)
    }

    async fn cleanup(&self, nfspvc: &NfsPvc) -> Result<ReconcileAction> {
        match finalizer::handle_delete(self.store.as_ref(), &self.retry, nfspvc).await? {
            CleanupOutcome::Released => {
                info!("NfsPvc released");
                Ok(ReconcileAction::Done)
            }
            outcome => {
                debug!(?outcome, "Cleanup pending");
                Ok(ReconcileAction::Requeue(CLEANUP_REQUEUE))
            }
        }
    }
}
