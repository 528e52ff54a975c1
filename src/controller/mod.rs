//! NfsPvc controller
//!
//! - `retry`: optimistic conflict retry shared by all writers
//! - `finalizer`: deletion gate for NfsPvc resources
//! - `storage`: PersistentVolume / PersistentVolumeClaim synchronizer
//! - `status`: status projection and error conditions
//! - `reconciler`: per-resource reconciliation driver
//!
//! [`run`] wires the driver into a `kube::runtime::Controller` that is
//! triggered by NfsPvc changes and by changes to the claims and volumes it
//! owns.

pub mod finalizer;
pub mod reconciler;
pub mod retry;
pub mod status;
pub mod storage;

pub use finalizer::CleanupOutcome;
pub use reconciler::{ReconcileAction, Reconciler, CLEANUP_REQUEUE};
pub use retry::{update_with_retry, RetryPolicy};
pub use storage::StorageSynchronizer;

use crate::config::OperatorConfig;
use crate::crd::{volume_name, NfsPvc, OWNER_LABEL, OWNER_NAMESPACE_LABEL};
use crate::domain::ClusterStoreRef;
use crate::error::{Error, ErrorAction, Result};
use crate::metrics::Metrics;
use crate::store::KubeStore;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::api::{Api, ListParams};
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{watcher, Controller};
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Requeue delay applied to errors without a specific delay
pub const ERROR_REQUEUE: Duration = Duration::from_secs(15);

/// Shared state handed to every reconciliation
pub struct Context {
    pub reconciler: Reconciler,
    pub metrics: Arc<Metrics>,
}

// =============================================================================
// Event Mapping
// =============================================================================

/// Map a claim event to its owning NfsPvc; the claim shares the owner's identity
pub fn claim_owner(claim: PersistentVolumeClaim) -> Option<ObjectRef<NfsPvc>> {
    let name = claim.name_any();
    let namespace = claim.namespace()?;
    let labels = claim.labels();
    if labels.get(OWNER_LABEL) != Some(&name) || labels.get(OWNER_NAMESPACE_LABEL) != Some(&namespace) {
        return None;
    }
    Some(ObjectRef::new(&name).within(&namespace))
}

/// Map a volume event to its owning NfsPvc.
///
/// The owner is read from the claim reference, falling back to the owner
/// labels, and only accepted when it derives the volume's own name.
pub fn volume_owner(volume: PersistentVolume) -> Option<ObjectRef<NfsPvc>> {
    let from_claim_ref = volume
        .spec
        .as_ref()
        .and_then(|s| s.claim_ref.as_ref())
        .and_then(|r| Some((r.name.clone()?, r.namespace.clone()?)));
    let from_labels = || {
        let labels = volume.labels();
        Some((
            labels.get(OWNER_LABEL)?.clone(),
            labels.get(OWNER_NAMESPACE_LABEL)?.clone(),
        ))
    };

    let (name, namespace) = from_claim_ref.or_else(from_labels)?;
    if volume_name(&name, &namespace) != volume.name_any() {
        return None;
    }
    Some(ObjectRef::new(&name).within(&namespace))
}

// =============================================================================
// Controller Callbacks
// =============================================================================

async fn reconcile(nfspvc: Arc<NfsPvc>, ctx: Arc<Context>) -> Result<Action> {
    let name = nfspvc.name_any();
    let namespace = nfspvc.namespace_or_err()?;

    ctx.metrics.reconciliations.inc();
    let timer = ctx.metrics.reconcile_duration.start_timer();
    let result = ctx.reconciler.reconcile(&name, &namespace).await;
    timer.observe_duration();

    match result? {
        ReconcileAction::Done => Ok(Action::await_change()),
        ReconcileAction::Requeue(delay) => {
            ctx.metrics.cleanup_requeues.inc();
            Ok(Action::requeue(delay))
        }
    }
}

fn error_policy(nfspvc: Arc<NfsPvc>, err: &Error, ctx: Arc<Context>) -> Action {
    ctx.metrics.reconcile_failures.inc();
    warn!(
        name = %nfspvc.name_any(),
        namespace = ?nfspvc.namespace(),
        error = %err,
        "Reconcile error"
    );

    match err.action() {
        ErrorAction::RequeueWithBackoff => Action::requeue(ERROR_REQUEUE),
        ErrorAction::RequeueAfter(delay) => Action::requeue(delay),
        ErrorAction::NoRequeue => Action::await_change(),
    }
}

// =============================================================================
// Runner
// =============================================================================

/// Run the NfsPvc controller until a shutdown signal is received
pub async fn run(client: Client, config: Arc<OperatorConfig>, metrics: Arc<Metrics>) -> Result<()> {
    let nfspvcs = Api::<NfsPvc>::all(client.clone());
    let claims = Api::<PersistentVolumeClaim>::all(client.clone());
    let volumes = Api::<PersistentVolume>::all(client.clone());

    if let Err(e) = nfspvcs.list(&ListParams::default().limit(1)).await {
        error!("NfsPvc CRD is not queryable; is it installed? ({})", e);
        return Err(Error::Configuration(format!(
            "NfsPvc CRD not available: {}",
            e
        )));
    }

    let store: ClusterStoreRef = Arc::new(KubeStore::new(client));
    let ctx = Arc::new(Context {
        reconciler: Reconciler::new(store, config),
        metrics,
    });

    info!("Starting NfsPvc controller");
    let owned = watcher::Config::default().labels(OWNER_LABEL);

    Controller::new(nfspvcs, watcher::Config::default())
        .watches(claims, owned.clone(), claim_owner)
        .watches(volumes, owned, volume_owner)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!(name = %obj.name, namespace = ?obj.namespace, "Reconciled"),
                Err(e) => debug!(error = %e, "Controller event error"),
            }
        })
        .await;

    info!("NfsPvc controller stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::storage::{build_claim, build_volume};
    use crate::crd::NfsPvcSpec;

    fn request() -> NfsPvc {
        let mut obj = NfsPvc::new(
            "data",
            NfsPvcSpec {
                server: "nfs1".into(),
                path: "/export".into(),
                ..Default::default()
            },
        );
        obj.metadata.namespace = Some("team-a".into());
        obj
    }

    fn config() -> OperatorConfig {
        OperatorConfig::new("nfs", "Delete").unwrap()
    }

    #[test]
    fn test_claim_owner() {
        let claim = build_claim(&request(), &config()).unwrap();
        assert_eq!(
            claim_owner(claim.clone()),
            Some(ObjectRef::new("data").within("team-a"))
        );

        let mut unrelated = claim;
        unrelated.metadata.name = Some("other".into());
        assert_eq!(claim_owner(unrelated), None);
    }

    #[test]
    fn test_volume_owner() {
        let volume = build_volume(&request(), &config()).unwrap();
        assert_eq!(
            volume_owner(volume.clone()),
            Some(ObjectRef::new("data").within("team-a"))
        );

        let mut unlabelled_ref = volume.clone();
        unlabelled_ref.spec.as_mut().unwrap().claim_ref = None;
        assert_eq!(
            volume_owner(unlabelled_ref),
            Some(ObjectRef::new("data").within("team-a"))
        );

        let mut foreign = volume;
        foreign.metadata.name = Some("someone-elses-pv".into());
        assert_eq!(volume_owner(foreign), None);
    }
}
