//! Storage State Synchronizer
//!
//! Creates the PersistentVolume / PersistentVolumeClaim pair backing an
//! NfsPvc and repairs bindings the volume binder can no longer resolve on
//! its own:
//!
//! - a volume whose claim reference points at a claim that is gone or was
//!   recreated gets its reference rewritten to the current claim
//! - a `Lost` claim still marked `bind-completed` has that marker cleared so
//!   the binder evaluates it again

use super::retry::{update_with_retry, RetryPolicy};
use crate::config::OperatorConfig;
use crate::crd::{NfsPvc, CLAIM_KIND, OWNER_LABEL, OWNER_NAMESPACE_LABEL, VOLUME_KIND};
use crate::domain::ClusterStoreRef;
use crate::error::Result;
use k8s_openapi::api::core::v1::{
    NFSVolumeSource, ObjectReference, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Annotation the binder sets once it considers a claim fully bound
pub const BIND_COMPLETED_ANNOTATION: &str = "pv.kubernetes.io/bind-completed";

const PHASE_BOUND: &str = "Bound";
const PHASE_PENDING: &str = "Pending";
const PHASE_RELEASED: &str = "Released";
const PHASE_FAILED: &str = "Failed";
const PHASE_LOST: &str = "Lost";

// =============================================================================
// Object Builders
// =============================================================================

fn owner_labels(name: &str, namespace: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (OWNER_LABEL.to_string(), name.to_string()),
        (OWNER_NAMESPACE_LABEL.to_string(), namespace.to_string()),
    ])
}

fn quantities(capacity: &BTreeMap<String, String>) -> BTreeMap<String, Quantity> {
    capacity
        .iter()
        .map(|(resource, amount)| (resource.clone(), Quantity(amount.clone())))
        .collect()
}

/// Claim reference pre-binding a volume to the claim `(name, namespace)`
pub fn claim_reference(name: &str, namespace: &str) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".into()),
        kind: Some(CLAIM_KIND.into()),
        name: Some(name.into()),
        namespace: Some(namespace.into()),
        ..Default::default()
    }
}

/// Build the PersistentVolume exposing the NfsPvc's export
pub fn build_volume(nfspvc: &NfsPvc, config: &OperatorConfig) -> Result<PersistentVolume> {
    let name = nfspvc.name_any();
    let namespace = nfspvc.namespace_or_err()?;

    Ok(PersistentVolume {
        metadata: ObjectMeta {
            name: Some(nfspvc.volume_name()?),
            labels: Some(owner_labels(&name, &namespace)),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            storage_class_name: Some(config.storage_class.clone()),
            capacity: Some(quantities(&nfspvc.spec.capacity)),
            access_modes: Some(nfspvc.spec.access_modes.clone()),
            persistent_volume_reclaim_policy: Some(config.reclaim_policy.to_string()),
            claim_ref: Some(claim_reference(&name, &namespace)),
            mount_options: nfspvc.mount_options(),
            nfs: Some(NFSVolumeSource {
                server: nfspvc.spec.server.clone(),
                path: nfspvc.spec.path.clone(),
                read_only: None,
            }),
            ..Default::default()
        }),
        status: None,
    })
}

/// Build the PersistentVolumeClaim bound to the NfsPvc's volume
pub fn build_claim(nfspvc: &NfsPvc, config: &OperatorConfig) -> Result<PersistentVolumeClaim> {
    let name = nfspvc.name_any();
    let namespace = nfspvc.namespace_or_err()?;

    Ok(PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.clone()),
            labels: Some(owner_labels(&name, &namespace)),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            storage_class_name: Some(config.storage_class.clone()),
            volume_name: Some(nfspvc.volume_name()?),
            access_modes: Some(nfspvc.spec.access_modes.clone()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(quantities(&nfspvc.spec.capacity)),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    })
}

// =============================================================================
// Binding Checks
// =============================================================================

fn volume_phase(volume: &PersistentVolume) -> Option<&str> {
    volume.status.as_ref()?.phase.as_deref()
}

fn claim_phase(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim.status.as_ref()?.phase.as_deref()
}

/// Whether the volume's claim reference no longer names the live claim.
///
/// True for a `Released` or `Failed` volume, and for a `Bound` volume whose
/// recorded claim UID differs from a live claim stuck in `Pending`, which is
/// what a claim deleted and recreated under the same name looks like.
pub fn is_claim_ref_stale(volume: &PersistentVolume, claim: Option<&PersistentVolumeClaim>) -> bool {
    match volume_phase(volume) {
        Some(PHASE_RELEASED) | Some(PHASE_FAILED) => true,
        Some(PHASE_BOUND) => claim.is_some_and(|claim| {
            let recorded_uid = volume
                .spec
                .as_ref()
                .and_then(|s| s.claim_ref.as_ref())
                .and_then(|r| r.uid.as_deref());
            claim_phase(claim) == Some(PHASE_PENDING) && claim.uid().as_deref() != recorded_uid
        }),
        _ => false,
    }
}

/// Whether a `Lost` claim still carries the bind-completed marker
pub fn is_lost_with_bind_marker(claim: &PersistentVolumeClaim) -> bool {
    claim_phase(claim) == Some(PHASE_LOST)
        && claim
            .annotations()
            .get(BIND_COMPLETED_ANNOTATION)
            .is_some_and(|v| v == "yes")
}

// =============================================================================
// Storage Synchronizer
// =============================================================================

/// Keeps the volume and claim of an NfsPvc present and consistently bound
pub struct StorageSynchronizer {
    store: ClusterStoreRef,
    config: Arc<OperatorConfig>,
    retry: RetryPolicy,
}

impl StorageSynchronizer {
    pub fn new(store: ClusterStoreRef, config: Arc<OperatorConfig>, retry: RetryPolicy) -> Self {
        Self {
            store,
            config,
            retry,
        }
    }

    /// Bring the storage objects of a live NfsPvc in line with its spec
    pub async fn sync(&self, nfspvc: &NfsPvc) -> Result<()> {
        let name = nfspvc.name_any();
        let namespace = nfspvc.namespace_or_err()?;
        let volume_name = nfspvc.volume_name()?;

        let volume = self.store.get_volume(&volume_name).await?;
        let claim = self.store.get_claim(&name, &namespace).await?;

        match &volume {
            None => self.create_volume(nfspvc).await?,
            Some(volume) if is_claim_ref_stale(volume, claim.as_ref()) => {
                self.repair_claim_ref(&volume_name, &name, &namespace).await?
            }
            Some(_) => {}
        }

        match &claim {
            None => self.create_claim(nfspvc).await?,
            Some(claim) if is_lost_with_bind_marker(claim) => {
                self.clear_bind_marker(&name, &namespace).await?
            }
            Some(_) => {}
        }

        Ok(())
    }

    async fn create_volume(&self, nfspvc: &NfsPvc) -> Result<()> {
        let volume = build_volume(nfspvc, &self.config)?;
        let volume_name = volume.name_any();

        match self.store.create_volume(volume).await {
            Ok(_) => {
                info!(volume = %volume_name, server = %nfspvc.spec.server, path = %nfspvc.spec.path, "Created volume");
                Ok(())
            }
            Err(err) if err.is_already_exists() => {
                debug!(volume = %volume_name, "Volume already exists");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn create_claim(&self, nfspvc: &NfsPvc) -> Result<()> {
        let claim = build_claim(nfspvc, &self.config)?;
        let name = claim.name_any();

        match self.store.create_claim(claim).await {
            Ok(_) => {
                info!(claim = %name, namespace = ?nfspvc.namespace(), "Created claim");
                Ok(())
            }
            Err(err) if err.is_already_exists() => {
                debug!(claim = %name, "Claim already exists");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn repair_claim_ref(&self, volume_name: &str, name: &str, namespace: &str) -> Result<()> {
        let desired = claim_reference(name, namespace);
        let store = &self.store;
        let mut repaired = false;

        update_with_retry(
            &self.retry,
            VOLUME_KIND,
            volume_name,
            || store.get_volume(volume_name),
            |volume| {
                let Some(spec) = volume.spec.as_mut() else {
                    return false;
                };
                if spec.claim_ref.as_ref() == Some(&desired) {
                    return false;
                }
                spec.claim_ref = Some(desired.clone());
                repaired = true;
                true
            },
            |volume| store.replace_volume(volume),
        )
        .await?;

        if repaired {
            warn!(volume = %volume_name, claim = %name, namespace = %namespace, "Repaired stale claim reference");
        }
        Ok(())
    }

    async fn clear_bind_marker(&self, name: &str, namespace: &str) -> Result<()> {
        let store = &self.store;
        let mut cleared = false;

        update_with_retry(
            &self.retry,
            CLAIM_KIND,
            name,
            || store.get_claim(name, namespace),
            |claim| {
                cleared = claim
                    .metadata
                    .annotations
                    .as_mut()
                    .and_then(|a| a.remove(BIND_COMPLETED_ANNOTATION))
                    .is_some();
                cleared
            },
            |claim| store.replace_claim(claim),
        )
        .await?;

        if cleared {
            info!(claim = %name, namespace = %namespace, "Cleared bind-completed marker on lost claim");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::NfsPvcSpec;
    use crate::domain::ClusterStore;
    use crate::store::{Fault, InMemoryStore, StoreOp};
    use assert_matches::assert_matches;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaimStatus, PersistentVolumeStatus};

    fn config() -> Arc<OperatorConfig> {
        Arc::new(OperatorConfig::new("nfs", "Retain").unwrap())
    }

    fn request() -> NfsPvc {
        let mut obj = NfsPvc::new(
            "data",
            NfsPvcSpec {
                server: "nfs1".into(),
                path: "/export".into(),
                capacity: [("storage".to_string(), "5Gi".to_string())].into(),
                access_modes: vec!["ReadWriteMany".into()],
                nfs_version: Some("4.1".into()),
            },
        );
        obj.metadata.namespace = Some("default".into());
        obj
    }

    fn synchronizer() -> (Arc<InMemoryStore>, StorageSynchronizer) {
        let store = Arc::new(InMemoryStore::new());
        let sync = StorageSynchronizer::new(store.clone(), config(), RetryPolicy::default());
        (store, sync)
    }

    fn set_volume_phase(pv: &mut PersistentVolume, phase: &str) {
        pv.status = Some(PersistentVolumeStatus {
            phase: Some(phase.into()),
            ..Default::default()
        });
    }

    fn set_claim_phase(pvc: &mut PersistentVolumeClaim, phase: &str) {
        pvc.status = Some(PersistentVolumeClaimStatus {
            phase: Some(phase.into()),
            ..Default::default()
        });
    }

    #[test]
    fn test_build_volume() {
        let pv = build_volume(&request(), &config()).unwrap();
        assert_eq!(pv.name_any(), "data-default-pv");
        assert_eq!(pv.labels().get(OWNER_LABEL).map(String::as_str), Some("data"));

        let spec = pv.spec.unwrap();
        assert_eq!(spec.storage_class_name.as_deref(), Some("nfs"));
        assert_eq!(spec.persistent_volume_reclaim_policy.as_deref(), Some("Retain"));
        assert_eq!(spec.capacity.unwrap()["storage"], Quantity("5Gi".into()));
        assert_eq!(spec.access_modes, Some(vec!["ReadWriteMany".to_string()]));
        assert_eq!(spec.mount_options, Some(vec!["nfsvers=4.1".to_string()]));
        assert_eq!(spec.claim_ref, Some(claim_reference("data", "default")));

        let nfs = spec.nfs.unwrap();
        assert_eq!(nfs.server, "nfs1");
        assert_eq!(nfs.path, "/export");
    }

    #[test]
    fn test_build_claim() {
        let pvc = build_claim(&request(), &config()).unwrap();
        assert_eq!(pvc.name_any(), "data");
        assert_eq!(pvc.namespace().as_deref(), Some("default"));

        let spec = pvc.spec.unwrap();
        assert_eq!(spec.volume_name.as_deref(), Some("data-default-pv"));
        assert_eq!(spec.storage_class_name.as_deref(), Some("nfs"));
        let requests = spec.resources.unwrap().requests.unwrap();
        assert_eq!(requests["storage"], Quantity("5Gi".into()));
    }

    #[test]
    fn test_stale_claim_ref_detection() {
        let obj = request();
        let mut pv = build_volume(&obj, &config()).unwrap();
        let mut pvc = build_claim(&obj, &config()).unwrap();
        pvc.metadata.uid = Some("new-uid".into());

        set_volume_phase(&mut pv, "Released");
        assert!(is_claim_ref_stale(&pv, None));
        set_volume_phase(&mut pv, "Failed");
        assert!(is_claim_ref_stale(&pv, Some(&pvc)));
        set_volume_phase(&mut pv, "Available");
        assert!(!is_claim_ref_stale(&pv, Some(&pvc)));

        set_volume_phase(&mut pv, "Bound");
        pv.spec.as_mut().unwrap().claim_ref.as_mut().unwrap().uid = Some("old-uid".into());
        set_claim_phase(&mut pvc, "Pending");
        assert!(is_claim_ref_stale(&pv, Some(&pvc)));

        set_claim_phase(&mut pvc, "Bound");
        assert!(!is_claim_ref_stale(&pv, Some(&pvc)));

        set_claim_phase(&mut pvc, "Pending");
        pvc.metadata.uid = Some("old-uid".into());
        assert!(!is_claim_ref_stale(&pv, Some(&pvc)));
        assert!(!is_claim_ref_stale(&pv, None));
    }

    #[tokio::test]
    async fn test_sync_creates_both_objects() {
        let (store, sync) = synchronizer();
        sync.sync(&request()).await.unwrap();

        let pv = store.get_volume("data-default-pv").await.unwrap().unwrap();
        let pvc = store.get_claim("data", "default").await.unwrap().unwrap();
        assert_eq!(
            pvc.spec.unwrap().volume_name.as_deref(),
            pv.metadata.name.as_deref()
        );
        assert_eq!(store.writes(), 2);
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let (store, sync) = synchronizer();
        sync.sync(&request()).await.unwrap();
        let writes = store.writes();

        sync.sync(&request()).await.unwrap();
        assert_eq!(store.writes(), writes);

        store.external_bind("data-default-pv", "data", "default").unwrap();
        sync.sync(&request()).await.unwrap();
        sync.sync(&request()).await.unwrap();
        assert_eq!(store.writes(), writes);
    }

    #[tokio::test]
    async fn test_sync_recreates_deleted_claim() {
        let (store, sync) = synchronizer();
        sync.sync(&request()).await.unwrap();
        store.external_delete_claim("data", "default").unwrap();

        sync.sync(&request()).await.unwrap();
        assert!(store.get_claim("data", "default").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sync_repairs_recreated_claim_binding() {
        let (store, sync) = synchronizer();
        sync.sync(&request()).await.unwrap();
        store.external_bind("data-default-pv", "data", "default").unwrap();

        // Claim deleted and recreated; the volume still records the old UID.
        store.external_delete_claim("data", "default").unwrap();
        sync.sync(&request()).await.unwrap();
        let recreated = store.get_claim("data", "default").await.unwrap().unwrap();
        let pv = store.get_volume("data-default-pv").await.unwrap().unwrap();
        assert_ne!(
            pv.spec.as_ref().unwrap().claim_ref.as_ref().unwrap().uid,
            recreated.metadata.uid
        );

        sync.sync(&request()).await.unwrap();
        let pv = store.get_volume("data-default-pv").await.unwrap().unwrap();
        assert_eq!(
            pv.spec.unwrap().claim_ref,
            Some(claim_reference("data", "default"))
        );

        let writes = store.writes();
        sync.sync(&request()).await.unwrap();
        assert_eq!(store.writes(), writes);
    }

    #[tokio::test]
    async fn test_sync_repairs_released_volume_through_conflict() {
        let (store, sync) = synchronizer();
        sync.sync(&request()).await.unwrap();
        store.external_bind("data-default-pv", "data", "default").unwrap();
        store
            .external_update_volume("data-default-pv", |pv| set_volume_phase(pv, "Released"))
            .unwrap();
        store.inject_fault(StoreOp::ReplaceVolume, Fault::Conflict, 1);

        sync.sync(&request()).await.unwrap();
        let pv = store.get_volume("data-default-pv").await.unwrap().unwrap();
        let claim_ref = pv.spec.unwrap().claim_ref.unwrap();
        assert_eq!(claim_ref.uid, None);
        assert_eq!(claim_ref.name.as_deref(), Some("data"));
    }

    #[tokio::test]
    async fn test_sync_clears_bind_marker_on_lost_claim() {
        let (store, sync) = synchronizer();
        sync.sync(&request()).await.unwrap();
        store.external_bind("data-default-pv", "data", "default").unwrap();
        store
            .external_update_claim("data", "default", |pvc| set_claim_phase(pvc, "Lost"))
            .unwrap();

        sync.sync(&request()).await.unwrap();
        let pvc = store.get_claim("data", "default").await.unwrap().unwrap();
        assert!(!pvc.annotations().contains_key(BIND_COMPLETED_ANNOTATION));

        let writes = store.writes();
        sync.sync(&request()).await.unwrap();
        assert_eq!(store.writes(), writes);
    }

    #[tokio::test]
    async fn test_sync_propagates_store_errors() {
        let (store, sync) = synchronizer();
        store
            .create_volume(build_volume(&request(), &config()).unwrap())
            .await
            .unwrap();
        store.inject_fault(StoreOp::GetVolume, Fault::Unavailable, 1);

        assert_matches!(sync.sync(&request()).await, Err(crate::Error::Internal(_)));

        // Volume exists already; a second pass only adds the claim.
        sync.sync(&request()).await.unwrap();
        assert!(store.get_claim("data", "default").await.unwrap().is_some());
    }
}
