//! Kubernetes Store Adapter
//!
//! Implements the [`ClusterStore`] port on top of the Kubernetes API using
//! `kube::Api`, translating API status codes into the operator's error
//! taxonomy.

use crate::crd::{NfsPvc, CLAIM_KIND, NFSPVC_KIND, VOLUME_KIND};
use crate::domain::ports::ClusterStore;
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

// =============================================================================
// Kube Store
// =============================================================================

/// Adapter backed by a live Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Create a new adapter from a Kubernetes client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn nfs_pvcs(&self, namespace: &str) -> Api<NfsPvc> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn volumes(&self) -> Api<PersistentVolume> {
        Api::all(self.client.clone())
    }

    fn claims(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Map a kube error onto the operator's error taxonomy
fn classify(err: kube::Error, kind: &str, name: &str) -> Error {
    match &err {
        kube::Error::Api(resp) if resp.code == 404 => Error::ResourceNotFound {
            kind: kind.into(),
            name: name.into(),
        },
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            Error::ResourceExists {
                kind: kind.into(),
                name: name.into(),
            }
        }
        kube::Error::Api(resp) if resp.code == 409 => Error::Conflict {
            kind: kind.into(),
            name: name.into(),
        },
        _ => Error::Kube(err),
    }
}

fn namespace_of<K: ResourceExt>(obj: &K, kind: &str) -> Result<String> {
    obj.namespace().ok_or_else(|| Error::InvalidResource {
        kind: kind.into(),
        name: obj.name_any(),
        reason: "object has no namespace".into(),
    })
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get_nfs_pvc(&self, name: &str, namespace: &str) -> Result<Option<NfsPvc>> {
        self.nfs_pvcs(namespace)
            .get_opt(name)
            .await
            .map_err(|e| classify(e, NFSPVC_KIND, name))
    }

    async fn replace_nfs_pvc(&self, nfspvc: NfsPvc) -> Result<NfsPvc> {
        let name = nfspvc.name_any();
        let namespace = namespace_of(&nfspvc, NFSPVC_KIND)?;
        self.nfs_pvcs(&namespace)
            .replace(&name, &PostParams::default(), &nfspvc)
            .await
            .map_err(|e| classify(e, NFSPVC_KIND, &name))
    }

    async fn replace_nfs_pvc_status(&self, nfspvc: NfsPvc) -> Result<NfsPvc> {
        let name = nfspvc.name_any();
        let namespace = namespace_of(&nfspvc, NFSPVC_KIND)?;

        // The resource version in the merge patch keeps the write optimistic.
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": nfspvc.resource_version() },
            "status": nfspvc.status,
        });
        debug!(name = %name, namespace = %namespace, "Patching NfsPvc status");

        self.nfs_pvcs(&namespace)
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| classify(e, NFSPVC_KIND, &name))
    }

    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        self.volumes()
            .get_opt(name)
            .await
            .map_err(|e| classify(e, VOLUME_KIND, name))
    }

    async fn create_volume(&self, volume: PersistentVolume) -> Result<PersistentVolume> {
        let name = volume.name_any();
        self.volumes()
            .create(&PostParams::default(), &volume)
            .await
            .map_err(|e| classify(e, VOLUME_KIND, &name))
    }

    async fn replace_volume(&self, volume: PersistentVolume) -> Result<PersistentVolume> {
        let name = volume.name_any();
        self.volumes()
            .replace(&name, &PostParams::default(), &volume)
            .await
            .map_err(|e| classify(e, VOLUME_KIND, &name))
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        self.volumes()
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| classify(e, VOLUME_KIND, name))
    }

    async fn get_claim(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        self.claims(namespace)
            .get_opt(name)
            .await
            .map_err(|e| classify(e, CLAIM_KIND, name))
    }

    async fn create_claim(&self, claim: PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let name = claim.name_any();
        let namespace = namespace_of(&claim, CLAIM_KIND)?;
        self.claims(&namespace)
            .create(&PostParams::default(), &claim)
            .await
            .map_err(|e| classify(e, CLAIM_KIND, &name))
    }

    async fn replace_claim(&self, claim: PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let name = claim.name_any();
        let namespace = namespace_of(&claim, CLAIM_KIND)?;
        self.claims(&namespace)
            .replace(&name, &PostParams::default(), &claim)
            .await
            .map_err(|e| classify(e, CLAIM_KIND, &name))
    }

    async fn delete_claim(&self, name: &str, namespace: &str) -> Result<()> {
        self.claims(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| classify(e, CLAIM_KIND, name))
    }
}
