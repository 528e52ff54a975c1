//! Custom Resource Definitions for the NfsPvc Operator
//!
//! - NfsPvc: NFS-backed storage request materialized as a PV/PVC pair

pub mod nfs_pvc;

pub use nfs_pvc::*;
