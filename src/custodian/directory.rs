//! Authoritative source of protected-object metadata
//!
//! The custodian never trusts the caller's copy of a policy; it asks its
//! directory for the current object on every request.

use crate::archive::ArchiveError;
use crate::codec::CodecError;
use crate::manifest::ProtectedObject;
use crate::policy::SecurityPolicyLabel;
use crate::retry::Retryable;
use futures::future::BoxFuture;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Resource directory unavailable: {0}")]
    Unavailable(String),

    #[error("Stored object is unreadable: {0}")]
    Corrupt(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl DirectoryError {
    pub fn error_code(&self) -> &'static str {
        match self {
            DirectoryError::NotFound(_) => "CTDF_E_DIRECTORY_NOT_FOUND",
            DirectoryError::Unavailable(_) => "CTDF_E_DIRECTORY_UNAVAILABLE",
            DirectoryError::Corrupt(_) => "CTDF_E_DIRECTORY_CORRUPT",
            DirectoryError::Codec(e) => e.error_code(),
        }
    }
}

impl Retryable for DirectoryError {
    fn is_retryable(&self) -> bool {
        matches!(self, DirectoryError::Unavailable(_))
    }
}

pub trait ResourceDirectory: Send + Sync {
    fn fetch<'a>(
        &'a self,
        resource_id: &'a str,
    ) -> BoxFuture<'a, Result<Arc<ProtectedObject>, DirectoryError>>;
}

/// Directory held in memory
#[derive(Default)]
pub struct InMemoryDirectory {
    objects: RwLock<HashMap<String, Arc<ProtectedObject>>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, object: ProtectedObject) {
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        objects.insert(object.resource_id().to_string(), Arc::new(object));
    }

    pub fn remove(&self, resource_id: &str) -> Option<Arc<ProtectedObject>> {
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        objects.remove(resource_id)
    }

    /// Apply a new label to a stored object
    pub fn update_policy(
        &self,
        resource_id: &str,
        label: SecurityPolicyLabel,
    ) -> Result<Arc<ProtectedObject>, DirectoryError> {
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        let current = objects
            .get(resource_id)
            .ok_or_else(|| DirectoryError::NotFound(resource_id.to_string()))?;
        let mut updated = (**current).clone();
        updated.update_policy(label)?;
        let updated = Arc::new(updated);
        objects.insert(resource_id.to_string(), updated.clone());
        Ok(updated)
    }

    pub fn len(&self) -> usize {
        self.objects.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResourceDirectory for InMemoryDirectory {
    fn fetch<'a>(
        &'a self,
        resource_id: &'a str,
    ) -> BoxFuture<'a, Result<Arc<ProtectedObject>, DirectoryError>> {
        let found = self
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(resource_id)
            .cloned();
        Box::pin(async move { found.ok_or_else(|| DirectoryError::NotFound(resource_id.to_string())) })
    }
}

lazy_static! {
    static ref RESOURCE_ID: Regex =
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").expect("resource id regex is valid");
}

/// Objects stored as `<root>/<resourceId>.tdf` zip containers
#[derive(Debug, Clone)]
pub struct ArchiveDirectory {
    root: PathBuf,
}

impl ArchiveDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, resource_id: &str) -> Option<PathBuf> {
        if !RESOURCE_ID.is_match(resource_id) || resource_id.contains("..") {
            return None;
        }
        Some(self.root.join(format!("{}.tdf", resource_id)))
    }
}

impl ResourceDirectory for ArchiveDirectory {
    fn fetch<'a>(
        &'a self,
        resource_id: &'a str,
    ) -> BoxFuture<'a, Result<Arc<ProtectedObject>, DirectoryError>> {
        Box::pin(async move {
            let path = self
                .path_for(resource_id)
                .ok_or_else(|| DirectoryError::NotFound(resource_id.to_string()))?;
            let id = resource_id.to_string();
            let read = tokio::task::spawn_blocking(move || ProtectedObject::read_archive(&path))
                .await
                .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
            match read {
                Ok(object) if object.resource_id() == id => Ok(Arc::new(object)),
                Ok(object) => Err(DirectoryError::Corrupt(format!(
                    "archive for {} holds object {}",
                    id,
                    object.resource_id()
                ))),
                Err(ArchiveError::IoError(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(DirectoryError::NotFound(id))
                }
                Err(ArchiveError::IoError(e)) => Err(DirectoryError::Unavailable(e.to_string())),
                Err(e) => Err(DirectoryError::Corrupt(e.to_string())),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clearance::Clearance;
    use crate::kem::WrapAlgorithm;
    use crate::keyring::CustodianKeyring;
    use crate::manifest::CustodianRef;
    use crate::policy::PolicyBuilder;

    fn object(id: &str) -> ProtectedObject {
        let ring = CustodianKeyring::generate();
        let label = PolicyBuilder::new(Clearance::Secret)
            .originating_authority("USA")
            .build()
            .unwrap();
        ProtectedObject::builder(label)
            .object_id(id)
            .custodian(
                CustodianRef::new("usa", "https://usa.example"),
                ring.wrapping_key(WrapAlgorithm::A256GcmKw).unwrap(),
            )
            .build(b"data")
            .unwrap()
    }

    #[tokio::test]
    async fn test_in_memory_fetch_and_update() {
        let dir = InMemoryDirectory::new();
        dir.insert(object("doc-1"));
        assert_eq!(dir.fetch("doc-1").await.unwrap().policy.revision, 1);
        assert!(matches!(
            dir.fetch("doc-2").await,
            Err(DirectoryError::NotFound(_))
        ));

        let label = PolicyBuilder::new(Clearance::TopSecret)
            .originating_authority("USA")
            .build()
            .unwrap();
        dir.update_policy("doc-1", label).unwrap();
        let updated = dir.fetch("doc-1").await.unwrap();
        assert_eq!(updated.policy.revision, 2);
        assert!(updated.verify().is_intact());
    }

    #[tokio::test]
    async fn test_archive_directory() {
        let root = tempfile::tempdir().unwrap();
        let obj = object("doc-7");
        obj.write_archive(root.path().join("doc-7.tdf")).unwrap();

        let dir = ArchiveDirectory::new(root.path());
        let fetched = dir.fetch("doc-7").await.unwrap();
        assert_eq!(*fetched, obj);
        assert!(matches!(
            dir.fetch("missing").await,
            Err(DirectoryError::NotFound(_))
        ));
        assert!(matches!(
            dir.fetch("../etc/passwd").await,
            Err(DirectoryError::NotFound(_))
        ));
    }

    #[test]
    fn test_only_unavailable_is_retryable() {
        assert!(DirectoryError::Unavailable("x".into()).is_retryable());
        assert!(!DirectoryError::NotFound("x".into()).is_retryable());
    }
}
