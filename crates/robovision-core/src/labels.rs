//! Label registry — bijection between normalized directory labels and dense identity IDs.
//!
//! A fresh [`LabelRegistry`] is built during every training run and persisted
//! next to the model artifact. Recognition loads the [`InverseRegistry`]
//! (ID → label) reconstructed from the persisted label → ID mapping.

use crate::types::IdentityId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;

const REGISTRY_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("corrupt label registry {path}: {reason}")]
    CorruptRegistry { path: PathBuf, reason: String },
    #[error("failed to write label registry {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Normalize a directory name into an identity label.
///
/// Lowercases and collapses every run of whitespace into a single `-`.
pub fn normalize_label(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase()
}

/// Label → ID assignment for a single training run.
#[derive(Debug, Clone, Default)]
pub struct LabelRegistry {
    ids: HashMap<String, IdentityId>,
    /// Labels in ID order; `labels[i]` owns `IdentityId(i)`.
    labels: Vec<String>,
}

impl LabelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the ID for `label`, assigning the next dense ID on first sight.
    pub fn register(&mut self, label: &str) -> IdentityId {
        if let Some(&id) = self.ids.get(label) {
            return id;
        }
        let id = IdentityId(self.labels.len() as u32);
        self.ids.insert(label.to_string(), id);
        self.labels.push(label.to_string());
        tracing::debug!(label, %id, "registered new identity");
        id
    }

    pub fn get(&self, label: &str) -> Option<IdentityId> {
        self.ids.get(label).copied()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Iterate `(label, id)` pairs in ID order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, IdentityId)> {
        self.labels
            .iter()
            .enumerate()
            .map(|(i, label)| (label.as_str(), IdentityId(i as u32)))
    }

    /// Persist the mapping on its own, without a model pairing digest.
    pub fn save(&self, path: &Path) -> Result<(), RegistryError> {
        self.document(None).write(path)
    }

    /// Load a persisted registry and return its ID → label view.
    pub fn load(path: &Path) -> Result<InverseRegistry, RegistryError> {
        RegistryDocument::read(path)?.invert(path)
    }

    pub(crate) fn document(&self, model_sha256: Option<String>) -> RegistryDocument {
        RegistryDocument {
            version: REGISTRY_FORMAT_VERSION,
            trained_at: chrono::Utc::now().to_rfc3339(),
            model_sha256,
            labels: self
                .iter()
                .map(|(label, id)| (label.to_string(), id))
                .collect(),
        }
    }
}

/// On-disk form of a registry. Labels are kept sorted so output is byte-stable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RegistryDocument {
    pub version: u32,
    pub trained_at: String,
    /// SHA-256 (hex) of the model artifact committed in the same run.
    #[serde(default)]
    pub model_sha256: Option<String>,
    pub labels: BTreeMap<String, IdentityId>,
}

impl RegistryDocument {
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    pub fn write(&self, path: &Path) -> Result<(), RegistryError> {
        let persistence = |source: std::io::Error| RegistryError::Persistence {
            path: path.to_path_buf(),
            source,
        };
        let bytes = self.to_bytes().map_err(|e| persistence(e.into()))?;
        std::fs::write(path, bytes).map_err(persistence)
    }

    pub fn read(path: &Path) -> Result<Self, RegistryError> {
        let corrupt = |reason: String| RegistryError::CorruptRegistry {
            path: path.to_path_buf(),
            reason,
        };
        let data = std::fs::read(path).map_err(|e| corrupt(format!("unreadable: {e}")))?;
        let doc: RegistryDocument =
            serde_json::from_slice(&data).map_err(|e| corrupt(format!("malformed: {e}")))?;
        if doc.version != REGISTRY_FORMAT_VERSION {
            return Err(corrupt(format!("unsupported format version {}", doc.version)));
        }
        Ok(doc)
    }

    fn invert(self, path: &Path) -> Result<InverseRegistry, RegistryError> {
        let labels = invert_mapping(&self.labels).map_err(|reason| RegistryError::CorruptRegistry {
            path: path.to_path_buf(),
            reason,
        })?;
        Ok(InverseRegistry {
            labels,
            trained_at: Some(self.trained_at),
            model_sha256: self.model_sha256,
        })
    }
}

/// Invert a label → ID mapping, refusing mappings that are not injective.
fn invert_mapping(
    mapping: &BTreeMap<String, IdentityId>,
) -> Result<BTreeMap<IdentityId, String>, String> {
    let mut inverse = BTreeMap::new();
    for (label, &id) in mapping {
        if let Some(previous) = inverse.insert(id, label.clone()) {
            return Err(format!(
                "identity {id} is assigned to both {previous:?} and {label:?}"
            ));
        }
    }
    Ok(inverse)
}

/// Read-only ID → label view used at recognition time.
#[derive(Debug, Clone, Default)]
pub struct InverseRegistry {
    labels: BTreeMap<IdentityId, String>,
    trained_at: Option<String>,
    model_sha256: Option<String>,
}

impl InverseRegistry {
    /// Build the inverse of an in-memory registry.
    pub fn from_registry(registry: &LabelRegistry) -> Self {
        Self {
            labels: registry.iter().map(|(l, id)| (id, l.to_string())).collect(),
            trained_at: None,
            model_sha256: None,
        }
    }

    pub fn label(&self, id: IdentityId) -> Option<&str> {
        self.labels.get(&id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Iterate `(id, label)` pairs in ascending ID order.
    pub fn iter(&self) -> impl Iterator<Item = (IdentityId, &str)> {
        self.labels.iter().map(|(&id, l)| (id, l.as_str()))
    }

    pub fn trained_at(&self) -> Option<&str> {
        self.trained_at.as_deref()
    }

    /// Digest of the model artifact this registry was committed with, if recorded.
    pub fn model_sha256(&self) -> Option<&str> {
        self.model_sha256.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_label() {
        assert_eq!(normalize_label("Alice"), "alice");
        assert_eq!(normalize_label("Alice Smith"), "alice-smith");
        assert_eq!(normalize_label("  Mary \t Jane  Doe "), "mary-jane-doe");
        assert_eq!(normalize_label("bob-jr"), "bob-jr");
    }

    #[test]
    fn test_register_same_label_twice() {
        let mut reg = LabelRegistry::new();
        let first = reg.register("alice");
        let second = reg.register("alice");
        assert_eq!(first, second);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_register_dense_ids() {
        let mut reg = LabelRegistry::new();
        let names = ["carol", "alice", "bob", "dave", "erin"];
        let ids: Vec<u32> = names.iter().map(|n| reg.register(n).0).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);

        // Re-registering in any order hands back the original IDs.
        for (i, n) in names.iter().enumerate().rev() {
            assert_eq!(reg.register(n), IdentityId(i as u32));
        }
        assert_eq!(reg.len(), names.len());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.json");

        let mut reg = LabelRegistry::new();
        reg.register("alice");
        reg.register("bob");
        reg.register("carol-ann");
        reg.save(&path).unwrap();

        let inverse = LabelRegistry::load(&path).unwrap();
        assert_eq!(inverse.len(), 3);
        for (label, id) in reg.iter() {
            assert_eq!(inverse.label(id), Some(label));
        }
        assert!(inverse.model_sha256().is_none());
        assert!(inverse.trained_at().is_some());
    }

    #[test]
    fn test_load_duplicate_ids_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.json");
        std::fs::write(
            &path,
            r#"{"version":1,"trained_at":"2024-01-01T00:00:00Z","labels":{"alice":0,"bob":0}}"#,
        )
        .unwrap();

        let err = LabelRegistry::load(&path).unwrap_err();
        assert!(matches!(err, RegistryError::CorruptRegistry { .. }), "got {err:?}");
    }

    #[test]
    fn test_load_malformed_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.json");
        std::fs::write(&path, b"not json at all").unwrap();
        assert!(matches!(
            LabelRegistry::load(&path),
            Err(RegistryError::CorruptRegistry { .. })
        ));
    }

    #[test]
    fn test_load_missing_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            LabelRegistry::load(&dir.path().join("absent.json")),
            Err(RegistryError::CorruptRegistry { .. })
        ));
    }

    #[test]
    fn test_document_is_byte_stable() {
        let mut reg = LabelRegistry::new();
        reg.register("zed");
        reg.register("amy");
        let text = String::from_utf8(reg.document(Some("abc".into())).to_bytes().unwrap()).unwrap();
        let amy = text.find("\"amy\"").unwrap();
        let zed = text.find("\"zed\"").unwrap();
        assert!(amy < zed, "labels should be written sorted:\n{text}");
        assert!(text.contains("\"model_sha256\": \"abc\""));
    }

    #[test]
    fn test_inverse_from_registry() {
        let mut reg = LabelRegistry::new();
        reg.register("alice");
        reg.register("bob");
        let inverse = InverseRegistry::from_registry(&reg);
        assert_eq!(inverse.label(IdentityId(1)), Some("bob"));
        assert_eq!(inverse.label(IdentityId(2)), None);
    }
}
