//! Persisted finalized instances.
//!
//! An artifact is `MAGIC | version:u32le | header_len:u32le | header | payload`, where the
//! header is bincode and the payload is whatever the implementation's `serialize` produced.
//! The header pins everything a payload was compiled against; a mismatch on any field
//! rejects the artifact instead of running it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{BackendKind, ConcreteShapes, DeviceCaps};
use crate::error::{RuntimeError, RuntimeResult};
use crate::graph::{Node, OperationKind};
use crate::instance::{InstanceState, PrimitiveInstance};
use crate::layout::Layout;
use crate::registry::ImplementationRegistry;

pub const ARTIFACT_MAGIC: &[u8; 8] = b"PRIMRTAF";
pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

const PREAMBLE_LEN: usize = ARTIFACT_MAGIC.len() + 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactHeader {
    pub backend: BackendKind,
    pub implementation: String,
    pub implementation_version: u32,
    pub device_fingerprint: u64,
    pub op: OperationKind,
    pub node_signature: u64,
    pub shapes: ConcreteShapes,
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact does not start with the expected magic")]
    BadMagic,
    #[error("artifact format version {found} is not supported (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("artifact is truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("artifact header is malformed: {0}")]
    Header(#[from] bincode::Error),
    #[error("artifact {field} mismatch: stored {stored}, current {current}")]
    Mismatch {
        field: &'static str,
        stored: String,
        current: String,
    },
    #[error("artifact i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A validated artifact: the preamble and header decoded, the payload still opaque.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactBlob {
    bytes: Vec<u8>,
    header: ArtifactHeader,
    payload_offset: usize,
}

impl ArtifactBlob {
    pub fn encode(header: ArtifactHeader, payload: &[u8]) -> Result<Self, ArtifactError> {
        let header_bytes = bincode::serialize(&header)?;
        let mut bytes = Vec::with_capacity(PREAMBLE_LEN + header_bytes.len() + payload.len());
        bytes.extend_from_slice(ARTIFACT_MAGIC);
        bytes.extend_from_slice(&ARTIFACT_FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&header_bytes);
        let payload_offset = bytes.len();
        bytes.extend_from_slice(payload);
        Ok(Self {
            bytes,
            header,
            payload_offset,
        })
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ArtifactError> {
        if bytes.len() < PREAMBLE_LEN {
            if !ARTIFACT_MAGIC.starts_with(&bytes[..bytes.len().min(ARTIFACT_MAGIC.len())]) {
                return Err(ArtifactError::BadMagic);
            }
            return Err(ArtifactError::Truncated {
                needed: PREAMBLE_LEN,
                available: bytes.len(),
            });
        }
        if &bytes[..ARTIFACT_MAGIC.len()] != ARTIFACT_MAGIC {
            return Err(ArtifactError::BadMagic);
        }
        let version = read_u32(&bytes, ARTIFACT_MAGIC.len());
        if version != ARTIFACT_FORMAT_VERSION {
            return Err(ArtifactError::UnsupportedVersion {
                found: version,
                expected: ARTIFACT_FORMAT_VERSION,
            });
        }
        let header_len = read_u32(&bytes, ARTIFACT_MAGIC.len() + 4) as usize;
        let payload_offset = PREAMBLE_LEN.saturating_add(header_len);
        if bytes.len() < payload_offset {
            return Err(ArtifactError::Truncated {
                needed: payload_offset,
                available: bytes.len(),
            });
        }
        let header = bincode::deserialize(&bytes[PREAMBLE_LEN..payload_offset])?;
        Ok(Self {
            bytes,
            header,
            payload_offset,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn header(&self) -> &ArtifactHeader {
        &self.header
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[self.payload_offset..]
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}

/// Writes a `Ready` instance as an artifact.
pub fn serialize(
    instance: &PrimitiveInstance,
    registry: &ImplementationRegistry,
    device: &DeviceCaps,
) -> RuntimeResult<ArtifactBlob> {
    let not_ready = || RuntimeError::NotReady {
        node: instance.id(),
        state: instance.state(),
    };
    if instance.state() != InstanceState::Ready {
        return Err(not_ready());
    }
    let (Some(descriptor), Some(implementation), Some(form)) = (
        instance.descriptor(),
        instance.implementation(),
        instance.finalized(),
    ) else {
        return Err(not_ready());
    };
    let descriptor = registry.descriptor(descriptor);
    let payload = implementation
        .serialize()
        .map_err(|err| RuntimeError::IncompatibleArtifact {
            node: instance.id(),
            reason: err.to_string(),
        })?;
    let header = ArtifactHeader {
        backend: descriptor.backend,
        implementation: descriptor.name.to_string(),
        implementation_version: descriptor.version,
        device_fingerprint: device.fingerprint(),
        op: instance.kind(),
        node_signature: instance.signature(),
        shapes: form.shapes.clone(),
    };
    ArtifactBlob::encode(header, &payload).map_err(|err| RuntimeError::IncompatibleArtifact {
        node: instance.id(),
        reason: err.to_string(),
    })
}

/// Rebuilds a `Ready` instance for `node` from an artifact, or explains why it cannot.
pub fn deserialize(
    blob: &ArtifactBlob,
    node: Arc<Node>,
    declared_inputs: Vec<Layout>,
    registry: &ImplementationRegistry,
    device: &DeviceCaps,
) -> RuntimeResult<PrimitiveInstance> {
    let id = node.id;
    let reject = |err: ArtifactError| RuntimeError::IncompatibleArtifact {
        node: id,
        reason: err.to_string(),
    };
    let header = blob.header();

    check("device fingerprint", header.device_fingerprint, device.fingerprint()).map_err(reject)?;
    check("operation", header.op.as_str(), node.kind().as_str()).map_err(reject)?;
    check(
        "node signature",
        header.node_signature,
        node.signature(&declared_inputs),
    )
    .map_err(reject)?;
    if !device.enables(header.backend) {
        return Err(reject(ArtifactError::Mismatch {
            field: "backend",
            stored: header.backend.as_str().to_string(),
            current: "disabled on this device".to_string(),
        }));
    }

    let descriptor_id = registry
        .lookup(header.op, header.backend, &header.implementation)
        .ok_or_else(|| {
            reject(ArtifactError::Mismatch {
                field: "implementation",
                stored: header.implementation.clone(),
                current: "not registered".to_string(),
            })
        })?;
    let descriptor = registry.descriptor(descriptor_id);
    check(
        "implementation version",
        header.implementation_version,
        descriptor.version,
    )
    .map_err(reject)?;

    let mut implementation = descriptor.instantiate(&node);
    let form = implementation
        .deserialize(blob.payload())
        .map_err(|err| RuntimeError::IncompatibleArtifact {
            node: id,
            reason: err.to_string(),
        })?;
    if form.shapes != header.shapes {
        return Err(reject(ArtifactError::Mismatch {
            field: "shapes",
            stored: format!("{:?}", header.shapes),
            current: format!("{:?}", form.shapes),
        }));
    }
    Ok(PrimitiveInstance::restored(
        node,
        declared_inputs,
        descriptor_id,
        implementation,
        form,
    ))
}

fn check<T: PartialEq + std::fmt::Display>(
    field: &'static str,
    stored: T,
    current: T,
) -> Result<(), ArtifactError> {
    if stored == current {
        return Ok(());
    }
    Err(ArtifactError::Mismatch {
        field,
        stored: stored.to_string(),
        current: current.to_string(),
    })
}

/// Artifacts keyed by node signature, optionally mirrored to a directory.
#[derive(Debug, Default)]
pub struct ArtifactStore {
    entries: Mutex<HashMap<u64, ArtifactBlob>>,
    dir: Option<PathBuf>,
}

impl ArtifactStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> Result<Self, ArtifactError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            entries: Mutex::new(HashMap::new()),
            dir: Some(dir),
        })
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn path_for(dir: &Path, key: u64) -> PathBuf {
        dir.join(format!("artifact_{key:016x}.bin"))
    }

    pub fn get(&self, key: u64) -> Option<ArtifactBlob> {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(blob) = entries.get(&key) {
            return Some(blob.clone());
        }
        let path = Self::path_for(self.dir.as_deref()?, key);
        let bytes = std::fs::read(&path).ok()?;
        match ArtifactBlob::from_bytes(bytes) {
            Ok(blob) => {
                entries.insert(key, blob.clone());
                Some(blob)
            }
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "ignoring unreadable artifact"
                );
                None
            }
        }
    }

    pub fn put(&self, key: u64, blob: ArtifactBlob) -> Result<(), ArtifactError> {
        if let Some(dir) = self.dir.as_deref() {
            std::fs::write(Self::path_for(dir, key), blob.as_bytes())?;
        }
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, blob);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Dims;

    fn header() -> ArtifactHeader {
        ArtifactHeader {
            backend: BackendKind::Reference,
            implementation: "ref_add".to_string(),
            implementation_version: 1,
            device_fingerprint: 7,
            op: OperationKind::ElementwiseBinary,
            node_signature: 11,
            shapes: ConcreteShapes::new(vec![Dims::from_slice(&[4])], vec![Dims::from_slice(&[4])]),
        }
    }

    #[test]
    fn blob_exposes_header_and_payload() {
        let blob = ArtifactBlob::encode(header(), &[1, 2, 3]).expect("encode");
        let decoded = ArtifactBlob::from_bytes(blob.as_bytes().to_vec()).expect("decode");
        assert_eq!(decoded.header(), &header());
        assert_eq!(decoded.payload(), &[1, 2, 3]);
    }

    #[test]
    fn rejects_foreign_and_truncated_bytes() {
        assert!(matches!(
            ArtifactBlob::from_bytes(b"NOTANARTIFACT!!!!".to_vec()),
            Err(ArtifactError::BadMagic)
        ));
        assert!(matches!(
            ArtifactBlob::from_bytes(b"PRIMRT".to_vec()),
            Err(ArtifactError::Truncated { .. })
        ));

        let mut bytes = ArtifactBlob::encode(header(), &[]).expect("encode").into_bytes();
        bytes[ARTIFACT_MAGIC.len()] = 9;
        assert!(matches!(
            ArtifactBlob::from_bytes(bytes),
            Err(ArtifactError::UnsupportedVersion { found: 9, .. })
        ));
    }

    #[test]
    fn store_mirrors_entries_to_disk() {
        let dir = std::env::temp_dir().join(format!("primrt-artifacts-{}", std::process::id()));
        let blob = ArtifactBlob::encode(header(), &[5]).expect("encode");
        {
            let store = ArtifactStore::with_dir(&dir).expect("store");
            store.put(42, blob.clone()).expect("put");
            assert_eq!(store.len(), 1);
        }
        let reopened = ArtifactStore::with_dir(&dir).expect("reopen");
        assert!(reopened.is_empty());
        assert_eq!(reopened.get(42), Some(blob));
        assert_eq!(reopened.get(43), None);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
