pub mod spec;

use serde::{Deserialize, Serialize};

use crate::hashing::fingerprint_of;

pub use spec::{
    decode_payload, encode_payload, BackendError, BackendKind, BackendResult, ConcreteShapes,
    FinalizedForm, Implementation, ImplementationFactory, StreamId,
};

/// Capabilities of the device a program is built for.
///
/// The fingerprint covers every field, so artifacts compiled for one device description are
/// rejected on another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCaps {
    pub name: String,
    pub backends: Vec<BackendKind>,
    pub compute_units: usize,
    pub features: Vec<String>,
}

impl DeviceCaps {
    pub fn new(name: impl Into<String>, backends: &[BackendKind]) -> Self {
        Self {
            name: name.into(),
            backends: backends.to_vec(),
            compute_units: 1,
            features: Vec::new(),
        }
    }

    /// The host CPU with every backend family enabled.
    pub fn host() -> Self {
        let compute_units = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        Self {
            compute_units,
            ..Self::new("host", &BackendKind::ALL)
        }
    }

    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.features.push(feature.into());
        self
    }

    pub fn with_compute_units(mut self, compute_units: usize) -> Self {
        self.compute_units = compute_units;
        self
    }

    pub fn enables(&self, backend: BackendKind) -> bool {
        self.backends.contains(&backend)
    }

    pub fn fingerprint(&self) -> u64 {
        fingerprint_of(self)
    }
}
