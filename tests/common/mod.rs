//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use pipeflow::tap::MemoryStore;
use pipeflow::{FlowConfig, FlowConnector, Tuple};

/// Connector with the default configuration.
pub fn connector() -> FlowConnector {
    FlowConnector::new(FlowConfig::default()).expect("default config is valid")
}

/// Contents of `identifier`, sorted so parallel runs compare equal.
pub fn read_sorted(store: &MemoryStore, identifier: &str) -> Vec<Tuple> {
    let mut rows = store.read(identifier).unwrap_or_default();
    rows.sort();
    rows
}

/// One single-value tuple per word.
pub fn words(text: &str) -> Vec<Tuple> {
    text.split_whitespace().map(|w| pipeflow::tuple![w]).collect()
}
