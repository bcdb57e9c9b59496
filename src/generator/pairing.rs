//! Source to destination storage pairing.

use std::collections::HashMap;

/// Destination and flow a source storage is paired with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pairing {
    pub destination_id: String,
    pub flow_id: String,
}

/// In-memory map of paired storages, built at initialization.
#[derive(Debug, Clone, Default)]
pub struct StoragePairing {
    mapping: HashMap<String, Pairing>,
    /// Sources enrolled in the reconciliation sweep, in registration order.
    cron_sources: Vec<String>,
    destinations: Vec<String>,
}

impl StoragePairing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pair `source_id` with `destination_id`.
    ///
    /// A later registration for the same source replaces its destination.
    pub fn register(
        &mut self,
        flow_id: &str,
        source_id: &str,
        destination_id: &str,
        with_cron: bool,
    ) {
        self.mapping.insert(
            source_id.to_string(),
            Pairing {
                destination_id: destination_id.to_string(),
                flow_id: flow_id.to_string(),
            },
        );
        if with_cron && !self.is_cron_source(source_id) {
            self.cron_sources.push(source_id.to_string());
        }
        if !self.destinations.iter().any(|d| d == destination_id) {
            self.destinations.push(destination_id.to_string());
        }
    }

    pub fn get(&self, source_id: &str) -> Option<&Pairing> {
        self.mapping.get(source_id)
    }

    pub fn destination_of(&self, source_id: &str) -> Option<&str> {
        self.get(source_id).map(|p| p.destination_id.as_str())
    }

    pub fn is_cron_source(&self, storage_id: &str) -> bool {
        self.cron_sources.iter().any(|s| s == storage_id)
    }

    pub fn is_destination(&self, storage_id: &str) -> bool {
        self.destinations.iter().any(|d| d == storage_id)
    }

    /// Registered sources, sorted.
    pub fn sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = self.mapping.keys().cloned().collect();
        sources.sort();
        sources
    }

    pub fn cron_sources(&self) -> &[String] {
        &self.cron_sources
    }

    pub fn destinations(&self) -> &[String] {
        &self.destinations
    }
}
