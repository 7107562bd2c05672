//! Discovery set
//!
//! Peripherals seen during the current scan, deduplicated by identifier.

use crate::domain::models::{PeripheralId, PeripheralRecord};
use tracing::debug;

#[derive(Debug, Default)]
pub struct DiscoverySet {
    records: Vec<PeripheralRecord>,
}

impl DiscoverySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an advertisement. Returns true if the set changed.
    ///
    /// Unnamed advertisers are ignored and a known identifier is never added
    /// twice.
    pub fn insert(&mut self, identifier: &PeripheralId, rssi: i16, name: Option<&str>) -> bool {
        let Some(name) = name else {
            return false;
        };
        if self.contains(identifier) {
            return false;
        }

        let record = PeripheralRecord {
            id: self.records.len(),
            signal_strength: rssi,
            identifier: identifier.clone(),
            name: Some(name.to_string()),
        };
        debug!(
            "Discovered {} ({}) RSSI {}",
            name, record.identifier, record.signal_strength
        );
        self.records.push(record);
        true
    }

    pub fn contains(&self, identifier: &PeripheralId) -> bool {
        self.records.iter().any(|r| &r.identifier == identifier)
    }

    /// Records advertising exactly `name`
    pub fn named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a PeripheralRecord> + 'a {
        self.records
            .iter()
            .filter(move |r| r.name.as_deref() == Some(name))
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[PeripheralRecord] {
        &self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_by_identifier() {
        let mut set = DiscoverySet::new();
        let id = PeripheralId::new("AA:BB");

        assert!(set.insert(&id, -60, Some("CARTA")));
        assert!(!set.insert(&id, -40, Some("CARTA")));
        assert_eq!(set.len(), 1);
        assert_eq!(set.records()[0].signal_strength, -60);
    }

    #[test]
    fn test_sequential_ids_and_clear() {
        let mut set = DiscoverySet::new();
        set.insert(&PeripheralId::new("a"), -50, Some("CARTA"));
        set.insert(&PeripheralId::new("b"), -70, Some("Speaker"));
        assert_eq!(set.records()[1].id, 1);
        assert_eq!(set.named("CARTA").count(), 1);

        set.clear();
        assert!(set.is_empty());
        set.insert(&PeripheralId::new("b"), -70, Some("Speaker"));
        assert_eq!(set.records()[0].id, 0);
    }

    #[test]
    fn test_unnamed_advertisers_ignored() {
        let mut set = DiscoverySet::new();
        assert!(!set.insert(&PeripheralId::new("x"), -30, None));
        assert!(set.is_empty());
    }
}
