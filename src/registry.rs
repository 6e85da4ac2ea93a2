//! Endpoint registry
//!
//! Maps display names to transport handles for inputs and outputs. Each scan
//! builds a fresh [`RegistrySnapshot`] off to the side and publishes it with a
//! single pointer swap, so readers never lock and never see a half-built map.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::endpoint::{placeholder_name, Direction, EndpointDescriptor, EndpointHandle, EndpointRecord};
use crate::transport::MidiTransport;

/// Immutable result of one scan
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RegistrySnapshot {
    generation: u64,
    inputs: Vec<EndpointRecord>,
    outputs: Vec<EndpointRecord>,
    // name -> enumeration index; a later endpoint with the same name overwrites
    input_by_name: HashMap<String, usize>,
    output_by_name: HashMap<String, usize>,
    input_by_handle: HashMap<EndpointHandle, usize>,
    output_by_handle: HashMap<EndpointHandle, usize>,
}

fn resolve_records(direction: Direction, descriptors: Vec<EndpointDescriptor>) -> Vec<EndpointRecord> {
    descriptors
        .into_iter()
        .enumerate()
        .map(|(position, d)| {
            let display_name = match d.name {
                Some(name) if !name.trim().is_empty() => name,
                _ => placeholder_name(direction, position),
            };
            EndpointRecord {
                display_name,
                handle: d.handle,
                direction,
            }
        })
        .collect()
}

fn index_records(records: &[EndpointRecord]) -> (HashMap<String, usize>, HashMap<EndpointHandle, usize>) {
    let mut by_name = HashMap::with_capacity(records.len());
    let mut by_handle = HashMap::with_capacity(records.len());
    for (idx, record) in records.iter().enumerate() {
        if let Some(prev) = by_name.insert(record.display_name.clone(), idx) {
            debug!(
                "Duplicate {} name '{}' (positions {} and {}), keeping the later one",
                record.direction, record.display_name, prev, idx
            );
        }
        by_handle.insert(record.handle, idx);
    }
    (by_name, by_handle)
}

impl RegistrySnapshot {
    /// Build a snapshot from raw transport enumerations
    pub fn build(sources: Vec<EndpointDescriptor>, destinations: Vec<EndpointDescriptor>) -> Self {
        let inputs = resolve_records(Direction::Input, sources);
        let outputs = resolve_records(Direction::Output, destinations);
        let (input_by_name, input_by_handle) = index_records(&inputs);
        let (output_by_name, output_by_handle) = index_records(&outputs);

        Self {
            generation: 0,
            inputs,
            outputs,
            input_by_name,
            output_by_name,
            input_by_handle,
            output_by_handle,
        }
    }

    /// Monotonic scan counter, 0 for the empty snapshot the registry starts with
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn inputs(&self) -> &[EndpointRecord] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[EndpointRecord] {
        &self.outputs
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty() && self.outputs.is_empty()
    }

    pub fn resolve_output(&self, name: &str) -> Option<EndpointHandle> {
        self.output_by_name
            .get(name)
            .and_then(|&idx| self.outputs.get(idx))
            .map(|r| r.handle)
    }

    pub fn resolve_input(&self, name: &str) -> Option<EndpointHandle> {
        self.input_by_name
            .get(name)
            .and_then(|&idx| self.inputs.get(idx))
            .map(|r| r.handle)
    }

    /// Reverse lookup among outputs
    pub fn resolve_name(&self, handle: EndpointHandle) -> Option<&str> {
        self.output_by_handle
            .get(&handle)
            .and_then(|&idx| self.outputs.get(idx))
            .map(|r| r.display_name.as_str())
    }

    /// Reverse lookup among inputs
    pub fn resolve_source_name(&self, handle: EndpointHandle) -> Option<&str> {
        self.input_by_handle
            .get(&handle)
            .and_then(|&idx| self.inputs.get(idx))
            .map(|r| r.display_name.as_str())
    }

    /// Enumeration position of the output the name resolves to
    pub fn index_of_output(&self, name: &str) -> Option<usize> {
        self.output_by_name.get(name).copied()
    }

    pub fn is_available(&self, name: &str) -> bool {
        self.output_by_name.contains_key(name)
    }

    /// Names in the output mapping, in enumeration order of the entries that won
    pub fn connected_devices(&self) -> Vec<String> {
        self.outputs
            .iter()
            .enumerate()
            .filter(|(idx, r)| self.output_by_name.get(&r.display_name) == Some(idx))
            .map(|(_, r)| r.display_name.clone())
            .collect()
    }

    /// Every input name then every output name, as enumerated. No dedup.
    pub fn all_device_names(&self) -> Vec<String> {
        self.inputs
            .iter()
            .chain(self.outputs.iter())
            .map(|r| r.display_name.clone())
            .collect()
    }

    /// Handles of every input, in enumeration order
    pub fn source_handles(&self) -> Vec<EndpointHandle> {
        self.inputs.iter().map(|r| r.handle).collect()
    }
}

/// Result of publishing a new snapshot
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub snapshot: Arc<RegistrySnapshot>,
    /// The connected-devices list differs from the one published before
    pub changed: bool,
}

/// Owner of the current snapshot
pub struct EndpointRegistry {
    current: ArcSwap<RegistrySnapshot>,
    // Serializes writers so publication order matches completion order
    write_lock: Mutex<u64>,
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(RegistrySnapshot::default()),
            write_lock: Mutex::new(0),
        }
    }

    /// Current snapshot. Cheap; never blocks on a running scan.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.load_full()
    }

    /// Enumerate the transport and publish the result
    pub fn rescan(&self, transport: &dyn MidiTransport) -> ScanOutcome {
        let mut generation = self.write_lock.lock();

        let sources = transport.enumerate_sources();
        let destinations = transport.enumerate_destinations();
        trace!(
            "Scan found {} sources, {} destinations",
            sources.len(),
            destinations.len()
        );

        *generation += 1;
        let mut next = RegistrySnapshot::build(sources, destinations);
        next.generation = *generation;

        self.publish(next)
    }

    /// Publish the empty snapshot
    pub fn clear(&self) -> ScanOutcome {
        let mut generation = self.write_lock.lock();
        *generation += 1;
        let next = RegistrySnapshot {
            generation: *generation,
            ..RegistrySnapshot::default()
        };
        self.publish(next)
    }

    // Caller holds write_lock
    fn publish(&self, next: RegistrySnapshot) -> ScanOutcome {
        let next = Arc::new(next);
        let previous = self.current.swap(next.clone());
        let changed = previous.connected_devices() != next.connected_devices();

        debug!(
            "Registry generation {}: {} inputs, {} outputs{}",
            next.generation,
            next.inputs.len(),
            next.outputs.len(),
            if changed { " (changed)" } else { "" }
        );

        ScanOutcome {
            snapshot: next,
            changed,
        }
    }

    pub fn resolve_output(&self, name: &str) -> Option<EndpointHandle> {
        self.current.load().resolve_output(name)
    }

    pub fn resolve_name(&self, handle: EndpointHandle) -> Option<String> {
        self.current.load().resolve_name(handle).map(str::to_string)
    }

    pub fn resolve_source_name(&self, handle: EndpointHandle) -> Option<String> {
        self.current.load().resolve_source_name(handle).map(str::to_string)
    }

    pub fn index_of_output(&self, name: &str) -> Option<usize> {
        self.current.load().index_of_output(name)
    }

    pub fn is_available(&self, name: &str) -> bool {
        self.current.load().is_available(name)
    }

    pub fn connected_devices(&self) -> Vec<String> {
        self.current.load().connected_devices()
    }

    pub fn all_device_names(&self) -> Vec<String> {
        self.current.load().all_device_names()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::VirtualTransport;
    use proptest::prelude::*;

    fn desc(handle: u64, name: &str) -> EndpointDescriptor {
        EndpointDescriptor::new(EndpointHandle(handle), name)
    }

    #[test]
    fn test_empty_scan_is_not_an_error() {
        let transport = VirtualTransport::new();
        let registry = EndpointRegistry::new();

        let outcome = registry.rescan(&transport);

        assert!(outcome.snapshot.is_empty());
        assert!(!outcome.changed);
        assert!(registry.connected_devices().is_empty());
        assert!(registry.all_device_names().is_empty());
    }

    #[test]
    fn test_rescan_is_idempotent() {
        let transport = VirtualTransport::new();
        transport.add_source("Keys");
        transport.add_destination("Synth A");
        transport.add_destination("Synth B");
        let registry = EndpointRegistry::new();

        let first = registry.rescan(&transport).snapshot;
        let second = registry.rescan(&transport);

        assert!(!second.changed);
        assert_eq!(first.inputs(), second.snapshot.inputs());
        assert_eq!(first.outputs(), second.snapshot.outputs());
        assert_eq!(first.connected_devices(), second.snapshot.connected_devices());
        assert_eq!(second.snapshot.generation(), first.generation() + 1);
    }

    #[test]
    fn test_scenario_two_synths() {
        let snapshot = RegistrySnapshot::build(vec![], vec![desc(1, "Synth A"), desc(2, "Synth B")]);

        assert_eq!(snapshot.resolve_output("Synth A"), Some(EndpointHandle(1)));
        assert_eq!(snapshot.index_of_output("Synth B"), Some(1));
        assert!(!snapshot.is_available("Synth C"));
        assert_eq!(snapshot.index_of_output("Synth C"), None);
    }

    #[test]
    fn test_collision_last_scanned_wins() {
        let snapshot = RegistrySnapshot::build(
            vec![],
            vec![desc(10, "Launchpad"), desc(11, "Other"), desc(12, "Launchpad")],
        );

        assert_eq!(snapshot.resolve_output("Launchpad"), Some(EndpointHandle(12)));
        assert_eq!(snapshot.index_of_output("Launchpad"), Some(2));
        assert_eq!(snapshot.connected_devices(), vec!["Other", "Launchpad"]);
        // all_device_names keeps every enumerated entry
        assert_eq!(snapshot.all_device_names(), vec!["Launchpad", "Other", "Launchpad"]);
    }

    #[test]
    fn test_unnamed_endpoints_get_placeholders() {
        let snapshot = RegistrySnapshot::build(
            vec![EndpointDescriptor::unnamed(EndpointHandle(5))],
            vec![desc(6, "Named"), EndpointDescriptor::new(EndpointHandle(7), "  ")],
        );

        assert_eq!(snapshot.resolve_source_name(EndpointHandle(5)), Some("Unnamed Source 1"));
        assert_eq!(snapshot.resolve_name(EndpointHandle(7)), Some("Unnamed Destination 2"));
        assert!(snapshot.is_available("Unnamed Destination 2"));
    }

    #[test]
    fn test_reverse_lookup_is_scoped_by_direction() {
        let snapshot = RegistrySnapshot::build(vec![desc(1, "Keys In")], vec![desc(2, "Keys Out")]);

        assert_eq!(snapshot.resolve_name(EndpointHandle(2)), Some("Keys Out"));
        assert_eq!(snapshot.resolve_name(EndpointHandle(1)), None);
        assert_eq!(snapshot.resolve_source_name(EndpointHandle(1)), Some("Keys In"));
        assert_eq!(snapshot.resolve_source_name(EndpointHandle(2)), None);
    }

    #[test]
    fn test_all_device_names_keeps_cross_direction_duplicates() {
        let snapshot = RegistrySnapshot::build(vec![desc(1, "X-Touch")], vec![desc(2, "X-Touch")]);
        assert_eq!(snapshot.all_device_names(), vec!["X-Touch", "X-Touch"]);
        assert_eq!(snapshot.connected_devices(), vec!["X-Touch"]);
    }

    #[test]
    fn test_clear_publishes_empty_snapshot() {
        let transport = VirtualTransport::new();
        transport.add_destination("Synth");
        let registry = EndpointRegistry::new();

        assert!(registry.rescan(&transport).changed);
        let held = registry.snapshot();

        let outcome = registry.clear();
        assert!(outcome.changed);
        assert!(registry.connected_devices().is_empty());
        // Readers holding the old snapshot keep a complete view
        assert_eq!(held.connected_devices(), vec!["Synth"]);
    }

    #[test]
    fn test_removed_device_disappears_after_rescan() {
        let transport = VirtualTransport::new();
        let a = transport.add_destination("A");
        transport.add_destination("B");
        let registry = EndpointRegistry::new();
        registry.rescan(&transport);

        transport.remove_endpoint(a);
        let outcome = registry.rescan(&transport);

        assert!(outcome.changed);
        assert_eq!(registry.connected_devices(), vec!["B"]);
        assert_eq!(registry.resolve_name(a), None);
        assert_eq!(registry.index_of_output("B"), Some(0));
    }

    proptest! {
        #[test]
        fn prop_resolution_round_trip(names in proptest::collection::vec("[A-Za-z0-9 ]{1,12}", 0..24)) {
            let destinations: Vec<EndpointDescriptor> = names
                .iter()
                .enumerate()
                .map(|(i, n)| desc(i as u64 + 100, n))
                .collect();
            let snapshot = RegistrySnapshot::build(vec![], destinations);

            for name in snapshot.connected_devices() {
                let handle = snapshot.resolve_output(&name).unwrap();
                prop_assert_eq!(snapshot.resolve_name(handle), Some(name.as_str()));
            }
        }

        #[test]
        fn prop_collision_resolves_to_last(names in proptest::collection::vec("[abc]", 1..16)) {
            let destinations: Vec<EndpointDescriptor> = names
                .iter()
                .enumerate()
                .map(|(i, n)| desc(i as u64, n))
                .collect();
            let snapshot = RegistrySnapshot::build(vec![], destinations);

            for name in &names {
                let last = names.iter().rposition(|n| n == name).unwrap();
                prop_assert_eq!(snapshot.resolve_output(name), Some(EndpointHandle(last as u64)));
                prop_assert_eq!(snapshot.index_of_output(name), Some(last));
            }
        }
    }
}
