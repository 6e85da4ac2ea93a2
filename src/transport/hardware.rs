//! Hardware MIDI transport backed by midir
//!
//! midir exposes no device-change notification, so each client runs a
//! watcher thread that polls the port ids and raises `device_list_changed`
//! when the set differs from the previous poll. Output connections are opened
//! lazily on first send and kept until the port is disposed; inputs hold one
//! connection per connected source.

use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use dashmap::DashMap;
use midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::{ClientHandle, MidiTransport, PortHandle, TransportListener};
use crate::endpoint::{Direction, EndpointDescriptor, EndpointHandle};
use crate::error::{Error, Result};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

struct Watcher {
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

impl Watcher {
    fn shutdown(self) {
        let _ = self.stop_tx.send(());
        if self.thread.join().is_err() {
            warn!("MIDI device watcher thread panicked");
        }
    }
}

struct ClientEntry {
    name: String,
    listener: Arc<dyn TransportListener>,
    watcher: Option<Watcher>,
}

enum PortConnections {
    Input(HashMap<EndpointHandle, MidiInputConnection<()>>),
    Output(HashMap<EndpointHandle, MidiOutputConnection>),
}

struct PortEntry {
    client: ClientHandle,
    name: String,
    connections: PortConnections,
}

/// [`MidiTransport`] over the platform MIDI API (CoreMIDI, ALSA, WinMM)
pub struct MidirTransport {
    poll_interval: Duration,
    next_id: AtomicU64,
    // midir port id -> handle, and back. Stable while the port stays visible;
    // each enumeration prunes ids that are gone.
    handles: DashMap<(Direction, String), EndpointHandle>,
    port_ids: DashMap<EndpointHandle, (Direction, String)>,
    clients: Mutex<HashMap<ClientHandle, ClientEntry>>,
    ports: Mutex<HashMap<PortHandle, PortEntry>>,
}

impl Default for MidirTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MidirTransport {
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    /// Poll for device changes every `poll_interval`
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            next_id: AtomicU64::new(1),
            handles: DashMap::new(),
            port_ids: DashMap::new(),
            clients: Mutex::new(HashMap::new()),
            ports: Mutex::new(HashMap::new()),
        }
    }

    fn handle_for(&self, direction: Direction, id: String) -> EndpointHandle {
        if let Some(handle) = self.handles.get(&(direction, id.clone())) {
            return *handle;
        }
        *self
            .handles
            .entry((direction, id.clone()))
            .or_insert_with(|| {
                let handle = EndpointHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
                self.port_ids.insert(handle, (direction, id));
                handle
            })
    }

    fn port_id(&self, handle: EndpointHandle, direction: Direction) -> Option<String> {
        self.port_ids
            .get(&handle)
            .filter(|entry| entry.0 == direction)
            .map(|entry| entry.1.clone())
    }

    /// Forget ports of `direction` that are no longer enumerated
    fn retain_seen(&self, direction: Direction, seen: &HashSet<String>) {
        self.handles
            .retain(|key, _| key.0 != direction || seen.contains(&key.1));
        self.port_ids
            .retain(|_, entry| entry.0 != direction || seen.contains(&entry.1));
    }

    fn client_names(&self) -> Vec<String> {
        self.clients.lock().values().map(|c| c.name.clone()).collect()
    }

    /// Turn raw `(port id, name)` pairs into descriptors, skipping the ports
    /// our own clients created
    fn describe_ports(&self, direction: Direction, ports: Vec<(String, Option<String>)>) -> Vec<EndpointDescriptor> {
        let own = self.client_names();
        let ports: Vec<(String, Option<String>)> = ports
            .into_iter()
            .filter(|(_, name)| !name.as_deref().is_some_and(|n| is_own_port(n, &own)))
            .collect();

        let seen: HashSet<String> = ports.iter().map(|(id, _)| id.clone()).collect();
        self.retain_seen(direction, &seen);

        ports
            .into_iter()
            .map(|(id, name)| {
                let handle = self.handle_for(direction, id);
                match name {
                    Some(name) => EndpointDescriptor::new(handle, name),
                    None => EndpointDescriptor::unnamed(handle),
                }
            })
            .collect()
    }

    fn client_info(&self, client: ClientHandle) -> Option<(String, Arc<dyn TransportListener>)> {
        self.clients
            .lock()
            .get(&client)
            .map(|c| (c.name.clone(), c.listener.clone()))
    }

    fn create_port(&self, client: ClientHandle, name: &str, connections: PortConnections) -> Result<PortHandle> {
        if self.client_info(client).is_none() {
            return Err(Error::PortAllocation(format!("unknown client {:?}", client)));
        }
        let port = PortHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.ports.lock().insert(
            port,
            PortEntry {
                client,
                name: name.to_string(),
                connections,
            },
        );
        debug!("Allocated MIDI port '{}' ({:?})", name, port);
        Ok(port)
    }

    fn open_input(
        &self,
        client_name: &str,
        port_name: &str,
        source: EndpointHandle,
        listener: Arc<dyn TransportListener>,
    ) -> Result<MidiInputConnection<()>> {
        let id = self
            .port_id(source, Direction::Input)
            .ok_or_else(|| Error::Transport(format!("unknown source {}", source)))?;

        let mut midi_in = MidiInput::new(client_name)?;
        // Deliver SysEx, timing and active sensing too
        midi_in.ignore(Ignore::None);

        let port = midi_in
            .find_port_by_id(id)
            .ok_or_else(|| Error::Transport(format!("source {} is gone", source)))?;

        let connection = midi_in.connect(
            &port,
            port_name,
            move |_timestamp, data, _| listener.received(source, data),
            (),
        )?;
        Ok(connection)
    }

    fn open_output(&self, client_name: &str, port_name: &str, destination: EndpointHandle) -> Result<MidiOutputConnection> {
        let id = self
            .port_id(destination, Direction::Output)
            .ok_or_else(|| Error::Transport(format!("unknown destination {}", destination)))?;

        let midi_out = MidiOutput::new(client_name)?;
        let port = midi_out
            .find_port_by_id(id)
            .ok_or_else(|| Error::Transport(format!("destination {} is gone", destination)))?;

        Ok(midi_out.connect(&port, port_name)?)
    }

    fn spawn_watcher(&self, name: &str, listener: Arc<dyn TransportListener>) -> Option<Watcher> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let interval = self.poll_interval;
        let scanner_name = format!("{}-watcher", name);
        let own = vec![name.to_string()];

        let spawned = thread::Builder::new()
            .name("midi-hotplug".to_string())
            .spawn(move || {
                let (midi_in, midi_out) = match (MidiInput::new(&scanner_name), MidiOutput::new(&scanner_name)) {
                    (Ok(i), Ok(o)) => (i, o),
                    (Err(e), _) => {
                        warn!("MIDI device watcher disabled: {}", e);
                        return;
                    }
                    (_, Err(e)) => {
                        warn!("MIDI device watcher disabled: {}", e);
                        return;
                    }
                };

                let mut last = visible_port_ids(&midi_in, &midi_out, &own);
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }

                    let current = visible_port_ids(&midi_in, &midi_out, &own);
                    if current != last {
                        info!("MIDI ports changed ({} -> {} endpoints)", last.len(), current.len());
                        last = current;
                        listener.device_list_changed();
                    }
                }
                trace!("MIDI device watcher stopped");
            });

        match spawned {
            Ok(thread) => Some(Watcher { stop_tx, thread }),
            Err(e) => {
                warn!("Failed to spawn MIDI device watcher: {}", e);
                None
            }
        }
    }
}

/// Whether a port name belongs to one of `clients`.
///
/// ALSA lists the ports midir opens for our own connections as
/// `client:port`; they must not count as devices.
fn is_own_port(port_name: &str, clients: &[String]) -> bool {
    clients.iter().any(|client| {
        port_name == client
            || port_name
                .strip_prefix(client.as_str())
                .is_some_and(|rest| rest.starts_with(':'))
    })
}

fn visible_port_ids(midi_in: &MidiInput, midi_out: &MidiOutput, own: &[String]) -> BTreeSet<(Direction, String)> {
    let keep = |name: Option<String>| !name.is_some_and(|n| is_own_port(&n, own));

    let inputs = midi_in
        .ports()
        .into_iter()
        .filter(|p| keep(midi_in.port_name(p).ok()))
        .map(|p| (Direction::Input, p.id()));
    let outputs = midi_out
        .ports()
        .into_iter()
        .filter(|p| keep(midi_out.port_name(p).ok()))
        .map(|p| (Direction::Output, p.id()));
    inputs.chain(outputs).collect()
}

impl MidiTransport for MidirTransport {
    fn create_client(&self, name: &str, listener: Arc<dyn TransportListener>) -> Result<ClientHandle> {
        // Touch the backend so a missing MIDI service fails here, not on first use
        MidiInput::new(name)?;
        MidiOutput::new(name)?;

        let client = ClientHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        let watcher = self.spawn_watcher(name, listener.clone());
        self.clients.lock().insert(
            client,
            ClientEntry {
                name: name.to_string(),
                listener,
                watcher,
            },
        );
        info!("MIDI client '{}' registered", name);
        Ok(client)
    }

    fn dispose_client(&self, client: ClientHandle) {
        let owned: Vec<PortEntry> = {
            let mut ports = self.ports.lock();
            let handles: Vec<PortHandle> = ports
                .iter()
                .filter(|(_, p)| p.client == client)
                .map(|(h, _)| *h)
                .collect();
            handles.into_iter().filter_map(|h| ports.remove(&h)).collect()
        };
        // Closing connections joins midir's callback threads; do it unlocked
        drop(owned);

        let entry = self.clients.lock().remove(&client);
        if let Some(mut entry) = entry {
            if let Some(watcher) = entry.watcher.take() {
                watcher.shutdown();
            }
            debug!("MIDI client '{}' disposed", entry.name);
        }
    }

    fn create_input_port(&self, client: ClientHandle, name: &str) -> Result<PortHandle> {
        self.create_port(client, name, PortConnections::Input(HashMap::new()))
    }

    fn create_output_port(&self, client: ClientHandle, name: &str) -> Result<PortHandle> {
        self.create_port(client, name, PortConnections::Output(HashMap::new()))
    }

    fn dispose_port(&self, port: PortHandle) {
        let entry = self.ports.lock().remove(&port);
        if let Some(entry) = entry {
            debug!("Disposed MIDI port '{}'", entry.name);
        }
    }

    fn connect_sources(&self, port: PortHandle, sources: &[EndpointHandle]) -> Result<()> {
        let (client, port_name, mut current) = {
            let mut ports = self.ports.lock();
            let entry = ports.get_mut(&port).ok_or(Error::TransportUnavailable)?;
            let PortConnections::Input(connections) = &mut entry.connections else {
                return Err(Error::Transport(format!("{:?} is not an input port", port)));
            };
            (entry.client, entry.name.clone(), std::mem::take(connections))
        };
        let (client_name, listener) = self.client_info(client).ok_or(Error::TransportUnavailable)?;

        // Drop connections to sources that went away
        current.retain(|source, _| sources.contains(source));

        let mut first_error = None;
        for &source in sources {
            if current.contains_key(&source) {
                continue;
            }
            match self.open_input(&client_name, &port_name, source, listener.clone()) {
                Ok(connection) => {
                    debug!("Connected MIDI source {}", source);
                    current.insert(source, connection);
                }
                Err(e) => {
                    warn!("Failed to connect MIDI source {}: {}", source, e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        let mut ports = self.ports.lock();
        match ports.get_mut(&port) {
            Some(PortEntry {
                connections: PortConnections::Input(connections),
                ..
            }) => *connections = current,
            // Disposed while connecting; `current` closes on drop
            _ => return Err(Error::TransportUnavailable),
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn enumerate_sources(&self) -> Vec<EndpointDescriptor> {
        let midi_in = match MidiInput::new("midi-device-manager-scan") {
            Ok(midi_in) => midi_in,
            Err(e) => {
                warn!("Failed to enumerate MIDI sources: {}", e);
                return Vec::new();
            }
        };

        let ports = midi_in
            .ports()
            .iter()
            .map(|port| (port.id(), midi_in.port_name(port).ok()))
            .collect();
        self.describe_ports(Direction::Input, ports)
    }

    fn enumerate_destinations(&self) -> Vec<EndpointDescriptor> {
        let midi_out = match MidiOutput::new("midi-device-manager-scan") {
            Ok(midi_out) => midi_out,
            Err(e) => {
                warn!("Failed to enumerate MIDI destinations: {}", e);
                return Vec::new();
            }
        };

        let ports = midi_out
            .ports()
            .iter()
            .map(|port| (port.id(), midi_out.port_name(port).ok()))
            .collect();
        self.describe_ports(Direction::Output, ports)
    }

    fn send_bytes(&self, port: PortHandle, destination: EndpointHandle, data: &[u8]) -> Result<()> {
        let client_name = {
            let ports = self.ports.lock();
            let entry = ports.get(&port).ok_or(Error::TransportUnavailable)?;
            self.client_info(entry.client)
                .map(|(name, _)| name)
                .ok_or(Error::TransportUnavailable)?
        };

        let mut ports = self.ports.lock();
        let entry = ports.get_mut(&port).ok_or(Error::TransportUnavailable)?;
        let port_name = entry.name.clone();
        let PortConnections::Output(connections) = &mut entry.connections else {
            return Err(Error::TransportUnavailable);
        };

        if !connections.contains_key(&destination) {
            let connection = self.open_output(&client_name, &port_name, destination)?;
            debug!("Opened MIDI output connection to {}", destination);
            connections.insert(destination, connection);
        }

        let Some(connection) = connections.get_mut(&destination) else {
            return Err(Error::TransportUnavailable);
        };
        if let Err(e) = connection.send(data) {
            // Reconnect on the next send
            connections.remove(&destination);
            return Err(e.into());
        }
        trace!("Sent {} bytes to {}", data.len(), destination);
        Ok(())
    }
}

impl Drop for MidirTransport {
    fn drop(&mut self) {
        let clients: Vec<ClientHandle> = self.clients.lock().keys().copied().collect();
        for client in clients {
            self.dispose_client(client);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Quiet;

    impl TransportListener for Quiet {
        fn device_list_changed(&self) {}
        fn received(&self, _source: EndpointHandle, _data: &[u8]) {}
    }

    #[test]
    fn test_enumeration_without_hardware_does_not_panic() {
        // May be empty on CI machines without a MIDI backend
        let transport = MidirTransport::new();
        let sources = transport.enumerate_sources();
        let destinations = transport.enumerate_destinations();
        println!("Found {} sources, {} destinations", sources.len(), destinations.len());
    }

    #[test]
    fn test_handles_are_stable_per_port_id() {
        let transport = MidirTransport::new();
        let a = transport.handle_for(Direction::Output, "dev:0".into());
        let b = transport.handle_for(Direction::Output, "dev:0".into());
        let c = transport.handle_for(Direction::Input, "dev:0".into());

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(transport.port_id(a, Direction::Output).as_deref(), Some("dev:0"));
        assert_eq!(transport.port_id(a, Direction::Input), None);
    }

    #[test]
    fn test_vanished_port_ids_are_pruned() {
        let transport = MidirTransport::new();
        let kept = transport.handle_for(Direction::Output, "dev:0".into());
        let gone = transport.handle_for(Direction::Output, "dev:1".into());
        let input = transport.handle_for(Direction::Input, "dev:1".into());

        let seen: HashSet<String> = ["dev:0".to_string()].into_iter().collect();
        transport.retain_seen(Direction::Output, &seen);

        assert_eq!(transport.port_id(gone, Direction::Output), None);
        assert_eq!(transport.port_id(input, Direction::Input).as_deref(), Some("dev:1"));
        assert_eq!(transport.handle_for(Direction::Output, "dev:0".into()), kept);
        assert_eq!(transport.handles.len(), 2);
        assert_eq!(transport.port_ids.len(), 2);
    }

    #[test]
    fn test_own_ports_are_recognized() {
        let own = vec!["LaunchControl".to_string()];

        assert!(is_own_port("LaunchControl:LaunchControl Input 128:0", &own));
        assert!(is_own_port("LaunchControl", &own));
        assert!(!is_own_port("LaunchControl XL:LaunchControl XL MIDI 1 24:0", &own));
        assert!(!is_own_port("Synth A", &own));
        assert!(!is_own_port("Synth A", &[]));
    }

    #[test]
    fn test_unknown_handles_are_harmless() {
        let transport = MidirTransport::new();

        transport.dispose_port(PortHandle(42));
        transport.dispose_client(ClientHandle(42));
        assert_eq!(
            transport.send_bytes(PortHandle(42), EndpointHandle(1), &[0xF8]),
            Err(Error::TransportUnavailable)
        );
        assert!(transport.create_input_port(ClientHandle(42), "in").is_err());
    }

    #[test]
    fn test_client_lifecycle_when_backend_available() {
        let transport = MidirTransport::with_poll_interval(Duration::from_millis(20));
        let Ok(client) = transport.create_client("midi-device-manager-test", Arc::new(Quiet)) else {
            // No MIDI backend on this machine
            return;
        };
        let input = transport.create_input_port(client, "test in").unwrap();
        let output = transport.create_output_port(client, "test out").unwrap();

        assert!(transport.connect_sources(input, &[]).is_ok());
        assert!(transport.send_bytes(input, EndpointHandle(999), &[0xF8]).is_err());
        assert!(transport.send_bytes(output, EndpointHandle(999), &[0xF8]).is_err());

        transport.dispose_client(client);
        assert!(transport.send_bytes(output, EndpointHandle(999), &[0xF8]).is_err());
    }
}
