//! In-process MIDI transport
//!
//! Endpoints are plain entries in a list: plug, unplug and inject inbound
//! data from code. Every successful send is recorded. Used by the test suite
//! and by `--virtual` on the CLI to exercise the manager without hardware.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use super::{ClientHandle, MidiTransport, PortHandle, TransportListener};
use crate::endpoint::{EndpointDescriptor, EndpointHandle};
use crate::error::{Error, Result};

/// A message that reached a virtual destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub port: PortHandle,
    pub destination: EndpointHandle,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortKind {
    Input,
    Output,
}

struct ClientEntry {
    name: String,
    listener: Arc<dyn TransportListener>,
}

struct PortEntry {
    client: ClientHandle,
    kind: PortKind,
    sources: Vec<EndpointHandle>,
}

#[derive(Default)]
struct State {
    sources: Vec<EndpointDescriptor>,
    destinations: Vec<EndpointDescriptor>,
    clients: HashMap<ClientHandle, ClientEntry>,
    ports: HashMap<PortHandle, PortEntry>,
    sent: Vec<SentMessage>,
    fail_next_client: bool,
}

/// In-memory [`MidiTransport`]
pub struct VirtualTransport {
    state: Mutex<State>,
    next_id: AtomicU64,
    send_calls: AtomicUsize,
}

impl Default for VirtualTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            next_id: AtomicU64::new(0x1000),
            send_calls: AtomicUsize::new(0),
        }
    }

    fn next_handle(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    // =========================================================================
    // Endpoint setup (silent: call `notify_device_list_changed` to announce)
    // =========================================================================

    /// Add a named source and return its handle
    pub fn add_source(&self, name: &str) -> EndpointHandle {
        let handle = EndpointHandle(self.next_handle());
        self.state.lock().sources.push(EndpointDescriptor::new(handle, name));
        handle
    }

    /// Add a source the transport reports without a name
    pub fn add_unnamed_source(&self) -> EndpointHandle {
        let handle = EndpointHandle(self.next_handle());
        self.state.lock().sources.push(EndpointDescriptor::unnamed(handle));
        handle
    }

    /// Add a named destination and return its handle
    pub fn add_destination(&self, name: &str) -> EndpointHandle {
        let handle = EndpointHandle(self.next_handle());
        self.state.lock().destinations.push(EndpointDescriptor::new(handle, name));
        handle
    }

    /// Add a destination the transport reports without a name
    pub fn add_unnamed_destination(&self) -> EndpointHandle {
        let handle = EndpointHandle(self.next_handle());
        self.state
            .lock()
            .destinations
            .push(EndpointDescriptor::unnamed(handle));
        handle
    }

    /// Remove an endpoint from both directions. Returns whether it existed.
    pub fn remove_endpoint(&self, handle: EndpointHandle) -> bool {
        let mut state = self.state.lock();
        let before = state.sources.len() + state.destinations.len();
        state.sources.retain(|d| d.handle != handle);
        state.destinations.retain(|d| d.handle != handle);
        before != state.sources.len() + state.destinations.len()
    }

    /// Raise `device_list_changed` on every live client
    pub fn notify_device_list_changed(&self) {
        let listeners: Vec<Arc<dyn TransportListener>> = self
            .state
            .lock()
            .clients
            .values()
            .map(|c| c.listener.clone())
            .collect();

        debug!("Virtual transport: device list changed ({} clients)", listeners.len());
        for listener in listeners {
            listener.device_list_changed();
        }
    }

    /// Deliver `data` from `source` to every input port connected to it.
    ///
    /// Returns the number of listeners that received the data.
    pub fn inject(&self, source: EndpointHandle, data: &[u8]) -> usize {
        let listeners: Vec<Arc<dyn TransportListener>> = {
            let state = self.state.lock();
            state
                .ports
                .values()
                .filter(|p| p.kind == PortKind::Input && p.sources.contains(&source))
                .filter_map(|p| state.clients.get(&p.client))
                .map(|c| c.listener.clone())
                .collect()
        };

        trace!("Virtual transport: inject {} bytes from {}", data.len(), source);
        for listener in &listeners {
            listener.received(source, data);
        }
        listeners.len()
    }

    /// Make the next `create_client` call fail
    pub fn fail_next_client(&self) {
        self.state.lock().fail_next_client = true;
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Messages that were accepted by a destination, oldest first
    pub fn sent(&self) -> Vec<SentMessage> {
        self.state.lock().sent.clone()
    }

    /// Messages delivered to one destination
    pub fn sent_to(&self, destination: EndpointHandle) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|m| m.destination == destination)
            .map(|m| m.data.clone())
            .collect()
    }

    /// Number of `send_bytes` calls, successful or not
    pub fn send_calls(&self) -> usize {
        self.send_calls.load(Ordering::SeqCst)
    }

    pub fn live_clients(&self) -> usize {
        self.state.lock().clients.len()
    }

    pub fn live_ports(&self) -> usize {
        self.state.lock().ports.len()
    }

    /// Name the client was registered with, if it is still alive
    pub fn client_name(&self, client: ClientHandle) -> Option<String> {
        self.state.lock().clients.get(&client).map(|c| c.name.clone())
    }

    /// Names of every live client
    pub fn client_names(&self) -> Vec<String> {
        self.state.lock().clients.values().map(|c| c.name.clone()).collect()
    }

    /// Sources currently feeding an input port
    pub fn connected_sources(&self, port: PortHandle) -> Vec<EndpointHandle> {
        self.state
            .lock()
            .ports
            .get(&port)
            .map(|p| p.sources.clone())
            .unwrap_or_default()
    }

    fn create_port(&self, client: ClientHandle, kind: PortKind) -> Result<PortHandle> {
        let mut state = self.state.lock();
        if !state.clients.contains_key(&client) {
            return Err(Error::PortAllocation(format!("unknown client {:?}", client)));
        }
        let port = PortHandle(self.next_handle());
        state.ports.insert(
            port,
            PortEntry {
                client,
                kind,
                sources: Vec::new(),
            },
        );
        Ok(port)
    }
}

impl MidiTransport for VirtualTransport {
    fn create_client(&self, name: &str, listener: Arc<dyn TransportListener>) -> Result<ClientHandle> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_client) {
            return Err(Error::ClientCreation(format!("virtual client '{}' refused", name)));
        }
        let client = ClientHandle(self.next_handle());
        state.clients.insert(
            client,
            ClientEntry {
                name: name.to_string(),
                listener,
            },
        );
        debug!("Virtual transport: created client '{}'", name);
        Ok(client)
    }

    fn dispose_client(&self, client: ClientHandle) {
        let mut state = self.state.lock();
        state.ports.retain(|_, p| p.client != client);
        if let Some(entry) = state.clients.remove(&client) {
            debug!("Virtual transport: disposed client '{}'", entry.name);
        }
    }

    fn create_input_port(&self, client: ClientHandle, _name: &str) -> Result<PortHandle> {
        self.create_port(client, PortKind::Input)
    }

    fn create_output_port(&self, client: ClientHandle, _name: &str) -> Result<PortHandle> {
        self.create_port(client, PortKind::Output)
    }

    fn dispose_port(&self, port: PortHandle) {
        self.state.lock().ports.remove(&port);
    }

    fn connect_sources(&self, port: PortHandle, sources: &[EndpointHandle]) -> Result<()> {
        let mut state = self.state.lock();
        let known: Vec<EndpointHandle> = sources
            .iter()
            .copied()
            .filter(|h| state.sources.iter().any(|d| d.handle == *h))
            .collect();

        match state.ports.get_mut(&port) {
            Some(entry) if entry.kind == PortKind::Input => {
                entry.sources = known;
                Ok(())
            }
            _ => Err(Error::TransportUnavailable),
        }
    }

    fn enumerate_sources(&self) -> Vec<EndpointDescriptor> {
        self.state.lock().sources.clone()
    }

    fn enumerate_destinations(&self) -> Vec<EndpointDescriptor> {
        self.state.lock().destinations.clone()
    }

    fn send_bytes(&self, port: PortHandle, destination: EndpointHandle, data: &[u8]) -> Result<()> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock();
        match state.ports.get(&port) {
            Some(entry) if entry.kind == PortKind::Output => {}
            _ => return Err(Error::TransportUnavailable),
        }
        if !state.destinations.iter().any(|d| d.handle == destination) {
            return Err(Error::Transport(format!("no such destination {}", destination)));
        }

        state.sent.push(SentMessage {
            port,
            destination,
            data: data.to_vec(),
        });
        Ok(())
    }
}
