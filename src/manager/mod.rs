//! MIDI device manager
//!
//! Public facade over the registry, router and dispatcher, and owner of the
//! client lifecycle:
//!
//! ```text
//! Stopped -> Starting -> Running -> Stopping -> Stopped
//! ```
//!
//! `reset_midi_client` runs `Stopping -> Starting` back to back. Handlers,
//! the execution context and the size policy are not transport resources and
//! survive every transition.


use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

use crate::config::ManagerConfig;
use crate::dispatch::{DeviceListHandler, InboundDispatcher, InputHandler};
use crate::endpoint::EndpointHandle;
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::registry::{EndpointRegistry, RegistrySnapshot};
use crate::router::{MessageRouter, DEFAULT_MAX_PACKET_SIZE};
use crate::transport::{ClientHandle, MidiTransport, PortHandle, TransportListener};

/// Client lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Transport resources owned by one start/stop cycle
#[derive(Debug, Clone, Copy)]
struct Session {
    id: u64,
    client: ClientHandle,
    input_port: PortHandle,
    output_port: PortHandle,
}

struct Inner {
    transport: Arc<dyn MidiTransport>,
    client_name: String,
    registry: EndpointRegistry,
    router: MessageRouter,
    dispatcher: InboundDispatcher,

    // Sends and rescans hold the read side; stop takes the write side to
    // fence them before the client is disposed
    session: RwLock<Option<Session>>,
    state: RwLock<LifecycleState>,
    // Serializes start/stop/reset
    lifecycle: Mutex<()>,

    debug_logging: AtomicBool,
    next_session: AtomicU64,
}

/// Routes transport callbacks for one session back to the manager.
///
/// Holds a weak reference so a transport that leaks its listener does not
/// keep the manager alive.
struct SessionListener {
    inner: Weak<Inner>,
    session_id: u64,
}

impl TransportListener for SessionListener {
    fn device_list_changed(&self) {
        if let Some(inner) = self.inner.upgrade() {
            info!("MIDI device list changed, rescanning");
            inner.rescan(Some(self.session_id));
        }
    }

    fn received(&self, source: EndpointHandle, data: &[u8]) {
        if let Some(inner) = self.inner.upgrade() {
            inner.dispatcher.dispatch(&inner.registry, source, data);
        }
    }
}

fn generated_client_name() -> String {
    format!("MIDIDeviceManager-{}", std::process::id())
}

impl Inner {
    fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    fn set_state(&self, state: LifecycleState) {
        debug!("MIDI client state -> {:?}", state);
        *self.state.write() = state;
    }

    /// Rescan while a session is live. With `expected`, only for that session.
    fn rescan(&self, expected: Option<u64>) {
        let outcome = {
            let session = self.session.read();
            let Some(session) = session.as_ref() else {
                debug!("Rescan skipped: MIDI client not running");
                return;
            };
            if expected.is_some_and(|id| id != session.id) {
                debug!("Rescan skipped: notification from a previous session");
                return;
            }

            let outcome = self.registry.rescan(self.transport.as_ref());
            if let Err(e) = self
                .transport
                .connect_sources(session.input_port, &outcome.snapshot.source_handles())
            {
                warn!("Failed to connect MIDI sources: {}", e);
            }
            outcome
        };

        if outcome.changed {
            self.dispatcher.notify_device_list(
                outcome.snapshot.generation(),
                outcome.snapshot.connected_devices(),
            );
        }
    }

    fn start_locked(self: &Arc<Self>) -> Result<()> {
        match self.state() {
            LifecycleState::Running | LifecycleState::Starting => {
                debug!("MIDI client already running");
                return Ok(());
            }
            LifecycleState::Stopped | LifecycleState::Stopping => {}
        }

        self.set_state(LifecycleState::Starting);

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let listener = Arc::new(SessionListener {
            inner: Arc::downgrade(self),
            session_id: id,
        });

        let session = match self.open_session(id, listener) {
            Ok(session) => session,
            Err(e) => {
                error!(fatal = true, "Failed to start MIDI client '{}': {}", self.client_name, e);
                self.set_state(LifecycleState::Stopped);
                return Err(e);
            }
        };

        *self.session.write() = Some(session);
        self.rescan(Some(id));
        self.set_state(LifecycleState::Running);

        info!(
            "MIDI client '{}' started ({} outputs available)",
            self.client_name,
            self.registry.connected_devices().len()
        );
        Ok(())
    }

    fn open_session(&self, id: u64, listener: Arc<SessionListener>) -> Result<Session> {
        let client = self.transport.create_client(&self.client_name, listener)?;

        let input_port = match self
            .transport
            .create_input_port(client, &format!("{} Input", self.client_name))
        {
            Ok(port) => port,
            Err(e) => {
                self.transport.dispose_client(client);
                return Err(e);
            }
        };

        let output_port = match self
            .transport
            .create_output_port(client, &format!("{} Output", self.client_name))
        {
            Ok(port) => port,
            Err(e) => {
                self.transport.dispose_port(input_port);
                self.transport.dispose_client(client);
                return Err(e);
            }
        };

        Ok(Session {
            id,
            client,
            input_port,
            output_port,
        })
    }

    fn stop_locked(&self) {
        if self.state() == LifecycleState::Stopped {
            debug!("MIDI client already stopped");
            return;
        }

        self.set_state(LifecycleState::Stopping);

        // Waits for in-flight sends and rescans; later ones see no session
        let session = self.session.write().take();
        if let Some(session) = session {
            self.transport.dispose_port(session.input_port);
            self.transport.dispose_port(session.output_port);
            self.transport.dispose_client(session.client);
        }

        let outcome = self.registry.clear();
        self.set_state(LifecycleState::Stopped);
        info!("MIDI client '{}' stopped", self.client_name);

        if outcome.changed {
            self.dispatcher
                .notify_device_list(outcome.snapshot.generation(), Vec::new());
        }
    }

    fn send_to_name(&self, data: &[u8], name: &str) -> Result<()> {
        let session = self.session.read();
        let Some(session) = session.as_ref() else {
            debug!("Send to '{}' dropped: MIDI client not running", name);
            return Err(Error::TransportUnavailable);
        };
        self.router
            .send_to_name(
                &self.registry,
                self.transport.as_ref(),
                session.output_port,
                name,
                data,
            )
            .map(|_| ())
    }

    fn send_to_endpoint(&self, data: &[u8], endpoint: EndpointHandle) -> Result<()> {
        let session = self.session.read();
        let Some(session) = session.as_ref() else {
            debug!("Send to {} dropped: MIDI client not running", endpoint);
            return Err(Error::TransportUnavailable);
        };
        self.router.send_to_endpoint(
            &self.registry,
            self.transport.as_ref(),
            session.output_port,
            endpoint,
            data,
        )
    }
}

/// Name-addressable MIDI endpoint registry and router.
///
/// All methods take `&self`; share the manager across threads with an `Arc`.
/// Dropping the manager stops the client.
pub struct MidiDeviceManager {
    inner: Arc<Inner>,
}

impl MidiDeviceManager {
    /// Create a stopped manager. `client_name` defaults to a generated one.
    pub fn new(transport: Arc<dyn MidiTransport>, client_name: Option<&str>) -> Self {
        Self::with_dispatcher(transport, client_name, InboundDispatcher::default())
    }

    /// Create a stopped manager that delivers handler calls on `executor`
    pub fn with_executor(
        transport: Arc<dyn MidiTransport>,
        client_name: Option<&str>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self::with_dispatcher(transport, client_name, InboundDispatcher::new(executor))
    }

    /// Create a stopped manager configured from `config`
    pub fn from_config(transport: Arc<dyn MidiTransport>, config: &ManagerConfig) -> Self {
        let manager = Self::new(transport, config.client_name.as_deref());
        manager.set_max_midi_packet_data_size(config.max_packet_size);
        if config.debug_logging {
            manager.enable_debug_logging();
        }
        manager
    }

    fn with_dispatcher(
        transport: Arc<dyn MidiTransport>,
        client_name: Option<&str>,
        dispatcher: InboundDispatcher,
    ) -> Self {
        let client_name = client_name
            .map(str::to_string)
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(generated_client_name);

        Self {
            inner: Arc::new(Inner {
                transport,
                client_name,
                registry: EndpointRegistry::new(),
                router: MessageRouter::new(DEFAULT_MAX_PACKET_SIZE),
                dispatcher,
                session: RwLock::new(None),
                state: RwLock::new(LifecycleState::Stopped),
                lifecycle: Mutex::new(()),
                debug_logging: AtomicBool::new(false),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    pub fn client_name(&self) -> &str {
        &self.inner.client_name
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create the client and ports, subscribe to device changes and scan.
    ///
    /// No-op when already running. On failure the manager stays `Stopped`
    /// and `start` may be retried.
    pub fn start(&self) -> Result<()> {
        let _guard = self.inner.lifecycle.lock();
        self.inner.start_locked()
    }

    /// Dispose ports and client and clear the registry. Safe when stopped.
    pub fn stop(&self) {
        let _guard = self.inner.lifecycle.lock();
        self.inner.stop_locked();
    }

    /// Tear the client down and build it again, keeping handlers and policy
    pub fn reset_midi_client(&self) -> Result<()> {
        let _guard = self.inner.lifecycle.lock();
        info!("Resetting MIDI client '{}'", self.inner.client_name);
        self.inner.stop_locked();
        self.inner.start_locked()
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.state()
    }

    pub fn is_running(&self) -> bool {
        self.inner.state() == LifecycleState::Running
    }

    /// Re-enumerate endpoints now. No-op while stopped.
    pub fn rescan_devices(&self) {
        self.inner.rescan(None);
    }

    // =========================================================================
    // Device listing and resolution
    // =========================================================================

    /// Output device names from the most recently completed scan
    pub fn connected_devices(&self) -> Vec<String> {
        self.inner.registry.connected_devices()
    }

    /// Input names followed by output names, duplicates kept
    pub fn all_midi_device_names(&self) -> Vec<String> {
        self.inner.registry.all_device_names()
    }

    /// The full current snapshot, for callers that need several consistent lookups
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.inner.registry.snapshot()
    }

    pub fn output_endpoint_for_device_named(&self, name: &str) -> Option<EndpointHandle> {
        self.inner.registry.resolve_output(name)
    }

    pub fn device_name_for_endpoint(&self, endpoint: EndpointHandle) -> Option<String> {
        self.inner.registry.resolve_name(endpoint)
    }

    /// Position of the named output in enumeration order, `None` when absent
    pub fn index_of_output_device_named(&self, name: &str) -> Option<usize> {
        self.inner.registry.index_of_output(name)
    }

    pub fn is_device_available(&self, name: &str) -> bool {
        self.inner.registry.is_available(name)
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Send to the output named `name` (exact, case-sensitive match).
    ///
    /// Unknown devices, oversized messages and a stopped client are logged
    /// and dropped.
    pub fn send_data_to_device_named(&self, data: &[u8], name: &str) {
        let _ = self.inner.send_to_name(data, name);
    }

    /// Send straight to an endpoint handle. The caller vouches for the handle;
    /// a stale one is a silent no-op.
    pub fn send_data_to_endpoint(&self, data: &[u8], endpoint: EndpointHandle) {
        let _ = self.inner.send_to_endpoint(data, endpoint);
    }

    /// Like [`send_data_to_device_named`](Self::send_data_to_device_named), reporting why a message was dropped
    pub fn try_send_data_to_device_named(&self, data: &[u8], name: &str) -> Result<()> {
        self.inner.send_to_name(data, name)
    }

    /// Like [`send_data_to_endpoint`](Self::send_data_to_endpoint), reporting why a message was dropped
    pub fn try_send_data_to_endpoint(&self, data: &[u8], endpoint: EndpointHandle) -> Result<()> {
        self.inner.send_to_endpoint(data, endpoint)
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    pub fn max_midi_packet_data_size(&self) -> usize {
        self.inner.router.max_packet_size()
    }

    pub fn set_max_midi_packet_data_size(&self, max: usize) {
        self.inner.router.set_max_packet_size(max);
    }

    /// Execution context for input and device-list handler calls
    pub fn set_dispatch_queue(&self, executor: Arc<dyn Executor>) {
        self.inner.dispatcher.set_executor(executor);
    }

    /// Log every packet in and out with a hex dump
    pub fn enable_debug_logging(&self) {
        self.set_debug_logging(true);
    }

    pub fn disable_debug_logging(&self) {
        self.set_debug_logging(false);
    }

    pub fn is_debug_logging_enabled(&self) -> bool {
        self.inner.debug_logging.load(Ordering::Relaxed)
    }

    fn set_debug_logging(&self, enabled: bool) {
        self.inner.debug_logging.store(enabled, Ordering::Relaxed);
        self.inner.router.set_debug_logging(enabled);
        self.inner.dispatcher.set_debug_logging(enabled);
        info!(
            "MIDI debug logging {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    // =========================================================================
    // Handlers
    // =========================================================================

    /// Receive `(device name, bytes)` for every inbound message. Replaces any
    /// previous handler.
    pub fn set_input_handler<H: InputHandler + 'static>(&self, handler: H) {
        let handler: Arc<dyn InputHandler> = Arc::new(handler);
        self.inner.dispatcher.set_input_handler(Some(handler));
    }

    pub fn remove_input_handler(&self) {
        self.inner.dispatcher.set_input_handler(None);
    }

    /// Receive the connected output list whenever a scan changes it
    pub fn set_device_list_did_change_handler<H: DeviceListHandler + 'static>(&self, handler: H) {
        let handler: Arc<dyn DeviceListHandler> = Arc::new(handler);
        self.inner.dispatcher.set_device_list_handler(Some(handler));
    }

    pub fn remove_device_list_did_change_handler(&self) {
        self.inner.dispatcher.set_device_list_handler(None);
    }
}

impl Drop for MidiDeviceManager {
    fn drop(&mut self) {
        self.stop();
    }
}
