//! Transport boundary
//!
//! The manager talks to the platform MIDI stack only through [`MidiTransport`].
//! Implementations deliver device-change notifications and inbound data through
//! a [`TransportListener`] from whatever threads they own.

use std::sync::Arc;

use crate::endpoint::{EndpointDescriptor, EndpointHandle};
use crate::error::Result;

#[cfg(feature = "midir")]
pub mod hardware;
pub mod virtual_port;

#[cfg(feature = "midir")]
pub use hardware::MidirTransport;
pub use virtual_port::VirtualTransport;

/// Identifies a registered client session with the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientHandle(pub u64);

/// Identifies a port allocated under a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortHandle(pub u64);

/// Callbacks a transport raises on its own threads.
///
/// Implementations must return quickly; the transport's delivery thread is
/// blocked for the duration of the call.
pub trait TransportListener: Send + Sync {
    /// The set of visible endpoints changed (device plugged or unplugged)
    fn device_list_changed(&self);

    /// Bytes arrived from `source` on an input port owned by this listener's client
    fn received(&self, source: EndpointHandle, data: &[u8]);
}

/// Platform MIDI transport primitive.
///
/// Every method is bounded-time. Operations on unknown or disposed handles
/// must be harmless: no-ops or an `Err`, never a panic.
pub trait MidiTransport: Send + Sync {
    /// Register a client session. `listener` receives notifications until
    /// the client is disposed.
    fn create_client(&self, name: &str, listener: Arc<dyn TransportListener>) -> Result<ClientHandle>;

    /// Tear down a client and everything allocated under it. After this
    /// returns, the client's listener is never called again.
    fn dispose_client(&self, client: ClientHandle);

    fn create_input_port(&self, client: ClientHandle, name: &str) -> Result<PortHandle>;

    fn create_output_port(&self, client: ClientHandle, name: &str) -> Result<PortHandle>;

    fn dispose_port(&self, port: PortHandle);

    /// Make `sources` the exact set of sources feeding input `port`
    fn connect_sources(&self, port: PortHandle, sources: &[EndpointHandle]) -> Result<()>;

    /// All currently visible sources, in transport enumeration order
    fn enumerate_sources(&self) -> Vec<EndpointDescriptor>;

    /// All currently visible destinations, in transport enumeration order
    fn enumerate_destinations(&self) -> Vec<EndpointDescriptor>;

    /// Hand `data` to `destination` through output `port`
    fn send_bytes(&self, port: PortHandle, destination: EndpointHandle, data: &[u8]) -> Result<()>;
}
