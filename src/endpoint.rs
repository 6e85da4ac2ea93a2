//! Endpoint identifiers and records

use std::fmt;

/// Opaque, transport-assigned identifier for a MIDI source or destination.
///
/// Handles are plain lookup keys. They carry no ownership and are not
/// guaranteed to survive a device reconnect or a client restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointHandle(pub u64);

impl EndpointHandle {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EndpointHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:08X}", self.0)
    }
}

/// Endpoint direction as seen from the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    /// A MIDI source (device -> application)
    Input,
    /// A MIDI destination (application -> device)
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => write!(f, "input"),
            Direction::Output => write!(f, "output"),
        }
    }
}

/// What a transport reports for one endpoint during enumeration.
///
/// `name` is `None` when the driver exposes no display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub handle: EndpointHandle,
    pub name: Option<String>,
}

impl EndpointDescriptor {
    pub fn new(handle: EndpointHandle, name: impl Into<String>) -> Self {
        Self {
            handle,
            name: Some(name.into()),
        }
    }

    pub fn unnamed(handle: EndpointHandle) -> Self {
        Self { handle, name: None }
    }
}

/// A resolved registry entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointRecord {
    pub display_name: String,
    pub handle: EndpointHandle,
    pub direction: Direction,
}

/// Placeholder name for an endpoint the transport left unnamed.
///
/// `position` is the endpoint's index in the enumeration it came from.
pub fn placeholder_name(direction: Direction, position: usize) -> String {
    match direction {
        Direction::Input => format!("Unnamed Source {}", position + 1),
        Direction::Output => format!("Unnamed Destination {}", position + 1),
    }
}

/// Name used for inbound data whose source is no longer in the registry
pub fn fallback_source_name(handle: EndpointHandle) -> String {
    format!("Unknown Source {}", handle)
}
