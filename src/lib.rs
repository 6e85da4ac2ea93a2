//! Name-addressable MIDI device manager
//!
//! Discovers MIDI sources and destinations, keeps a registry of display names,
//! routes outbound bytes to a device by name and delivers inbound messages,
//! tagged with their device name, to a single consumer handler.
//!
//! ```no_run
//! use std::sync::Arc;
//! use midi_device_manager::{MidiDeviceManager, VirtualTransport};
//!
//! let transport = Arc::new(VirtualTransport::new());
//! transport.add_destination("Synth A");
//!
//! let manager = MidiDeviceManager::new(transport, Some("LaunchControl"));
//! manager.set_input_handler(|device: &str, data: &[u8]| {
//!     println!("{}: {:02X?}", device, data);
//! });
//! manager.start()?;
//! manager.send_data_to_device_named(&[0x90, 0x3C, 0x7F], "Synth A");
//! # Ok::<(), midi_device_manager::Error>(())
//! ```

pub mod config;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod hex;
pub mod manager;
pub mod registry;
pub mod router;
pub mod transport;

pub use config::ManagerConfig;
pub use dispatch::{DeviceListHandler, InputHandler};
pub use endpoint::{Direction, EndpointHandle, EndpointRecord};
pub use error::{Error, Result};
pub use executor::{Executor, InlineExecutor, MainQueue, MainQueueExecutor, SerialQueue, TokioExecutor};
pub use manager::{LifecycleState, MidiDeviceManager};
pub use registry::RegistrySnapshot;
#[cfg(feature = "midir")]
pub use transport::MidirTransport;
pub use transport::{MidiTransport, TransportListener, VirtualTransport};
