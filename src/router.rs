//! Outbound message routing
//!
//! Resolves a target (display name or raw handle), applies the payload size
//! policy and hands the bytes to the transport. Nothing is queued or retried.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{debug, info, warn};

use crate::endpoint::EndpointHandle;
use crate::error::{Error, Result};
use crate::hex::hex_dump;
use crate::registry::EndpointRegistry;
use crate::transport::{MidiTransport, PortHandle};

/// Default upper bound for one outbound message, in bytes
pub const DEFAULT_MAX_PACKET_SIZE: usize = 4096;

/// Outbound path: name resolution, size policy, transport hand-off
pub struct MessageRouter {
    max_packet_size: AtomicUsize,
    debug_logging: AtomicBool,
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_SIZE)
    }
}

impl MessageRouter {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            max_packet_size: AtomicUsize::new(max_packet_size),
            debug_logging: AtomicBool::new(false),
        }
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size.load(Ordering::Acquire)
    }

    /// Applies to sends that start after this call
    pub fn set_max_packet_size(&self, max: usize) {
        self.max_packet_size.store(max, Ordering::Release);
        debug!("Max MIDI packet size set to {} bytes", max);
    }

    pub fn set_debug_logging(&self, enabled: bool) {
        self.debug_logging.store(enabled, Ordering::Relaxed);
    }

    fn check_size(&self, data: &[u8]) -> Result<()> {
        let max = self.max_packet_size();
        if data.len() > max {
            return Err(Error::OversizePayload {
                size: data.len(),
                max,
            });
        }
        Ok(())
    }

    /// Send to the output currently registered under `name`
    pub fn send_to_name(
        &self,
        registry: &EndpointRegistry,
        transport: &dyn MidiTransport,
        port: PortHandle,
        name: &str,
        data: &[u8],
    ) -> Result<EndpointHandle> {
        let Some(handle) = registry.resolve_output(name) else {
            warn!("MIDI output '{}' not found, message dropped", name);
            return Err(Error::DeviceNotFound(name.to_string()));
        };

        if let Err(e) = self.check_size(data) {
            warn!("Rejected message for '{}': {}", name, e);
            return Err(e);
        }

        self.forward(transport, port, handle, name, data)?;
        Ok(handle)
    }

    /// Send straight to `handle`; a stale handle is the transport's problem
    pub fn send_to_endpoint(
        &self,
        registry: &EndpointRegistry,
        transport: &dyn MidiTransport,
        port: PortHandle,
        handle: EndpointHandle,
        data: &[u8],
    ) -> Result<()> {
        if let Err(e) = self.check_size(data) {
            warn!("Rejected message for endpoint {}: {}", handle, e);
            return Err(e);
        }

        let label = registry
            .resolve_name(handle)
            .unwrap_or_else(|| handle.to_string());
        self.forward(transport, port, handle, &label, data)
    }

    fn forward(
        &self,
        transport: &dyn MidiTransport,
        port: PortHandle,
        handle: EndpointHandle,
        label: &str,
        data: &[u8],
    ) -> Result<()> {
        if self.debug_logging.load(Ordering::Relaxed) {
            info!(
                "MIDI OUT -> {} ({} bytes)\n{}",
                label,
                data.len(),
                hex_dump(data, 16).trim_end()
            );
        }

        transport.send_bytes(port, handle, data).map_err(|e| {
            debug!("Transport refused message for {}: {}", label, e);
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{TransportListener, VirtualTransport};
    use std::sync::Arc;

    struct Quiet;

    impl TransportListener for Quiet {
        fn device_list_changed(&self) {}
        fn received(&self, _source: EndpointHandle, _data: &[u8]) {}
    }

    fn setup() -> (VirtualTransport, EndpointRegistry, PortHandle) {
        let transport = VirtualTransport::new();
        let client = transport.create_client("router-test", Arc::new(Quiet)).unwrap();
        let port = transport.create_output_port(client, "out").unwrap();
        (transport, EndpointRegistry::new(), port)
    }

    #[test]
    fn test_size_boundary() {
        let (transport, registry, port) = setup();
        let synth = transport.add_destination("Synth");
        registry.rescan(&transport);
        let router = MessageRouter::new(8);

        assert!(router.send_to_name(&registry, &transport, port, "Synth", &[0u8; 8]).is_ok());
        assert_eq!(
            router.send_to_name(&registry, &transport, port, "Synth", &[0u8; 9]),
            Err(Error::OversizePayload { size: 9, max: 8 })
        );

        assert_eq!(transport.sent_to(synth), vec![vec![0u8; 8]]);
        assert_eq!(transport.send_calls(), 1);
    }

    #[test]
    fn test_unknown_name_never_reaches_transport() {
        let (transport, registry, port) = setup();
        registry.rescan(&transport);
        let router = MessageRouter::default();

        let result = router.send_to_name(&registry, &transport, port, "Nonexistent Device", &[0x90, 60, 100]);

        assert_eq!(result, Err(Error::DeviceNotFound("Nonexistent Device".into())));
        assert_eq!(transport.send_calls(), 0);
    }

    #[test]
    fn test_policy_change_applies_to_next_send() {
        let (transport, registry, port) = setup();
        let synth = transport.add_destination("Synth");
        registry.rescan(&transport);
        let router = MessageRouter::default();
        let sysex = vec![0xF0; 100];

        router.send_to_endpoint(&registry, &transport, port, synth, &sysex).unwrap();
        router.set_max_packet_size(64);
        assert!(router.send_to_endpoint(&registry, &transport, port, synth, &sysex).is_err());
        router.set_max_packet_size(DEFAULT_MAX_PACKET_SIZE);
        router.send_to_endpoint(&registry, &transport, port, synth, &sysex).unwrap();

        assert_eq!(transport.sent_to(synth).len(), 2);
    }

    #[test]
    fn test_stale_handle_is_forwarded_and_fails_benignly() {
        let (transport, registry, port) = setup();
        let synth = transport.add_destination("Synth");
        registry.rescan(&transport);
        transport.remove_endpoint(synth);
        let router = MessageRouter::default();

        let result = router.send_to_endpoint(&registry, &transport, port, synth, &[0xFE]);

        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(transport.send_calls(), 1);
    }

    #[test]
    fn test_debug_logging_does_not_change_routing() {
        let (transport, registry, port) = setup();
        let synth = transport.add_destination("Synth");
        registry.rescan(&transport);
        let router = MessageRouter::default();

        router.set_debug_logging(true);
        router.send_to_name(&registry, &transport, port, "Synth", &[0xB0, 7, 100]).unwrap();
        router.set_debug_logging(false);
        router.send_to_name(&registry, &transport, port, "Synth", &[0xB0, 7, 101]).unwrap();

        assert_eq!(transport.sent_to(synth), vec![vec![0xB0, 7, 100], vec![0xB0, 7, 101]]);
    }
}
