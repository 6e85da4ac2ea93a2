//! Inbound message dispatch
//!
//! The transport calls [`InboundDispatcher::dispatch`] on its own thread. The
//! dispatcher names the source, copies the payload and posts one task to the
//! configured [`Executor`]; consumer code never runs on the transport thread
//! unless the consumer installed an inline executor.

use bytes::Bytes;
use parking_lot::{ReentrantMutex, RwLock};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, trace};

use crate::endpoint::{fallback_source_name, EndpointHandle};
use crate::executor::{Executor, SerialQueue};
use crate::hex::hex_dump;
use crate::registry::EndpointRegistry;

/// Receives every inbound MIDI message from every connected source
pub trait InputHandler: Send + Sync {
    fn handle_message(&self, device: &str, data: &[u8]);
}

impl<F> InputHandler for F
where
    F: Fn(&str, &[u8]) + Send + Sync,
{
    fn handle_message(&self, device: &str, data: &[u8]) {
        self(device, data)
    }
}

/// Receives the connected output device list whenever it changes
pub trait DeviceListHandler: Send + Sync {
    fn device_list_changed(&self, devices: &[String]);
}

impl<F> DeviceListHandler for F
where
    F: Fn(&[String]) + Send + Sync,
{
    fn device_list_changed(&self, devices: &[String]) {
        self(devices)
    }
}

/// Fan-in of all sources to a single consumer
pub struct InboundDispatcher {
    input_handler: RwLock<Option<Arc<dyn InputHandler>>>,
    device_list_handler: RwLock<Option<Arc<dyn DeviceListHandler>>>,
    executor: RwLock<Arc<dyn Executor>>,
    debug_logging: AtomicBool,
    // Registry generation of the last device list handed to the handler.
    // Reentrant so a handler may trigger a rescan on an inline executor.
    delivered_generation: Arc<ReentrantMutex<Cell<u64>>>,
}

impl Default for InboundDispatcher {
    fn default() -> Self {
        Self::new(Arc::new(SerialQueue::new("midi-delivery")))
    }
}

impl InboundDispatcher {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            input_handler: RwLock::new(None),
            device_list_handler: RwLock::new(None),
            executor: RwLock::new(executor),
            debug_logging: AtomicBool::new(false),
            delivered_generation: Arc::new(ReentrantMutex::new(Cell::new(0))),
        }
    }

    /// Replace the inbound handler. `None` discards inbound messages.
    pub fn set_input_handler(&self, handler: Option<Arc<dyn InputHandler>>) {
        *self.input_handler.write() = handler;
    }

    pub fn set_device_list_handler(&self, handler: Option<Arc<dyn DeviceListHandler>>) {
        *self.device_list_handler.write() = handler;
    }

    pub fn set_executor(&self, executor: Arc<dyn Executor>) {
        *self.executor.write() = executor;
    }

    pub fn set_debug_logging(&self, enabled: bool) {
        self.debug_logging.store(enabled, Ordering::Relaxed);
    }

    pub fn has_input_handler(&self) -> bool {
        self.input_handler.read().is_some()
    }

    /// Entry point for the transport's receive callback
    pub fn dispatch(&self, registry: &EndpointRegistry, source: EndpointHandle, data: &[u8]) {
        let device = registry
            .resolve_source_name(source)
            .unwrap_or_else(|| fallback_source_name(source));

        if self.debug_logging.load(Ordering::Relaxed) {
            info!(
                "MIDI IN <- {} ({} bytes)\n{}",
                device,
                data.len(),
                hex_dump(data, 16).trim_end()
            );
        }

        // Clone out and release the lock before touching the executor
        let Some(handler) = self.input_handler.read().clone() else {
            trace!("No input handler, dropped {} bytes from {}", data.len(), device);
            return;
        };
        let executor = self.executor.read().clone();

        let payload = Bytes::copy_from_slice(data);
        executor.execute(Box::new(move || {
            handler.handle_message(&device, &payload);
        }));
    }

    /// Post the connected-devices list of registry `generation` to the
    /// device-list handler, if any.
    ///
    /// Lists can be posted out of order by racing scans; a list older than
    /// one already delivered is dropped when its task runs.
    pub fn notify_device_list(&self, generation: u64, devices: Vec<String>) {
        let Some(handler) = self.device_list_handler.read().clone() else {
            return;
        };
        let executor = self.executor.read().clone();
        let delivered = self.delivered_generation.clone();

        executor.execute(Box::new(move || {
            let last = delivered.lock();
            if generation <= last.get() {
                trace!(
                    "Dropped stale device list (generation {}, delivered {})",
                    generation,
                    last.get()
                );
                return;
            }
            last.set(generation);
            handler.device_list_changed(&devices);
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{InlineExecutor, MainQueue};
    use crate::transport::VirtualTransport;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    type Received = Arc<Mutex<Vec<(String, Vec<u8>)>>>;

    fn recording_handler() -> (Arc<dyn InputHandler>, Received) {
        let received: Received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let handler: Arc<dyn InputHandler> = Arc::new(move |device: &str, data: &[u8]| {
            sink.lock().push((device.to_string(), data.to_vec()));
        });
        (handler, received)
    }

    fn registry_with_source(name: &str) -> (EndpointRegistry, EndpointHandle) {
        let transport = VirtualTransport::new();
        let handle = transport.add_source(name);
        let registry = EndpointRegistry::new();
        registry.rescan(&transport);
        (registry, handle)
    }

    #[test]
    fn test_dispatch_names_source() {
        let (registry, keys) = registry_with_source("Keys");
        let dispatcher = InboundDispatcher::new(Arc::new(InlineExecutor));
        let (handler, received) = recording_handler();
        dispatcher.set_input_handler(Some(handler));

        dispatcher.dispatch(&registry, keys, &[0x90, 60, 100]);

        assert_eq!(*received.lock(), vec![("Keys".to_string(), vec![0x90, 60, 100])]);
    }

    #[test]
    fn test_unknown_source_uses_fallback_name() {
        let registry = EndpointRegistry::new();
        let dispatcher = InboundDispatcher::new(Arc::new(InlineExecutor));
        let (handler, received) = recording_handler();
        dispatcher.set_input_handler(Some(handler));

        dispatcher.dispatch(&registry, EndpointHandle(0x77), &[0xF8]);

        let received = received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, fallback_source_name(EndpointHandle(0x77)));
    }

    #[test]
    fn test_without_handler_message_is_discarded() {
        let (registry, keys) = registry_with_source("Keys");
        let queue = MainQueue::new();
        let dispatcher = InboundDispatcher::new(Arc::new(queue.executor()));

        dispatcher.dispatch(&registry, keys, &[0x90, 60, 100]);

        assert!(!dispatcher.has_input_handler());
        assert_eq!(queue.run_pending(), 0);
    }

    #[test]
    fn test_delivery_happens_on_executor_not_inline() {
        let (registry, keys) = registry_with_source("Keys");
        let queue = MainQueue::new();
        let dispatcher = InboundDispatcher::new(Arc::new(queue.executor()));
        let (handler, received) = recording_handler();
        dispatcher.set_input_handler(Some(handler));

        dispatcher.dispatch(&registry, keys, &[0xB0, 1, 64]);
        assert!(received.lock().is_empty());

        assert_eq!(queue.run_pending(), 1);
        assert_eq!(received.lock().len(), 1);
    }

    #[test]
    fn test_replacing_handler_routes_to_new_one() {
        let (registry, keys) = registry_with_source("Keys");
        let dispatcher = InboundDispatcher::new(Arc::new(InlineExecutor));
        let (first, first_rx) = recording_handler();
        let (second, second_rx) = recording_handler();

        dispatcher.set_input_handler(Some(first));
        dispatcher.dispatch(&registry, keys, &[1]);
        dispatcher.set_input_handler(Some(second));
        dispatcher.dispatch(&registry, keys, &[2]);
        dispatcher.set_input_handler(None);
        dispatcher.dispatch(&registry, keys, &[3]);

        assert_eq!(first_rx.lock().len(), 1);
        assert_eq!(second_rx.lock().len(), 1);
        assert_eq!(second_rx.lock()[0].1, vec![2]);
    }

    #[test]
    fn test_device_list_notification_goes_through_executor() {
        let queue = MainQueue::new();
        let dispatcher = InboundDispatcher::new(Arc::new(queue.executor()));
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let (c, s) = (calls.clone(), seen.clone());
        dispatcher.set_device_list_handler(Some(Arc::new(move |devices: &[String]| {
            c.fetch_add(1, Ordering::SeqCst);
            *s.lock() = devices.to_vec();
        })));

        dispatcher.notify_device_list(1, vec!["Synth A".into(), "Synth B".into()]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        queue.run_pending();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock(), vec!["Synth A", "Synth B"]);
    }

    #[test]
    fn test_device_list_from_older_scan_is_dropped() {
        let queue = MainQueue::new();
        let dispatcher = InboundDispatcher::new(Arc::new(queue.executor()));
        let seen: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        dispatcher.set_device_list_handler(Some(Arc::new(move |devices: &[String]| {
            sink.lock().push(devices.to_vec());
        })));

        // Generation 5 was published first but posted last
        dispatcher.notify_device_list(6, Vec::new());
        dispatcher.notify_device_list(5, vec!["Synth A".into()]);
        queue.run_pending();

        assert_eq!(*seen.lock(), vec![Vec::<String>::new()]);
    }

    #[test]
    fn test_handler_may_trigger_nested_notification_inline() {
        let dispatcher = Arc::new(InboundDispatcher::new(Arc::new(InlineExecutor)));
        let calls = Arc::new(AtomicUsize::new(0));

        let (d, c) = (Arc::downgrade(&dispatcher), calls.clone());
        dispatcher.set_device_list_handler(Some(Arc::new(move |devices: &[String]| {
            c.fetch_add(1, Ordering::SeqCst);
            if devices.len() == 1 {
                if let Some(d) = d.upgrade() {
                    d.notify_device_list(2, Vec::new());
                }
            }
        })));

        dispatcher.notify_device_list(1, vec!["Synth A".into()]);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
