//! The in-memory realtime cache: device id to the most recent complete
//! snapshot. Single writer per device (through the dispatch task), many
//! readers. Readers receive an `Arc` of a whole snapshot, so they observe
//! either the previous or the new state, never a torn mix.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use daqsrv_protocol::DeviceSnapshot;

#[derive(Clone, Default)]
pub struct RealtimeCache(Arc<Mutex<HashMap<String, Arc<DeviceSnapshot>>>>);

impl RealtimeCache {
    pub fn new() -> Self {
        Default::default()
    }

    /// Replace the device's snapshot atomically.
    pub fn insert(&self, device_id: &str, snapshot: Arc<DeviceSnapshot>) {
        let mut inner = self.0.lock().unwrap();
        inner.insert(device_id.to_string(), snapshot);
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceSnapshot>> {
        let inner = self.0.lock().unwrap();
        inner.get(device_id).cloned()
    }

    pub fn remove(&self, device_id: &str) {
        let mut inner = self.0.lock().unwrap();
        inner.remove(device_id);
    }

    pub fn len(&self) -> usize {
        let inner = self.0.lock().unwrap();
        inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
