//! Backend devices shared between renderer instances.
//!
//! A `DeviceManager` owns one reference-counted `BackendDevice` per physical
//! device and hands the same handle to every acceleration structure that asks
//! for it. Builds and refits take the device's build lock; traversal never
//! does.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};

use crate::accel::AccelError;

/// Which traversal implementation a device runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Software,
    Embree,
}

/// Identifies one physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    pub kind: BackendKind,
    pub index: u32,
}

impl DeviceKey {
    pub const SOFTWARE: DeviceKey = DeviceKey {
        kind: BackendKind::Software,
        index: 0,
    };

    pub const EMBREE: DeviceKey = DeviceKey {
        kind: BackendKind::Embree,
        index: 0,
    };
}

/// What a device can do, decided once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// Record-all queries are cheap, so shadows use one batched query.
    pub record_all_hits: bool,
    /// Paths integrate the volumes they enter; otherwise volume boundaries
    /// are crossed without attenuation.
    pub volumes: bool,
    /// BSSRDF closures scatter below the surface; otherwise they shade as diffuse.
    pub subsurface: bool,
}

impl DeviceCapabilities {
    pub fn for_backend(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Software | BackendKind::Embree => Self {
                record_all_hits: true,
                volumes: true,
                subsurface: true,
            },
        }
    }
}

/// Receives device memory statistics.
pub trait StatsSink: Send + Sync {
    fn mem_alloc(&self, bytes: u64);
    fn mem_free(&self, bytes: u64);
}

/// Memory accounting for one device.
///
/// Until a stats sink is attached, allocations accumulate in atomic counters;
/// attaching a sink forwards the pending totals once and reports directly
/// afterwards.
#[derive(Default)]
pub struct MemoryTracker {
    pending_alloc: AtomicU64,
    pending_free: AtomicU64,
    sink: Mutex<Option<Arc<dyn StatsSink>>>,
}

impl MemoryTracker {
    pub fn alloc(&self, bytes: u64) {
        match self.sink.lock().as_ref() {
            Some(sink) => sink.mem_alloc(bytes),
            None => {
                self.pending_alloc.fetch_add(bytes, Ordering::Relaxed);
            }
        }
    }

    pub fn free(&self, bytes: u64) {
        match self.sink.lock().as_ref() {
            Some(sink) => sink.mem_free(bytes),
            None => {
                self.pending_free.fetch_add(bytes, Ordering::Relaxed);
            }
        }
    }

    /// Attach a sink and reconcile everything recorded so far into it.
    pub fn attach(&self, sink: Arc<dyn StatsSink>) {
        let mut slot = self.sink.lock();
        let alloc = self.pending_alloc.swap(0, Ordering::Relaxed);
        let free = self.pending_free.swap(0, Ordering::Relaxed);
        if alloc > 0 {
            sink.mem_alloc(alloc);
        }
        if free > 0 {
            sink.mem_free(free);
        }
        *slot = Some(sink);
    }

    /// Bytes recorded but not yet reported to a sink, as (allocated, freed).
    pub fn pending(&self) -> (u64, u64) {
        (
            self.pending_alloc.load(Ordering::Relaxed),
            self.pending_free.load(Ordering::Relaxed),
        )
    }
}

impl std::fmt::Debug for MemoryTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (alloc, free) = self.pending();
        f.debug_struct("MemoryTracker")
            .field("pending_alloc", &alloc)
            .field("pending_free", &free)
            .field("attached", &self.sink.lock().is_some())
            .finish()
    }
}

/// A physical device shared by every acceleration structure built on it.
#[derive(Debug)]
pub struct BackendDevice {
    key: DeviceKey,
    capabilities: DeviceCapabilities,
    build_lock: Mutex<()>,
    error: Mutex<Option<String>>,
    pub memory: MemoryTracker,
    #[cfg(feature = "embree")]
    pub(crate) native: Option<crate::accel::embree::NativeDevice>,
}

impl BackendDevice {
    fn new(key: DeviceKey, capabilities: DeviceCapabilities) -> Self {
        let device = Self {
            key,
            capabilities,
            build_lock: Mutex::new(()),
            error: Mutex::new(None),
            memory: MemoryTracker::default(),
            #[cfg(feature = "embree")]
            native: match key.kind {
                BackendKind::Embree => crate::accel::embree::NativeDevice::create().ok(),
                BackendKind::Software => None,
            },
        };
        device.check_native();
        device
    }

    #[cfg(feature = "embree")]
    fn check_native(&self) {
        if self.key.kind == BackendKind::Embree && self.native.is_none() {
            self.set_error("failed to create Embree device");
        }
    }

    #[cfg(not(feature = "embree"))]
    fn check_native(&self) {}

    pub fn key(&self) -> DeviceKey {
        self.key
    }

    pub fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    /// Mark the device unusable. Later builds fail with this message.
    pub fn set_error(&self, message: impl Into<String>) {
        let message = message.into();
        log::error!("Device {:?} error: {}", self.key, message);
        let mut error = self.error.lock();
        if error.is_none() {
            *error = Some(message);
        }
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    /// Enter the single-writer build phase.
    pub fn lock_build(&self) -> Result<MutexGuard<'_, ()>, AccelError> {
        if let Some(message) = self.error() {
            return Err(AccelError::Device(message));
        }
        Ok(self.build_lock.lock())
    }
}

/// Owns the shared device handles.
#[derive(Debug, Default)]
pub struct DeviceManager {
    devices: Mutex<HashMap<DeviceKey, Weak<BackendDevice>>>,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the handle for `key`, creating the device if nothing holds it.
    pub fn acquire(&self, key: DeviceKey) -> Result<Arc<BackendDevice>, AccelError> {
        self.acquire_with(key, DeviceCapabilities::for_backend(key.kind))
    }

    /// Like `acquire`, with explicit capabilities for a newly created device.
    ///
    /// An existing live device keeps the capabilities it was created with.
    pub fn acquire_with(
        &self,
        key: DeviceKey,
        capabilities: DeviceCapabilities,
    ) -> Result<Arc<BackendDevice>, AccelError> {
        if key.kind == BackendKind::Embree && !cfg!(feature = "embree") {
            return Err(AccelError::BackendUnavailable(
                "built without the `embree` feature".into(),
            ));
        }

        let mut devices = self.devices.lock();
        if let Some(device) = devices.get(&key).and_then(Weak::upgrade) {
            return Ok(device);
        }

        log::info!("Creating {:?} device {}", key.kind, key.index);
        let device = Arc::new(BackendDevice::new(key, capabilities));
        devices.insert(key, Arc::downgrade(&device));
        Ok(device)
    }

    /// Number of devices still referenced somewhere.
    pub fn live_devices(&self) -> usize {
        let mut devices = self.devices.lock();
        devices.retain(|_, d| d.strong_count() > 0);
        devices.len()
    }
}
