use std::mem;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use libc::c_void;
use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use tracing::error;

use crate::channel::Telemetry;
use crate::{Error, Result};

/// The shared region layout. Every field has a single writer: the worker publishes telemetry,
/// the master only reads. `Relaxed` ordering is sufficient
#[repr(C)]
struct ShmData {
    active_requests: AtomicU32,
    /// Unix seconds
    activity_time: AtomicU32,
    /// Load average quantized to percent
    load_average: AtomicU8,
    total_requests: AtomicU32,
    ready: AtomicU8,
}

/// A per-worker anonymous shared memory region, mapped in the master before fork and inherited
/// by the worker. Both sides keep their own mapping; the region is unmapped on drop. The layout
/// is private to one manager instance and its children
pub struct Shmem {
    ptr: NonNull<ShmData>,
}

// the region is plain atomics, safe to touch from any thread
unsafe impl Send for Shmem {}
unsafe impl Sync for Shmem {}

impl Shmem {
    /// Maps a fresh zero-filled region
    pub fn create() -> Result<Self> {
        let len = NonZeroUsize::new(mem::size_of::<ShmData>())
            .ok_or_else(|| Error::failed("empty shared region layout"))?;
        let ptr = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED | MapFlags::MAP_ANONYMOUS,
            )?
        };
        // anonymous pages are zero-filled, which is a valid initial state for every field
        Ok(Self {
            ptr: ptr.cast::<ShmData>(),
        })
    }
    fn data(&self) -> &ShmData {
        unsafe { self.ptr.as_ref() }
    }
    /// Marks the worker ready
    pub fn set_ready(&self) {
        self.data().ready.store(1, Ordering::Relaxed);
    }
    /// Publishes the number of requests in flight
    pub fn set_active_requests(&self, active: u32) {
        self.data().active_requests.store(active, Ordering::Relaxed);
    }
    /// Publishes the periodic activity report. The load average is quantized to 1% resolution to
    /// keep the field word-sized
    pub fn set_activity(&self, now: u64, load_average: f32, total_requests: u64) {
        let data = self.data();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        data.load_average.store(
            (load_average.clamp(0.0, 1.0) * 100.0).round() as u8,
            Ordering::Relaxed,
        );
        #[allow(clippy::cast_possible_truncation)]
        data.activity_time.store(now as u32, Ordering::Relaxed);
        #[allow(clippy::cast_possible_truncation)]
        data.total_requests
            .store(total_requests.min(u64::from(u32::MAX)) as u32, Ordering::Relaxed);
    }
    /// Reads the full snapshot, dequantizing the load average
    pub fn read(&self) -> Telemetry {
        let data = self.data();
        Telemetry {
            active_requests: data.active_requests.load(Ordering::Relaxed),
            activity_time: u64::from(data.activity_time.load(Ordering::Relaxed)),
            load_average: f32::from(data.load_average.load(Ordering::Relaxed)) / 100.0,
            total_requests: u64::from(data.total_requests.load(Ordering::Relaxed)),
            ready: data.ready.load(Ordering::Relaxed) != 0,
        }
    }
}

impl Drop for Shmem {
    fn drop(&mut self) {
        let res = unsafe { munmap(self.ptr.cast::<c_void>(), mem::size_of::<ShmData>()) };
        if let Err(e) = res {
            error!(error = %e, "could not unmap shared memory");
        }
    }
}
