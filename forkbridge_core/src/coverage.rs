//! Shared coverage map handle.
//!
//! The supervisor allocates a SysV shared memory segment and passes its id in
//! an environment variable. Instrumented code writes hit counters into it; this
//! module only attaches the segment and keeps it mapped for the lifetime of
//! the process. There is no detach path: the mapping is released when the
//! process exits and is never remapped in between.

use std::io;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use thiserror::Error;
use tracing::debug;

/// Errors raised while attaching the coverage map.
///
/// None of these are fatal to the bridge: the caller degrades to an
/// uninstrumented [`MappedRegion::Inert`] region.
#[derive(Error, Debug)]
pub enum AttachError {
    /// The handle is not a non-negative integer shared memory id.
    #[error("Coverage map handle {handle:?} is not a valid shared memory id")]
    Malformed { handle: String },

    #[error("Coverage map size must be greater than zero")]
    ZeroSize,

    /// `shmat` or `shmctl` rejected the id.
    #[error("Failed to attach shared memory id {shm_id}: {source}")]
    Os {
        shm_id: i32,
        #[source]
        source: io::Error,
    },

    /// The segment exists but cannot hold a map of the configured size.
    #[error("Shared memory id {shm_id} is {segment} bytes, map needs {required}")]
    TooSmall {
        shm_id: i32,
        segment: usize,
        required: usize,
    },
}

static AREA_PTR: AtomicPtr<u8> = AtomicPtr::new(ptr::null_mut());
static AREA_LEN: AtomicUsize = AtomicUsize::new(0);

/// Base address of the published coverage map, or null when none is attached.
pub fn area_ptr() -> *mut u8 {
    AREA_PTR.load(Ordering::Acquire)
}

/// Length in bytes of the published coverage map, zero when none is attached.
pub fn area_len() -> usize {
    AREA_LEN.load(Ordering::Acquire)
}

/// A live attachment to the supervisor's shared memory segment.
#[derive(Debug)]
pub struct SharedMapping {
    base: NonNull<u8>,
    len: usize,
    shm_id: i32,
}

// The mapping is process-wide memory owned by exactly one session; moving the
// handle between threads does not alias it.
unsafe impl Send for SharedMapping {}

impl SharedMapping {
    pub fn shm_id(&self) -> i32 {
        self.shm_id
    }
}

/// The coverage region held by a session.
#[derive(Debug)]
pub enum MappedRegion {
    Shared(SharedMapping),
    /// No supervisor map: hits are discarded.
    Inert,
}

impl MappedRegion {
    pub fn is_instrumented(&self) -> bool {
        matches!(self, MappedRegion::Shared(_))
    }

    pub fn len(&self) -> usize {
        match self {
            MappedRegion::Shared(mapping) => mapping.len,
            MappedRegion::Inert => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match self {
            MappedRegion::Shared(mapping) => {
                // SAFETY: `base` came from a successful shmat of a segment at
                // least `len` bytes long and is never detached.
                Some(unsafe { std::slice::from_raw_parts_mut(mapping.base.as_ptr(), mapping.len) })
            }
            MappedRegion::Inert => None,
        }
    }

    /// Bumps the hit counter for `edge`, wrapping at 255 like AFL counters.
    pub fn hit(&mut self, edge: usize) {
        if let Some(map) = self.as_mut_slice() {
            let slot = edge % map.len();
            map[slot] = map[slot].wrapping_add(1);
        }
    }

    /// Makes this region visible through [`area_ptr`] and [`area_len`].
    pub fn publish(&mut self) {
        let (base, len) = match self {
            MappedRegion::Shared(mapping) => (mapping.base.as_ptr(), mapping.len),
            MappedRegion::Inert => (ptr::null_mut(), 0),
        };
        AREA_LEN.store(len, Ordering::Release);
        AREA_PTR.store(base, Ordering::Release);
    }
}

/// Attaches the shared memory segment named by `handle`.
///
/// `None` means no supervisor provided a map; the result is an
/// [`MappedRegion::Inert`] region rather than an error.
pub fn attach(handle: Option<&str>, map_size: usize) -> Result<MappedRegion, AttachError> {
    let Some(raw) = handle else {
        debug!("no coverage map handle, running uninstrumented");
        return Ok(MappedRegion::Inert);
    };

    if map_size == 0 {
        return Err(AttachError::ZeroSize);
    }

    let shm_id: i32 = match raw.trim().parse() {
        Ok(id) if id >= 0 => id,
        _ => {
            return Err(AttachError::Malformed {
                handle: raw.to_string(),
            });
        }
    };

    let segment = segment_size(shm_id)?;
    if segment < map_size {
        return Err(AttachError::TooSmall {
            shm_id,
            segment,
            required: map_size,
        });
    }

    // SAFETY: plain syscall; the result is checked against the documented
    // `(void *) -1` failure value before use.
    let addr = unsafe { libc::shmat(shm_id, ptr::null(), 0) };
    if addr as isize == -1 {
        return Err(AttachError::Os {
            shm_id,
            source: io::Error::last_os_error(),
        });
    }
    let base = NonNull::new(addr.cast::<u8>()).ok_or_else(|| AttachError::Os {
        shm_id,
        source: io::Error::other("shmat returned a null mapping"),
    })?;

    debug!(shm_id, map_size, "attached coverage map");
    Ok(MappedRegion::Shared(SharedMapping {
        base,
        len: map_size,
        shm_id,
    }))
}

fn segment_size(shm_id: i32) -> Result<usize, AttachError> {
    // SAFETY: shmid_ds is plain old data; shmctl fills it on success.
    let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::shmctl(shm_id, libc::IPC_STAT, &mut ds) };
    if rc == -1 {
        return Err(AttachError::Os {
            shm_id,
            source: io::Error::last_os_error(),
        });
    }
    Ok(ds.shm_segsz as usize)
}
