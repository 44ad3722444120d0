//! Named shared-memory regions and process-shared signals.
//!
//! Regions are `shared_memory` mappings addressed by OS id. Signals are `raw_sync`
//! events placed at the start of their own small named mapping, so either side can
//! open a signal by name alone.
//!
//! The creator of a mapping owns it and unlinks the name on drop; openers only
//! unmap. Both wrappers are plain values that can be moved to a blocking thread.
#![allow(unsafe_code)]

use crate::error::{RelayError, Result};
use crate::platform;
use raw_sync::events::{Event, EventImpl, EventInit, EventState};
use raw_sync::Timeout;
use shared_memory::{Shmem, ShmemConf, ShmemError};
use std::time::Duration;
use tracing::debug;

fn shm_error(name: &str, action: &str, err: impl std::fmt::Display) -> RelayError {
    RelayError::SharedMemory {
        name: name.to_string(),
        message: format!("{} failed: {}", action, err),
    }
}

fn signal_error(name: &str, action: &str, err: impl std::fmt::Display) -> RelayError {
    RelayError::Signal {
        name: name.to_string(),
        message: format!("{} failed: {}", action, err),
    }
}

fn create_mapping(name: &str, size: usize) -> std::result::Result<Shmem, ShmemError> {
    ShmemConf::new()
        .size(size)
        .os_id(platform::shm_os_id(name))
        .create()
}

fn open_mapping(name: &str) -> std::result::Result<Shmem, ShmemError> {
    ShmemConf::new().os_id(platform::shm_os_id(name)).open()
}

/// Create a mapping, taking over one left behind by a dead owner.
fn create_or_reclaim_mapping(name: &str, size: usize) -> Result<Shmem> {
    match create_mapping(name, size) {
        Ok(shmem) => Ok(shmem),
        Err(ShmemError::MappingIdExists) => {
            let mut shmem = open_mapping(name).map_err(|e| shm_error(name, "reclaim", e))?;
            if shmem.len() < size {
                return Err(shm_error(
                    name,
                    "reclaim",
                    format!("existing mapping is {} bytes, need {}", shmem.len(), size),
                ));
            }
            shmem.set_owner(true);
            debug!("Reclaimed stale shared memory {}", name);
            Ok(shmem)
        }
        Err(e) => Err(shm_error(name, "create", e)),
    }
}

/// A named shared-memory region with bounds-checked access.
pub struct SharedRegion {
    shmem: Shmem,
    size: usize,
    name: String,
}

// SAFETY: `Shmem` is a mapping handle plus a raw base pointer. The mapping stays
// valid until the handle is dropped, and every access below goes through `&self`
// or `&mut self`, so moving the handle to another thread is sound.
unsafe impl Send for SharedRegion {}

impl SharedRegion {
    /// Create a new region. Fails if the name is already in use.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let shmem = create_mapping(name, size).map_err(|e| shm_error(name, "create", e))?;
        Ok(Self::wrap(shmem, size, name))
    }

    /// Create a region, reclaiming a stale mapping of the same name. The region is zeroed.
    pub fn create_or_reclaim(name: &str, size: usize) -> Result<Self> {
        let shmem = create_or_reclaim_mapping(name, size)?;
        let mut region = Self::wrap(shmem, size, name);
        region.zero()?;
        Ok(region)
    }

    /// Open a region created by another process.
    pub fn open(name: &str) -> Result<Self> {
        let shmem = open_mapping(name).map_err(|e| shm_error(name, "open", e))?;
        let size = shmem.len();
        Ok(Self::wrap(shmem, size, name))
    }

    fn wrap(shmem: Shmem, size: usize, name: &str) -> Self {
        Self {
            shmem,
            size,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Usable size. An opened region may report a page-rounded size.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(shm_error(
                &self.name,
                "access",
                format!("range {}+{} outside {} byte region", offset, len, self.size),
            )),
        }
    }

    /// Copy `buf.len()` bytes out of the region starting at `offset`.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        // SAFETY: the range was checked against the mapping size and `buf` is a
        // distinct local allocation, so the copy stays in bounds and cannot overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(self.shmem.as_ptr().add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Copy `len` bytes starting at `offset` into a new buffer.
    pub fn read_vec(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read(offset, &mut buf)?;
        Ok(buf)
    }

    /// Copy `data` into the region starting at `offset`.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        // SAFETY: the range was checked against the mapping size and `data` is
        // process-local memory, so the copy stays in bounds and cannot overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.shmem.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    pub fn zero(&mut self) -> Result<()> {
        let zeros = vec![0u8; self.size];
        self.write(0, &zeros)
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("owner", &self.shmem.is_owner())
            .finish()
    }
}

/// A named, process-shared binary signal.
pub struct NamedSignal {
    // Declared before `region` so the event is dropped while its memory is mapped
    event: Box<dyn EventImpl>,
    region: Shmem,
    name: String,
}

// SAFETY: the event lives in shared memory and is built to be signalled and waited
// on from different processes, hence from different threads. The mapping outlives
// the event because `event` is dropped before `region`.
unsafe impl Send for NamedSignal {}
// SAFETY: see above; `set` and `wait` only take `&self`.
unsafe impl Sync for NamedSignal {}

impl NamedSignal {
    /// Create a signal in the cleared state.
    ///
    /// An auto-reset signal releases one waiter per `set` and clears itself; a
    /// manual-reset signal stays set. A stale mapping of the same name is reclaimed
    /// and re-initialized.
    pub fn create(name: &str, auto_reset: bool) -> Result<Self> {
        let region = create_or_reclaim_mapping(name, Event::size_of(None))?;
        // SAFETY: the mapping is at least `Event::size_of` bytes, page aligned, and
        // owned by this process, so initializing a fresh event at its base is valid.
        let (event, _) = unsafe { Event::new(region.as_ptr(), auto_reset) }
            .map_err(|e| signal_error(name, "create", e))?;
        Ok(Self {
            event,
            region,
            name: name.to_string(),
        })
    }

    /// Open a signal created by another process.
    pub fn open(name: &str) -> Result<Self> {
        let region = open_mapping(name).map_err(|e| shm_error(name, "open", e))?;
        if region.len() < Event::size_of(None) {
            return Err(signal_error(name, "open", "mapping is too small"));
        }
        // SAFETY: the mapping was sized and initialized by `create` in the owning
        // process and is large enough to hold the event.
        let (event, _) = unsafe { Event::from_existing(region.as_ptr()) }
            .map_err(|e| signal_error(name, "open", e))?;
        Ok(Self {
            event,
            region,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set(&self) -> Result<()> {
        self.event
            .set(EventState::Signaled)
            .map_err(|e| signal_error(&self.name, "set", e))
    }

    /// Block until the signal is set, or until `timeout` elapses.
    ///
    /// An elapsed timeout is reported as an error.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        let timeout = match timeout {
            Some(duration) => Timeout::Val(duration),
            None => Timeout::Infinite,
        };
        self.event
            .wait(timeout)
            .map_err(|e| signal_error(&self.name, "wait", e))
    }
}

impl std::fmt::Debug for NamedSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedSignal")
            .field("name", &self.name)
            .field("owner", &self.region.is_owner())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    fn unique(prefix: &str) -> String {
        // Short enough for platforms with tight shared-memory name limits
        format!("{}{}", prefix, &uuid::Uuid::new_v4().simple().to_string()[..12])
    }

    #[test]
    fn test_region_write_then_open_and_read() {
        let name = unique("ir-r");
        let mut owner = SharedRegion::create(&name, 64).unwrap();
        owner.write(10, b"hello").unwrap();

        let opened = SharedRegion::open(&name).unwrap();
        assert!(opened.len() >= 64);
        assert_eq!(opened.read_vec(10, 5).unwrap(), b"hello");
    }

    #[test]
    fn test_region_bounds_are_checked() {
        let name = unique("ir-b");
        let mut region = SharedRegion::create(&name, 8).unwrap();
        assert!(region.write(4, &[0u8; 5]).is_err());
        assert!(region.read_vec(usize::MAX, 2).is_err());
        assert!(region.write(0, &[1u8; 8]).is_ok());
    }

    #[test]
    fn test_create_twice_fails_but_reclaim_succeeds() {
        let name = unique("ir-c");
        let mut first = SharedRegion::create(&name, 16).unwrap();
        first.write(0, &[0xAA; 16]).unwrap();

        assert!(SharedRegion::create(&name, 16).is_err());

        let reclaimed = SharedRegion::create_or_reclaim(&name, 16).unwrap();
        assert_eq!(reclaimed.read_vec(0, 16).unwrap(), vec![0u8; 16]);
    }

    #[test]
    fn test_open_missing_region_fails() {
        let result = SharedRegion::open(&unique("ir-m"));
        assert!(matches!(result, Err(RelayError::SharedMemory { .. })));
    }

    #[test]
    fn test_signal_wakes_waiter_across_handles() {
        let name = unique("ir-s");
        let owner = Arc::new(NamedSignal::create(&name, true).unwrap());
        let opener = NamedSignal::open(&name).unwrap();

        let waiter = {
            let owner = owner.clone();
            std::thread::spawn(move || owner.wait(Some(Duration::from_secs(5))))
        };
        std::thread::sleep(Duration::from_millis(50));
        opener.set().unwrap();

        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn test_signal_wait_times_out() {
        let name = unique("ir-t");
        let signal = NamedSignal::create(&name, false).unwrap();
        let start = Instant::now();
        assert!(signal.wait(Some(Duration::from_millis(100))).is_err());
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[test]
    fn test_manual_reset_signal_stays_set() {
        let name = unique("ir-u");
        let signal = NamedSignal::create(&name, false).unwrap();
        signal.set().unwrap();
        signal.wait(Some(Duration::from_secs(1))).unwrap();
        signal.wait(Some(Duration::from_secs(1))).unwrap();
    }
}
