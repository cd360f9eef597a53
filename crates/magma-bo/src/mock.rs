//! In-memory provider for unit tests.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use magma_core::{
    AccessMask, BoFlags, BufferHandle, ByteSize, CpuMapping, DmaBufFd, Error, GpuAddr,
    MemoryProvider, ProviderAllocation, Result,
};
use spin::Mutex;

#[derive(Debug)]
struct MockAlloc {
    alloc: ProviderAllocation,
    backing: Option<Box<[u8]>>,
}

/// Call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct MockCalls {
    pub creates: u64,
    pub failed_creates: u64,
    pub destroys: u64,
    pub bad_destroys: u64,
    pub mmaps: u64,
    pub munmaps: u64,
    pub imports: u64,
    pub exports: u64,
    pub waits: u64,
    pub invalidates: u64,
    pub cleans: u64,
}

#[derive(Debug, Default)]
struct MockState {
    live: HashMap<BufferHandle, MockAlloc>,
    fds: HashMap<i32, BufferHandle>,
    next_handle: u64,
    next_fd: i32,
    next_va: u64,
    live_bytes: u64,
    capacity: Option<u64>,
    wait_result: bool,
    refuse_export: bool,
    fail_destroy: bool,
    fail_mmap: bool,
    last_wait_mask: Option<AccessMask>,
    calls: MockCalls,
}

#[derive(Debug)]
pub(crate) struct MockProvider {
    state: Mutex<MockState>,
    clock: AtomicU64,
}

impl MockProvider {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                next_handle: 1,
                next_fd: 100,
                next_va: 0x1_0000_0000,
                wait_result: true,
                ..MockState::default()
            }),
            clock: AtomicU64::new(0),
        }
    }

    /// Fail creates that would push live memory past `bytes`
    pub(crate) fn with_capacity(bytes: u64) -> Self {
        let provider = Self::new();
        provider.state.lock().capacity = Some(bytes);
        provider
    }

    pub(crate) fn calls(&self) -> MockCalls {
        self.state.lock().calls
    }

    pub(crate) fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }

    pub(crate) fn is_live(&self, handle: BufferHandle) -> bool {
        self.state.lock().live.contains_key(&handle)
    }

    pub(crate) fn last_wait_mask(&self) -> Option<AccessMask> {
        self.state.lock().last_wait_mask
    }

    pub(crate) fn set_wait_result(&self, completed: bool) {
        self.state.lock().wait_result = completed;
    }

    pub(crate) fn refuse_exports(&self) {
        self.state.lock().refuse_export = true;
    }

    pub(crate) fn fail_destroys(&self) {
        self.state.lock().fail_destroy = true;
    }

    pub(crate) fn fail_mmaps(&self) {
        self.state.lock().fail_mmap = true;
    }

    pub(crate) fn advance_clock(&self, ns: u64) {
        self.clock.fetch_add(ns, Ordering::SeqCst);
    }

    /// Allocation made by another process, reachable only through its fd
    pub(crate) fn foreign_buffer(&self, size: u64) -> DmaBufFd {
        let mut state = self.state.lock();
        let alloc = state.allocate(ByteSize::from_bytes(size));
        state.new_fd(alloc.handle)
    }
}

impl MockState {
    fn allocate(&mut self, size: ByteSize) -> ProviderAllocation {
        let alloc = ProviderAllocation {
            handle: BufferHandle::new(self.next_handle),
            gpu_addr: GpuAddr::new(self.next_va),
            size,
        };
        self.next_handle += 1;
        self.next_va += size.as_bytes();
        self.live_bytes += size.as_bytes();
        self.live.insert(
            alloc.handle,
            MockAlloc {
                alloc,
                backing: None,
            },
        );
        alloc
    }

    fn new_fd(&mut self, handle: BufferHandle) -> DmaBufFd {
        let fd = self.next_fd;
        self.next_fd += 1;
        self.fds.insert(fd, handle);
        DmaBufFd::new(fd)
    }
}

impl MemoryProvider for MockProvider {
    fn create(&self, size: ByteSize, flags: BoFlags) -> Result<ProviderAllocation> {
        let mut state = self.state.lock();
        flags.validate()?;
        let over = state
            .capacity
            .is_some_and(|cap| state.live_bytes + size.as_bytes() > cap);
        if over {
            state.calls.failed_creates += 1;
            return Err(Error::OutOfMemory);
        }
        state.calls.creates += 1;
        Ok(state.allocate(size))
    }

    fn destroy(&self, handle: BufferHandle) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_destroy {
            return Err(Error::ProviderFault(-5));
        }
        match state.live.remove(&handle) {
            Some(entry) => {
                state.live_bytes -= entry.alloc.size.as_bytes();
                state.fds.retain(|_, h| *h != handle);
                state.calls.destroys += 1;
                Ok(())
            }
            None => {
                state.calls.bad_destroys += 1;
                Err(Error::NotFound)
            }
        }
    }

    fn mmap(&self, handle: BufferHandle, size: ByteSize) -> Result<CpuMapping> {
        let mut state = self.state.lock();
        state.calls.mmaps += 1;
        if state.fail_mmap {
            return Err(Error::MappingFailed);
        }
        let entry = state.live.get_mut(&handle).ok_or(Error::NotFound)?;
        let backing = entry
            .backing
            .get_or_insert_with(|| vec![0u8; size.as_bytes() as usize].into_boxed_slice());
        let ptr = NonNull::new(backing.as_mut_ptr()).ok_or(Error::MappingFailed)?;
        // SAFETY: the boxed slice lives until the allocation is destroyed
        Ok(unsafe { CpuMapping::new(ptr, size) })
    }

    fn munmap(&self, handle: BufferHandle, mapping: CpuMapping) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.munmaps += 1;
        let entry = state.live.get(&handle).ok_or(Error::NotFound)?;
        if entry.alloc.size != mapping.len() {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    fn import(&self, fd: DmaBufFd) -> Result<ProviderAllocation> {
        let mut state = self.state.lock();
        state.calls.imports += 1;
        let handle = *state.fds.get(&fd.raw()).ok_or(Error::NotFound)?;
        state
            .live
            .get(&handle)
            .map(|entry| entry.alloc)
            .ok_or(Error::NotFound)
    }

    fn export(&self, handle: BufferHandle) -> Result<DmaBufFd> {
        let mut state = self.state.lock();
        if state.refuse_export {
            return Err(Error::UnsupportedOperation);
        }
        if !state.live.contains_key(&handle) {
            return Err(Error::NotFound);
        }
        state.calls.exports += 1;
        Ok(state.new_fd(handle))
    }

    fn wait(&self, _handle: BufferHandle, _timeout_ns: u64, access: AccessMask) -> Result<bool> {
        let mut state = self.state.lock();
        state.calls.waits += 1;
        state.last_wait_mask = Some(access);
        Ok(state.wait_result)
    }

    fn invalidate(&self, _handle: BufferHandle, _offset: u64, _length: u64) -> Result<()> {
        self.state.lock().calls.invalidates += 1;
        Ok(())
    }

    fn clean(&self, _handle: BufferHandle, _offset: u64, _length: u64) -> Result<()> {
        self.state.lock().calls.cleans += 1;
        Ok(())
    }

    fn now_ns(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }
}

/// Handles of a list of BOs, for order-insensitive comparisons
pub(crate) fn handles<'a>(
    bos: impl IntoIterator<Item = &'a alloc::sync::Arc<crate::BufferObject>>,
) -> Vec<u64> {
    let mut ids: Vec<u64> = bos.into_iter().map(|bo| bo.handle().id()).collect();
    ids.sort_unstable();
    ids
}
