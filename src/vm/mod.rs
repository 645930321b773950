//! The virtual memory manager.
//!
//! [`VmManager`] ties the pieces of demand paging together. It owns the
//! physical memory, the frame pool, the swap store, the hardware page table
//! and the supplemental page table of every process, and exposes the
//! operations the rest of the kernel needs:
//!
//! - the loader registers the pages of a new process with
//!   [`VmManager::register_lazy`] and [`VmManager::register_segment`], and
//!   prepares the stack with [`VmManager::setup_stack`];
//! - the trap dispatcher serves page faults with
//!   [`VmManager::handle_page_fault`];
//! - the system-call layer validates and pins user buffers with
//!   [`VmManager::access_ok`] and [`VmManager::pin_user_pages`], and copies
//!   from and to them with [`VmManager::read_user`] and
//!   [`VmManager::write_user`];
//! - the exit path releases everything a process holds with
//!   [`VmManager::teardown`].
//!
//! ## Locking
//!
//! The frame pool and the swap store share one lock, the *pool lock*. Each
//! supplemental page table has its own lock, and the registry of processes
//! has another that is only held long enough to clone the handle of a table.
//! When more than one is needed they are taken in this order:
//! ```text
//! pool -> registry -> supplemental page table -> page table / frame content
//! ```
//! Eviction runs with the pool lock held and locks the victim's table, so a
//! thread holding a table lock never waits for the pool lock.
pub mod backing;
pub mod clock;
pub mod fault;
pub mod frame;
pub mod spt;
pub mod swap;

use crate::{
    KernelError, Pid,
    addressing::{PAGE_SIZE, Va, Vpn},
    config::VmConfig,
    fs::RegularFile,
    mm::{
        FrameId, Page, PhysicalMemory,
        page_table::{Mmu, SoftMmu},
    },
    sync::SpinLock,
};
use alloc::{collections::BTreeMap, sync::Arc};
use backing::Backing;
use core::ops::Range;
use fault::FaultError;
use frame::{Evictor, FramePool, Owner};
use spt::{SptEntry, StackPolicy, SupplementalPageTable};
use swap::{MemorySwap, SwapStore};

type SharedSpt = Arc<SpinLock<SupplementalPageTable>>;

/// State guarded by the pool lock.
pub(crate) struct Pool<S> {
    pub(crate) frames: FramePool,
    pub(crate) swap: S,
}

/// The demand-paging virtual memory manager.
pub struct VmManager<M: Mmu, S: SwapStore> {
    config: VmConfig,
    memory: PhysicalMemory,
    mmu: M,
    pool: SpinLock<Pool<S>>,
    processes: SpinLock<BTreeMap<Pid, SharedSpt>>,
}

impl VmManager<SoftMmu, MemorySwap> {
    /// Creates a manager backed by a software page table and an in-memory
    /// swap device of `config.swap_slots` slots.
    pub fn in_memory(config: VmConfig) -> Self {
        let swap = MemorySwap::new(config.swap_slots);
        Self::new(config, SoftMmu::new(), swap)
    }
}

impl<M: Mmu, S: SwapStore> VmManager<M, S> {
    /// Creates a manager with `config.frames` physical frames, all free.
    pub fn new(config: VmConfig, mmu: M, swap: S) -> Self {
        log::info!(
            "Memory: {} frames, {} swap slots",
            config.frames,
            swap.capacity()
        );
        Self {
            memory: PhysicalMemory::new(config.frames),
            pool: SpinLock::new(Pool {
                frames: FramePool::new(config.frames),
                swap,
            }),
            processes: SpinLock::new(BTreeMap::new()),
            config,
            mmu,
        }
    }

    /// The configuration the manager was built with.
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// The hardware page table.
    pub fn mmu(&self) -> &M {
        &self.mmu
    }

    /// The physical memory.
    pub fn memory(&self) -> &PhysicalMemory {
        &self.memory
    }

    fn spt(&self, pid: Pid) -> Option<SharedSpt> {
        let guard = self.processes.lock();
        let spt = guard.get(&pid).cloned();
        guard.unlock();
        spt
    }

    fn with_spt<R>(
        &self,
        pid: Pid,
        f: impl FnOnce(&mut SupplementalPageTable) -> R,
    ) -> Result<R, KernelError> {
        let spt = self.spt(pid).ok_or(KernelError::NoSuchEntry)?;
        let mut guard = spt.lock();
        let r = f(&mut *guard);
        guard.unlock();
        Ok(r)
    }

    /// Allocates a pinned frame for `owner`, evicting a page if needed.
    fn allocate(&self, pool: &mut Pool<S>, owner: Owner) -> Result<FrameId, FaultError> {
        let Pool { frames, swap } = pool;
        let mut evictor = WriteBack {
            swap,
            mmu: &self.mmu,
            memory: &self.memory,
            processes: &self.processes,
        };
        frames.allocate(owner, &self.mmu, &mut evictor)
    }

    /// Registers process `pid` with an empty supplemental page table.
    ///
    /// # Returns
    /// - `Err(KernelError::FileExist)` if `pid` is already registered.
    pub fn create_process(&self, pid: Pid) -> Result<(), KernelError> {
        let policy = StackPolicy {
            top: self.config.stack_top,
            max_pages: self.config.max_stack_pages,
            slack: self.config.stack_slack,
        };
        let mut guard = self.processes.lock();
        let result = if guard.contains_key(&pid) {
            Err(KernelError::FileExist)
        } else {
            guard.insert(
                pid,
                Arc::new(SpinLock::new(SupplementalPageTable::new(policy))),
            );
            Ok(())
        };
        guard.unlock();
        if result.is_ok() {
            log::debug!("Memory: {:?} created", pid);
        }
        result
    }

    fn check_user_page(&self, vpn: Vpn) -> Result<(), KernelError> {
        let addr = vpn.into_va().into_usize();
        if addr < PAGE_SIZE || addr >= self.config.user_top {
            Err(KernelError::InvalidArgument)
        } else {
            Ok(())
        }
    }

    /// Registers page `vpn` of `pid`, to be populated from `backing` on the
    /// first access.
    ///
    /// # Returns
    /// - `Err(KernelError::NoSuchEntry)` if `pid` is unknown.
    /// - `Err(KernelError::InvalidArgument)` if `vpn` is the null page or
    ///   outside of the user address space.
    /// - `Err(KernelError::FileExist)` if `vpn` is already registered.
    pub fn register_lazy(
        &self,
        pid: Pid,
        vpn: Vpn,
        backing: Backing,
        writable: bool,
    ) -> Result<(), KernelError> {
        self.check_user_page(vpn)?;
        self.with_spt(pid, |spt| spt.register_lazy(vpn, backing, writable))?
    }

    /// Registers a loadable segment of an executable.
    ///
    /// Starting at `upage`, `read_bytes` bytes of `file` at `offset` are
    /// followed by `zero_bytes` zero bytes. Each page is registered
    /// separately: a page holding file bytes becomes a file-backed page, the
    /// pages after the file data become zero pages. Either all pages are
    /// registered or none.
    ///
    /// # Returns
    /// - `Err(KernelError::InvalidArgument)` if `upage` or `offset` is not
    ///   page aligned, if the segment does not end on a page boundary, if
    ///   the file range overflows, or if it leaves the user address space.
    /// - `Err(KernelError::FileExist)` if a page is already registered.
    /// - `Err(KernelError::NoSuchEntry)` if `pid` is unknown.
    #[allow(clippy::too_many_arguments)]
    pub fn register_segment(
        &self,
        pid: Pid,
        file: &RegularFile,
        offset: usize,
        upage: Va,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<(), KernelError> {
        let total = read_bytes
            .checked_add(zero_bytes)
            .ok_or(KernelError::InvalidArgument)?;
        if upage.offset() != 0
            || offset % PAGE_SIZE != 0
            || total % PAGE_SIZE != 0
            || offset.checked_add(read_bytes).is_none()
        {
            return Err(KernelError::InvalidArgument);
        }
        let pages = total / PAGE_SIZE;
        let first = upage.vpn();
        if pages == 0 {
            return Ok(());
        }
        self.check_user_page(first)?;
        self.check_user_page(first + (pages - 1))?;

        self.with_spt(pid, |spt| {
            for i in 0..pages {
                let consumed = i * PAGE_SIZE;
                let read_length = read_bytes.saturating_sub(consumed).min(PAGE_SIZE);
                let backing = if read_length > 0 {
                    Backing::FileBacked {
                        handle: file.clone(),
                        offset: offset + consumed,
                        read_length,
                    }
                } else {
                    Backing::Zero
                };
                if let Err(e) = spt.register_lazy(first + i, backing, writable) {
                    (0..i).for_each(|j| {
                        spt.remove(first + j);
                    });
                    return Err(e);
                }
            }
            Ok(())
        })?
    }

    /// Creates the initial user stack of `pid`: one zeroed, writable page
    /// right below the stack top, loaded eagerly.
    ///
    /// No stack pointer is recorded; the stack may grow anywhere within its
    /// limit until the first trap from user mode reports one.
    ///
    /// # Returns
    /// The initial stack pointer.
    pub fn setup_stack(&self, pid: Pid) -> Result<Va, KernelError> {
        let top = self.config.stack_top;
        let page = top - PAGE_SIZE;
        self.register_lazy(pid, page.vpn(), Backing::Zero, true)?;
        self.handle_fault(pid, page, true, false)?;
        Ok(top)
    }

    /// Records the user stack pointer of `pid` at the time of a trap, used to
    /// tell stack accesses from stray accesses below the stack.
    pub fn set_stack_pointer(&self, pid: Pid, rsp: Va) -> Result<(), KernelError> {
        self.with_spt(pid, |spt| spt.set_stack_pointer(rsp))
    }

    /// Returns a copy of the entry of `vpn` of `pid`.
    pub fn lookup(&self, pid: Pid, vpn: Vpn) -> Option<SptEntry> {
        self.with_spt(pid, |spt| spt.lookup(vpn).cloned())
            .ok()
            .flatten()
    }

    /// Returns `true` if `vpn` is a registered page of `pid`, resident or not.
    pub fn is_mapped(&self, pid: Pid, vpn: Vpn) -> bool {
        self.lookup(pid, vpn).is_some()
    }

    /// Checks that the user buffer `range` of `pid` may be accessed, without
    /// loading any page.
    ///
    /// Every page of the buffer must be registered, or be a page the stack
    /// may grow into. For a write, every registered page must be writable.
    pub fn access_ok(&self, pid: Pid, range: Range<Va>, is_write: bool) -> bool {
        if range.start >= range.end {
            return true;
        }
        let (start, end) = (range.start.into_usize(), range.end.into_usize());
        if start < PAGE_SIZE || end > self.config.user_top {
            return false;
        }
        let pages = range.start.vpn().into_usize()..range.end.page_up().vpn().into_usize();
        self.with_spt(pid, |spt| {
            pages.map(Vpn).all(|vpn| match spt.lookup(vpn) {
                Some(entry) => entry.writable || !is_write,
                None => spt.can_extend_stack(vpn),
            })
        })
        .unwrap_or(false)
    }

    /// Loads and pins every page of the user buffer `range` of `pid`, so
    /// that the kernel can access the buffer without faulting.
    ///
    /// On failure, the pages pinned so far are unpinned again.
    pub fn pin_user_pages(
        &self,
        pid: Pid,
        range: Range<Va>,
        is_write: bool,
    ) -> Result<(), FaultError> {
        if range.start >= range.end {
            return Ok(());
        }
        let first = range.start.vpn();
        let pages = range.end.page_up().vpn().into_usize() - first.into_usize();
        for i in 0..pages {
            if let Err(e) = self.pin_user_page(pid, first + i, is_write) {
                self.unpin_pages(pid, first, i);
                return Err(e);
            }
        }
        Ok(())
    }

    fn pin_user_page(&self, pid: Pid, vpn: Vpn, is_write: bool) -> Result<(), FaultError> {
        loop {
            self.handle_fault(pid, vpn.into_va(), is_write, false)?;
            let spt = self.spt(pid).ok_or(FaultError::InvalidAddress)?;
            let mut pool = self.pool.lock();
            let mut table = spt.lock();
            let frame = table.lookup(vpn).and_then(|entry| entry.frame);
            if let Some(frame) = frame {
                pool.frames.pin(frame);
                let _ = table.set_pinned(vpn, true);
            }
            table.unlock();
            pool.unlock();
            if frame.is_some() {
                return Ok(());
            }
            // Evicted again before we could pin it.
        }
    }

    /// Unpins the pages of `range` pinned by [`VmManager::pin_user_pages`].
    pub fn unpin_user_pages(&self, pid: Pid, range: Range<Va>) {
        if range.start >= range.end {
            return;
        }
        let first = range.start.vpn();
        let pages = range.end.page_up().vpn().into_usize() - first.into_usize();
        self.unpin_pages(pid, first, pages);
    }

    fn unpin_pages(&self, pid: Pid, first: Vpn, pages: usize) {
        let Some(spt) = self.spt(pid) else {
            return;
        };
        let mut pool = self.pool.lock();
        let mut table = spt.lock();
        for vpn in (0..pages).map(|i| first + i) {
            if let Some(entry) = table.lookup(vpn).filter(|entry| entry.pinned) {
                if let Some(frame) = entry.frame {
                    pool.frames.unpin(frame);
                }
                let _ = table.set_pinned(vpn, false);
            }
        }
        table.unlock();
        pool.unlock();
    }

    /// Accesses the user memory of `pid` at `va` the way the CPU would.
    ///
    /// For each page of `[va, va + len)`, the page is translated through the
    /// page table, which sets its accessed bit (and dirty bit when
    /// `is_write`). A page that is not present is faulted in, and the access
    /// retried. `f` is called with the page content, the range within the
    /// page, and the offset within the buffer.
    fn access_user(
        &self,
        pid: Pid,
        va: Va,
        len: usize,
        is_write: bool,
        mut f: impl FnMut(&mut Page, Range<usize>, usize),
    ) -> Result<(), FaultError> {
        let mut done = 0;
        while done < len {
            let cur = va + done;
            let chunk = (PAGE_SIZE - cur.offset()).min(len - done);
            loop {
                let pool = self.pool.lock();
                let frame = self.mmu.touch(pid, cur.vpn(), is_write);
                if let Some(frame) = frame {
                    self.memory.with_frame(frame, |page| {
                        f(page, cur.offset()..cur.offset() + chunk, done)
                    });
                }
                pool.unlock();
                if frame.is_some() {
                    break;
                }
                self.handle_fault(pid, cur, is_write, true)?;
            }
            done += chunk;
        }
        Ok(())
    }

    /// Copies user memory of `pid` at `va` into `buf`.
    pub fn read_user(&self, pid: Pid, va: Va, buf: &mut [u8]) -> Result<(), FaultError> {
        self.access_user(pid, va, buf.len(), false, |page, range, at| {
            let len = range.len();
            buf[at..at + len].copy_from_slice(&page.inner()[range]);
        })
    }

    /// Copies `buf` into user memory of `pid` at `va`.
    pub fn write_user(&self, pid: Pid, va: Va, buf: &[u8]) -> Result<(), FaultError> {
        self.access_user(pid, va, buf.len(), true, |page, range, at| {
            let len = range.len();
            page.inner_mut()[range].copy_from_slice(&buf[at..at + len]);
        })
    }

    /// Releases every resource of process `pid`.
    ///
    /// Every resident page is unmapped and its frame returned to the pool,
    /// every swap slot holding a page of the process is freed, and the
    /// supplemental page table is dropped. No fault of `pid` may be in
    /// flight.
    ///
    /// # Returns
    /// - `Err(KernelError::NoSuchEntry)` if `pid` is unknown.
    pub fn teardown(&self, pid: Pid) -> Result<(), KernelError> {
        let mut pool = self.pool.lock();
        let Some(spt) = self.spt(pid) else {
            pool.unlock();
            return Err(KernelError::NoSuchEntry);
        };
        let mut table = spt.lock();
        let (mut frames, mut slots) = (0, 0);
        for (vpn, entry) in table.drain() {
            match (entry.frame, entry.backing) {
                (Some(frame), _) => {
                    let _ = self.mmu.unmap(pid, vpn);
                    pool.frames.release(frame);
                    frames += 1;
                }
                (None, Backing::SwapBacked { slot }) => {
                    pool.swap.free_slot(slot);
                    slots += 1;
                }
                (None, _) => (),
            }
        }
        table.unlock();

        // Frames still pinned for a page that never got installed.
        let stray = pool
            .frames
            .iter()
            .filter(|(_, frame)| frame.owner().is_some_and(|o| o.pid == pid))
            .map(|(id, _)| id)
            .collect::<alloc::vec::Vec<_>>();
        for id in stray {
            pool.frames.release(id);
        }

        let mut processes = self.processes.lock();
        processes.remove(&pid);
        processes.unlock();
        pool.unlock();
        log::debug!(
            "Memory: {:?} torn down, {} frames and {} swap slots released",
            pid,
            frames,
            slots
        );
        Ok(())
    }

    /// Number of frames owned by process `pid`.
    pub fn frames_owned_by(&self, pid: Pid) -> usize {
        let pool = self.pool.lock();
        let cnt = pool.frames.owned_by(pid);
        pool.unlock();
        cnt
    }

    /// Number of frames in use.
    pub fn resident_frames(&self) -> usize {
        let pool = self.pool.lock();
        let cnt = pool.frames.capacity() - pool.frames.free_count();
        pool.unlock();
        cnt
    }

    /// Number of free frames.
    pub fn free_frames(&self) -> usize {
        let pool = self.pool.lock();
        let cnt = pool.frames.free_count();
        pool.unlock();
        cnt
    }

    /// Number of swap slots in use.
    pub fn swap_slots_in_use(&self) -> usize {
        let pool = self.pool.lock();
        let cnt = pool.swap.in_use();
        pool.unlock();
        cnt
    }

    /// Number of pages registered for `pid`.
    pub fn page_count(&self, pid: Pid) -> usize {
        self.with_spt(pid, |spt| spt.len()).unwrap_or(0)
    }

    /// Frame holding page `vpn` of `pid`, if resident.
    pub fn frame_of(&self, pid: Pid, vpn: Vpn) -> Option<FrameId> {
        self.lookup(pid, vpn).and_then(|entry| entry.frame)
    }

    /// The page frame `id` is loaded for.
    pub fn owner_of(&self, id: FrameId) -> Option<Owner> {
        let pool = self.pool.lock();
        let owner = pool.frames.owner_of(id);
        pool.unlock();
        owner
    }

    /// Returns `true` if frame `id` is pinned.
    pub fn is_pinned(&self, id: FrameId) -> bool {
        let pool = self.pool.lock();
        let pinned = pool.frames.is_pinned(id);
        pool.unlock();
        pinned
    }
}

/// Evicts victims chosen by the frame pool.
///
/// A page that was modified, or whose content came from swap, is written to
/// a fresh swap slot. Any other page is dropped; its zero or file descriptor
/// produces it again on the next fault.
struct WriteBack<'a, M: Mmu, S: SwapStore> {
    swap: &'a mut S,
    mmu: &'a M,
    memory: &'a PhysicalMemory,
    processes: &'a SpinLock<BTreeMap<Pid, SharedSpt>>,
}

impl<M: Mmu, S: SwapStore> WriteBack<'_, M, S> {
    fn write_back(
        &mut self,
        table: &mut SupplementalPageTable,
        frame: FrameId,
        owner: Owner,
    ) -> Result<(), FaultError> {
        let Owner { pid, vpn } = owner;
        let Some(entry) = table.lookup(vpn) else {
            let _ = self.mmu.unmap(pid, vpn);
            return Ok(());
        };
        let dirty = self.mmu.is_dirty(pid, vpn);
        let backing = if dirty || !entry.backing.is_rederivable() {
            let slot = self
                .swap
                .allocate_slot()
                .ok_or(FaultError::ResourceExhaustion)?;
            let swap = &mut *self.swap;
            if let Err(e) = self
                .memory
                .with_frame(frame, |page| swap.write_slot(slot, page.inner()))
            {
                log::warn!("Evict: cannot write {:?}: {:?}", slot, e);
                swap.free_slot(slot);
                return Err(FaultError::IoFailure);
            }
            log::trace!("Evict: {:?}:{:?} -> {:?}", pid, vpn, slot);
            Backing::SwapBacked { slot }
        } else {
            entry.backing.clone()
        };
        table
            .mark_evicted(vpn, backing)
            .map_err(|_| FaultError::InvalidAddress)?;
        let _ = self.mmu.unmap(pid, vpn);
        Ok(())
    }
}

impl<M: Mmu, S: SwapStore> Evictor for WriteBack<'_, M, S> {
    fn evict(&mut self, frame: FrameId, owner: Owner) -> Result<(), FaultError> {
        let guard = self.processes.lock();
        let spt = guard.get(&owner.pid).cloned();
        guard.unlock();
        let Some(spt) = spt else {
            let _ = self.mmu.unmap(owner.pid, owner.vpn);
            return Ok(());
        };
        let mut table = spt.lock();
        let result = self.write_back(&mut table, frame, owner);
        table.unlock();
        result
    }
}
