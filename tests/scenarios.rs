//! End-to-end paging scenarios on a pool of four frames.

use keos_vm::{
    FaultError, KernelError, Pid, VmConfig, VmManager,
    addressing::{PAGE_SIZE, Va, Vpn},
    fs::{MemoryFile, RegularFile, traits},
    mm::{FrameId, page_table::SoftMmu},
    vm::{
        backing::Backing,
        frame::Owner,
        swap::{MemorySwap, SlotId, SwapStore},
    },
};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

const A: Pid = Pid(1);
const B: Pid = Pid(2);
const BASE: usize = 0x40_0000;

fn manager(frames: usize) -> VmManager<SoftMmu, MemorySwap> {
    let config = VmConfig::builder()
        .frames(frames)
        .swap_slots(32)
        .max_stack_pages(8)
        .build()
        .unwrap();
    let vm = VmManager::in_memory(config);
    vm.create_process(A).unwrap();
    vm.create_process(B).unwrap();
    vm
}

fn page(i: usize) -> Vpn {
    Va::new(BASE).unwrap().vpn() + i
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 253) as u8).collect()
}

fn read_page(vm: &VmManager<SoftMmu, MemorySwap>, pid: Pid, vpn: Vpn) -> Vec<u8> {
    let mut buf = vec![0; PAGE_SIZE];
    vm.read_user(pid, vpn.into_va(), &mut buf).unwrap();
    buf
}

#[test]
fn file_page_is_loaded_on_first_fault() {
    let vm = manager(4);
    let data = pattern(PAGE_SIZE);
    let file = RegularFile::new(MemoryFile::new(data.clone()));
    vm.register_lazy(
        A,
        page(0),
        Backing::FileBacked {
            handle: file,
            offset: 0,
            read_length: PAGE_SIZE / 2,
        },
        false,
    )
    .unwrap();
    assert_eq!(vm.frame_of(A, page(0)), None);
    assert_eq!(vm.resident_frames(), 0);

    vm.handle_fault(A, page(0).into_va() + 0x10, false, true)
        .unwrap();
    assert!(vm.frame_of(A, page(0)).is_some());
    let content = read_page(&vm, A, page(0));
    assert_eq!(&content[..PAGE_SIZE / 2], &data[..PAGE_SIZE / 2]);
    assert!(content[PAGE_SIZE / 2..].iter().all(|b| *b == 0));
}

#[test]
fn full_pool_evicts_exactly_one_frame() {
    let vm = manager(4);
    for i in 0..4 {
        vm.register_lazy(A, page(i), Backing::Zero, true).unwrap();
        vm.handle_fault(A, page(i).into_va(), false, true).unwrap();
    }
    assert_eq!(vm.free_frames(), 0);
    assert_eq!(vm.frames_owned_by(A), 4);

    vm.register_lazy(B, page(0), Backing::Zero, true).unwrap();
    vm.handle_fault(B, page(0).into_va(), true, true).unwrap();

    assert_eq!(vm.frames_owned_by(A), 3);
    assert_eq!(vm.frames_owned_by(B), 1);
    assert_eq!(vm.resident_frames(), 4);
    assert!(vm.frame_of(B, page(0)).is_some());
    let evicted = (0..4)
        .filter(|i| vm.frame_of(A, page(*i)).is_none())
        .collect::<Vec<_>>();
    assert_eq!(evicted.len(), 1);
    // A clean zero page is dropped, not swapped.
    assert_eq!(vm.swap_slots_in_use(), 0);
    assert!(matches!(
        vm.lookup(A, page(evicted[0])).unwrap().backing,
        Backing::Zero
    ));
}

/// A file whose reads block until the test lets them through.
struct GatedFile {
    data: Vec<u8>,
    started: Arc<AtomicBool>,
    open: Arc<AtomicBool>,
}

impl traits::RegularFile for GatedFile {
    fn size(&self) -> usize {
        self.data.len()
    }

    fn read(&self, position: usize, buf: &mut [u8]) -> Result<usize, KernelError> {
        self.started.store(true, Ordering::SeqCst);
        while !self.open.load(Ordering::SeqCst) {
            thread::yield_now();
        }
        let start = position.min(self.data.len());
        let end = self.data.len().min(start + buf.len());
        buf[..end - start].copy_from_slice(&self.data[start..end]);
        Ok(end - start)
    }
}

#[test]
fn frame_under_population_is_never_evicted() {
    let vm = Arc::new(manager(4));
    let started = Arc::new(AtomicBool::new(false));
    let open = Arc::new(AtomicBool::new(false));
    let data = pattern(PAGE_SIZE);
    let file = RegularFile::new(GatedFile {
        data: data.clone(),
        started: started.clone(),
        open: open.clone(),
    });
    vm.register_lazy(
        B,
        page(0),
        Backing::FileBacked {
            handle: file,
            offset: 0,
            read_length: PAGE_SIZE,
        },
        false,
    )
    .unwrap();
    for i in 0..8 {
        vm.register_lazy(A, page(i), Backing::Zero, true).unwrap();
    }

    let loader = {
        let vm = vm.clone();
        thread::spawn(move || vm.handle_fault(B, page(0).into_va(), false, true))
    };
    while !started.load(Ordering::SeqCst) {
        thread::yield_now();
    }

    let owner = Owner {
        pid: B,
        vpn: page(0),
    };
    let pinned = (0..4)
        .map(FrameId)
        .find(|id| vm.owner_of(*id) == Some(owner))
        .unwrap();
    assert!(vm.is_pinned(pinned));

    // Twice as many pages as frames: every unpinned frame gets evicted.
    for i in 0..8 {
        vm.write_user(A, page(i).into_va(), &[i as u8 + 1]).unwrap();
        assert_eq!(vm.owner_of(pinned), Some(owner));
        assert!(vm.is_pinned(pinned));
    }
    assert_eq!(vm.frames_owned_by(A), 3);

    open.store(true, Ordering::SeqCst);
    assert_eq!(loader.join().unwrap(), Ok(()));
    assert_eq!(vm.frame_of(B, page(0)), Some(pinned));
    assert!(!vm.is_pinned(pinned));
    assert_eq!(read_page(&vm, B, page(0)), data);
    // Nothing written by A was lost on the way.
    for i in 0..8 {
        let mut byte = [0u8];
        vm.read_user(A, page(i).into_va(), &mut byte).unwrap();
        assert_eq!(byte[0], i as u8 + 1);
    }
}

#[test]
fn teardown_returns_every_frame() {
    let vm = manager(4);
    vm.register_lazy(B, page(0), Backing::Zero, true).unwrap();
    vm.handle_fault(B, page(0).into_va(), true, true).unwrap();
    let mut released = vec![];
    for i in 0..3 {
        vm.register_lazy(A, page(i), Backing::Zero, true).unwrap();
        vm.write_user(A, page(i).into_va(), &[0xaa]).unwrap();
        released.push(vm.frame_of(A, page(i)).unwrap());
    }
    assert_eq!(vm.frames_owned_by(A), 3);
    assert_eq!(vm.free_frames(), 0);

    vm.teardown(A).unwrap();
    assert_eq!(vm.frames_owned_by(A), 0);
    assert_eq!(vm.page_count(A), 0);
    assert_eq!(vm.free_frames(), 3);
    assert_eq!(vm.mmu().mapped_pages(A), 0);

    vm.register_lazy(B, page(1), Backing::Zero, true).unwrap();
    vm.handle_fault(B, page(1).into_va(), true, true).unwrap();
    assert!(released.contains(&vm.frame_of(B, page(1)).unwrap()));
    // B's first page was not evicted to make room.
    assert!(vm.frame_of(B, page(0)).is_some());
    assert_eq!(vm.frames_owned_by(B), 2);
}

#[test]
fn stack_grows_within_its_limit() {
    let vm = manager(4);
    let top = vm.setup_stack(A).unwrap();
    assert_eq!(top, vm.config().stack_top);

    let near = top - 2 * PAGE_SIZE;
    vm.handle_fault(A, near, true, true).unwrap();
    assert!(vm.is_mapped(A, near.vpn()));
    assert_eq!(read_page(&vm, A, near.vpn()), vec![0; PAGE_SIZE]);

    let far = top - 20 * PAGE_SIZE;
    assert_eq!(
        vm.handle_fault(A, far, true, true),
        Err(FaultError::InvalidAddress)
    );
    assert!(!vm.is_mapped(A, far.vpn()));

    // The last page within the limit.
    let last = top - 8 * PAGE_SIZE;
    vm.handle_fault(A, last, false, true).unwrap();
    assert!(vm.is_mapped(A, last.vpn()));
    assert_eq!(
        vm.handle_fault(A, last - PAGE_SIZE, false, true),
        Err(FaultError::InvalidAddress)
    );
}

#[test]
fn stack_growth_follows_the_trapped_stack_pointer() {
    use keos_vm::vm::fault::PFErrorCode;

    let vm = manager(4);
    let top = vm.setup_stack(A).unwrap();
    let user_write = PFErrorCode::WRITE_ACCESS | PFErrorCode::USER;

    // A push right below the stack pointer.
    let rsp = top - PAGE_SIZE;
    assert_eq!(vm.handle_page_fault(A, user_write, rsp - 8, rsp), Ok(()));
    assert!(vm.is_mapped(A, (rsp - 8).vpn()));
    // Far below the stack pointer.
    assert_eq!(
        vm.handle_page_fault(A, user_write, top - 5 * PAGE_SIZE, rsp),
        Err(FaultError::InvalidAddress)
    );
    assert!(!vm.is_mapped(A, (top - 5 * PAGE_SIZE).vpn()));

    // The program moved its stack pointer down first.
    let rsp = top - 5 * PAGE_SIZE + 16;
    assert_eq!(
        vm.handle_page_fault(A, user_write, top - 5 * PAGE_SIZE, rsp),
        Ok(())
    );
    assert!(vm.is_mapped(A, (top - 5 * PAGE_SIZE).vpn()));
}

#[test]
fn invalid_addresses_are_rejected() {
    let vm = manager(4);
    vm.register_lazy(A, page(0), Backing::Zero, false).unwrap();
    // Null page.
    assert_eq!(
        vm.handle_fault(A, Va::new(0x10).unwrap(), false, true),
        Err(FaultError::InvalidAddress)
    );
    // Kernel address.
    assert_eq!(
        vm.handle_fault(A, Va::new(0xffff_8000_0000_1000).unwrap(), false, true),
        Err(FaultError::InvalidAddress)
    );
    // Unregistered, far from the stack.
    assert_eq!(
        vm.handle_fault(A, page(5).into_va(), false, true),
        Err(FaultError::InvalidAddress)
    );
    // Write to a read-only page.
    assert_eq!(
        vm.handle_fault(A, page(0).into_va(), true, true),
        Err(FaultError::InvalidAddress)
    );
    // Unknown process.
    assert_eq!(
        vm.handle_fault(Pid(77), page(0).into_va(), false, true),
        Err(FaultError::InvalidAddress)
    );
    // No frame was leaked by the rejected faults.
    assert_eq!(vm.free_frames(), 4);
    assert_eq!(FaultError::InvalidAddress.to_string(), "invalid memory access");
}

#[test]
fn dirty_page_round_trips_through_swap() {
    let vm = manager(2);
    let data = pattern(PAGE_SIZE);
    vm.register_lazy(A, page(0), Backing::Zero, true).unwrap();
    vm.write_user(A, page(0).into_va(), &data).unwrap();

    let mut i = 1;
    while vm.frame_of(A, page(0)).is_some() {
        assert!(i < 16, "page never evicted");
        vm.register_lazy(B, page(i), Backing::Zero, true).unwrap();
        vm.write_user(B, page(i).into_va(), &[i as u8]).unwrap();
        i += 1;
    }
    assert!(matches!(
        vm.lookup(A, page(0)).unwrap().backing,
        Backing::SwapBacked { .. }
    ));
    vm.teardown(B).unwrap();
    assert_eq!(vm.swap_slots_in_use(), 1);

    assert_eq!(read_page(&vm, A, page(0)), data);
    // Reading the page back released its slot.
    assert_eq!(vm.swap_slots_in_use(), 0);
}

#[test]
fn clean_file_page_is_reread_not_swapped() {
    let vm = manager(2);
    let data = pattern(2 * PAGE_SIZE);
    let file = RegularFile::new(MemoryFile::new(data.clone()));
    vm.register_segment(A, &file, 0, page(0).into_va(), 2 * PAGE_SIZE, 0, false)
        .unwrap();
    assert_eq!(read_page(&vm, A, page(1)), &data[PAGE_SIZE..]);

    let mut i = 2;
    while vm.frame_of(A, page(1)).is_some() {
        assert!(i < 16, "page never evicted");
        vm.register_lazy(A, page(i), Backing::Zero, false).unwrap();
        read_page(&vm, A, page(i));
        i += 1;
    }
    assert_eq!(vm.swap_slots_in_use(), 0);
    assert!(matches!(
        vm.lookup(A, page(1)).unwrap().backing,
        Backing::FileBacked { .. }
    ));
    assert_eq!(read_page(&vm, A, page(1)), &data[PAGE_SIZE..]);
    assert_eq!(vm.swap_slots_in_use(), 0);
}

#[test]
fn decoded_fault_is_served() {
    use keos_vm::vm::fault::PFErrorCode;

    let vm = manager(2);
    vm.register_lazy(A, page(0), Backing::Zero, true).unwrap();
    vm.register_lazy(A, page(1), Backing::Zero, false).unwrap();
    let rsp = vm.config().stack_top;
    assert_eq!(
        vm.handle_page_fault(
            A,
            PFErrorCode::WRITE_ACCESS | PFErrorCode::USER,
            page(0).into_va() + 8,
            rsp
        ),
        Ok(())
    );
    // A second fault on a resident page is spurious.
    assert_eq!(
        vm.handle_page_fault(A, PFErrorCode::USER, page(0).into_va(), rsp),
        Ok(())
    );
    assert_eq!(vm.frames_owned_by(A), 1);

    // Writing to a present read-only page.
    vm.handle_page_fault(A, PFErrorCode::USER, page(1).into_va(), rsp)
        .unwrap();
    let frame = vm.frame_of(A, page(1)).unwrap();
    assert_eq!(
        vm.handle_page_fault(
            A,
            PFErrorCode::PRESENT | PFErrorCode::WRITE_ACCESS | PFErrorCode::USER,
            page(1).into_va(),
            rsp
        ),
        Err(FaultError::InvalidAddress)
    );
    assert_eq!(vm.frame_of(A, page(1)), Some(frame));
    assert_eq!(vm.frames_owned_by(A), 2);
}

/// A file whose device always fails.
struct BrokenFile;

impl traits::RegularFile for BrokenFile {
    fn size(&self) -> usize {
        PAGE_SIZE
    }

    fn read(&self, _position: usize, _buf: &mut [u8]) -> Result<usize, KernelError> {
        Err(KernelError::IOError)
    }
}

#[test]
fn failed_file_read_returns_the_frame() {
    let vm = manager(2);
    vm.register_lazy(
        A,
        page(0),
        Backing::FileBacked {
            handle: RegularFile::new(BrokenFile),
            offset: 0,
            read_length: PAGE_SIZE,
        },
        false,
    )
    .unwrap();

    assert_eq!(
        vm.handle_fault(A, page(0).into_va(), false, true),
        Err(FaultError::IoFailure)
    );
    assert_eq!(vm.free_frames(), 2);
    assert_eq!(vm.frame_of(A, page(0)), None);
    let entry = vm.lookup(A, page(0)).unwrap();
    assert!(!entry.is_resident());
    assert!(matches!(entry.backing, Backing::FileBacked { .. }));
    assert_eq!(vm.mmu().mapped_pages(A), 0);
}

/// A swap device in memory whose reads and writes can be made to fail.
struct FlakySwap {
    inner: MemorySwap,
    fail_reads: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
}

impl SwapStore for FlakySwap {
    fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    fn in_use(&self) -> usize {
        self.inner.in_use()
    }

    fn allocate_slot(&mut self) -> Option<SlotId> {
        self.inner.allocate_slot()
    }

    fn write_slot(&mut self, slot: SlotId, page: &[u8]) -> Result<(), KernelError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(KernelError::IOError);
        }
        self.inner.write_slot(slot, page)
    }

    fn read_slot(&mut self, slot: SlotId, page: &mut [u8]) -> Result<(), KernelError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(KernelError::IOError);
        }
        self.inner.read_slot(slot, page)
    }

    fn free_slot(&mut self, slot: SlotId) {
        self.inner.free_slot(slot)
    }
}

struct Flaky {
    vm: VmManager<SoftMmu, FlakySwap>,
    fail_reads: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
}

fn flaky_manager(frames: usize) -> Flaky {
    let config = VmConfig::builder()
        .frames(frames)
        .swap_slots(8)
        .build()
        .unwrap();
    let fail_reads = Arc::new(AtomicBool::new(false));
    let fail_writes = Arc::new(AtomicBool::new(false));
    let swap = FlakySwap {
        inner: MemorySwap::new(8),
        fail_reads: fail_reads.clone(),
        fail_writes: fail_writes.clone(),
    };
    let vm = VmManager::new(config, SoftMmu::new(), swap);
    vm.create_process(A).unwrap();
    Flaky {
        vm,
        fail_reads,
        fail_writes,
    }
}

#[test]
fn failed_swap_read_keeps_the_page_in_swap() {
    let Flaky { vm, fail_reads, .. } = flaky_manager(1);
    let data = pattern(PAGE_SIZE);
    vm.register_lazy(A, page(0), Backing::Zero, true).unwrap();
    vm.register_lazy(A, page(1), Backing::Zero, true).unwrap();
    vm.write_user(A, page(0).into_va(), &data).unwrap();
    vm.write_user(A, page(1).into_va(), &[1]).unwrap();
    assert_eq!(vm.frame_of(A, page(0)), None);
    assert_eq!(vm.swap_slots_in_use(), 1);

    fail_reads.store(true, Ordering::SeqCst);
    assert_eq!(
        vm.handle_fault(A, page(0).into_va(), false, true),
        Err(FaultError::IoFailure)
    );
    // The dirty page evicted to make room went to swap; the frame is free.
    assert_eq!(vm.free_frames(), 1);
    assert_eq!(vm.frame_of(A, page(0)), None);
    assert_eq!(vm.frame_of(A, page(1)), None);
    assert!(matches!(
        vm.lookup(A, page(0)).unwrap().backing,
        Backing::SwapBacked { .. }
    ));
    assert_eq!(vm.swap_slots_in_use(), 2);

    fail_reads.store(false, Ordering::SeqCst);
    let mut buf = vec![0; PAGE_SIZE];
    vm.read_user(A, page(0).into_va(), &mut buf).unwrap();
    assert_eq!(buf, data);
}

#[test]
fn failed_write_back_keeps_the_victim_resident() {
    let Flaky {
        vm, fail_writes, ..
    } = flaky_manager(1);
    vm.register_lazy(A, page(0), Backing::Zero, true).unwrap();
    vm.register_lazy(A, page(1), Backing::Zero, true).unwrap();
    vm.write_user(A, page(0).into_va(), &[0xaa]).unwrap();
    let victim = vm.frame_of(A, page(0)).unwrap();

    fail_writes.store(true, Ordering::SeqCst);
    assert_eq!(
        vm.handle_fault(A, page(1).into_va(), true, true),
        Err(FaultError::IoFailure)
    );
    assert_eq!(vm.frame_of(A, page(0)), Some(victim));
    assert!(!vm.is_pinned(victim));
    assert_eq!(vm.frame_of(A, page(1)), None);
    assert_eq!(vm.swap_slots_in_use(), 0);
    assert_eq!(vm.mmu().mapped_pages(A), 1);

    let mut byte = [0u8];
    vm.read_user(A, page(0).into_va(), &mut byte).unwrap();
    assert_eq!(byte, [0xaa]);

    fail_writes.store(false, Ordering::SeqCst);
    vm.write_user(A, page(1).into_va(), &[0xbb]).unwrap();
    assert_eq!(vm.frame_of(A, page(1)), Some(victim));
    assert_eq!(vm.swap_slots_in_use(), 1);
}

#[test]
fn full_swap_keeps_the_victim_resident() {
    let config = VmConfig::builder().frames(1).build().unwrap();
    let vm = VmManager::new(config, SoftMmu::new(), MemorySwap::new(0));
    vm.create_process(A).unwrap();
    vm.register_lazy(A, page(0), Backing::Zero, true).unwrap();
    vm.register_lazy(A, page(1), Backing::Zero, true).unwrap();
    vm.write_user(A, page(0).into_va(), &[0xaa]).unwrap();
    let victim = vm.frame_of(A, page(0)).unwrap();

    let err = vm.handle_fault(A, page(1).into_va(), true, true);
    assert_eq!(err, Err(FaultError::ResourceExhaustion));
    assert!(err.unwrap_err().is_exhaustion());
    assert_eq!(vm.frame_of(A, page(0)), Some(victim));
    assert!(!vm.is_pinned(victim));
    assert_eq!(vm.owner_of(victim), Some(Owner { pid: A, vpn: page(0) }));
    assert_eq!(vm.frame_of(A, page(1)), None);
    assert_eq!(vm.free_frames(), 0);
}

#[test]
fn pinned_pool_is_exhausted_without_leaking() {
    let vm = manager(2);
    for i in 0..3 {
        vm.register_lazy(A, page(i), Backing::Zero, true).unwrap();
    }
    let pinned = page(0).into_va()..page(2).into_va();
    vm.pin_user_pages(A, pinned.clone(), true).unwrap();
    let frames = [
        vm.frame_of(A, page(0)).unwrap(),
        vm.frame_of(A, page(1)).unwrap(),
    ];
    assert!(frames.iter().all(|id| vm.is_pinned(*id)));

    assert_eq!(
        vm.handle_fault(A, page(2).into_va(), false, true),
        Err(FaultError::ResourceExhaustion)
    );
    assert_eq!(vm.free_frames(), 0);
    assert_eq!(vm.frames_owned_by(A), 2);
    assert_eq!(vm.frame_of(A, page(2)), None);
    assert!(frames.iter().all(|id| vm.is_pinned(*id)));

    vm.unpin_user_pages(A, pinned);
    assert!(frames.iter().all(|id| !vm.is_pinned(*id)));

    // Pinning more pages than frames fails and unpins what it pinned.
    assert_eq!(
        vm.pin_user_pages(A, page(0).into_va()..page(3).into_va(), false),
        Err(FaultError::ResourceExhaustion)
    );
    assert_eq!(vm.free_frames(), 0);
    assert_eq!(vm.frames_owned_by(A), 2);
    assert!((0..2).all(|i| !vm.is_pinned(FrameId(i))));
    vm.handle_fault(A, page(2).into_va(), false, true).unwrap();
    assert!(vm.frame_of(A, page(2)).is_some());
}
