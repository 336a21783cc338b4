//! In-memory stand-ins for the collaborators of the VM core: a bounded
//! pool of page frames, a page directory that models accessed/dirty bits
//! for both address aliases, a sector-granular block device and a
//! fixed-length file.

#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    ptr::NonNull,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use defines::config::{PAGE_SIZE, SECTOR_SIZE};
use vmem::{
    AddressSpace, AllocFlags, BlockDevice, FrameAllocator, KernelPage, PageDirectory, VirtAddr,
    VirtPageNum, Vm, VmFile,
};

#[repr(C, align(4096))]
struct PageBuf([u8; PAGE_SIZE]);

fn lease_pages(count: usize) -> Vec<KernelPage> {
    (0..count)
        .map(|_| {
            let buf: &'static mut PageBuf = Box::leak(Box::new(PageBuf([0; PAGE_SIZE])));
            KernelPage::new(NonNull::new(buf.0.as_mut_ptr()).unwrap())
        })
        .collect()
}

/// A page not owned by any allocator, for poking at bookkeeping checks.
pub fn orphan_page() -> KernelPage {
    lease_pages(1).pop().unwrap()
}

/// Two bounded pools of page frames: the user pool that the frame table
/// draws from, and a small kernel pool for scratch pages.
pub struct PoolFrameAllocator {
    user: Mutex<Vec<KernelPage>>,
    kernel: Mutex<Vec<KernelPage>>,
    user_addrs: HashSet<usize>,
}

impl PoolFrameAllocator {
    pub fn new(user_frames: usize, kernel_frames: usize) -> Arc<Self> {
        let user = lease_pages(user_frames);
        let user_addrs = user.iter().map(|kpage| kpage.addr()).collect();
        Arc::new(Self {
            user: Mutex::new(user),
            kernel: Mutex::new(lease_pages(kernel_frames)),
            user_addrs,
        })
    }

    pub fn free_user_frames(&self) -> usize {
        self.user.lock().unwrap().len()
    }
}

impl FrameAllocator for PoolFrameAllocator {
    fn alloc(&self, flags: AllocFlags) -> Option<KernelPage> {
        let pool = if flags.contains(AllocFlags::USER) {
            &self.user
        } else {
            &self.kernel
        };
        let kpage = pool.lock().unwrap().pop()?;
        if flags.contains(AllocFlags::ZERO) {
            unsafe { kpage.as_bytes_mut().fill(0) };
        }
        Some(kpage)
    }

    unsafe fn dealloc(&self, kpage: KernelPage) {
        let pool = if self.user_addrs.contains(&kpage.addr()) {
            &self.user
        } else {
            &self.kernel
        };
        pool.lock().unwrap().push(kpage);
    }
}

#[derive(Clone, Copy)]
struct Pte {
    kpage: KernelPage,
    writable: bool,
    present: bool,
    accessed: bool,
    dirty: bool,
}

/// Fake hardware page directory. Like real PTEs, tearing a mapping down
/// clears only the present bit: accessed/dirty stay readable until the
/// page is mapped again.
pub struct TestPageDir {
    ptes: Mutex<HashMap<usize, Pte>>,
    kpage_dirty: Mutex<HashMap<usize, bool>>,
    fail_maps: AtomicBool,
}

impl TestPageDir {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ptes: Mutex::new(HashMap::new()),
            kpage_dirty: Mutex::new(HashMap::new()),
            fail_maps: AtomicBool::new(false),
        })
    }

    /// While set, every `map` fails as if the page directory could not
    /// allocate an internal node.
    pub fn set_fail_maps(&self, fail: bool) {
        self.fail_maps.store(fail, Ordering::Relaxed);
    }

    pub fn translate(&self, upage: VirtPageNum) -> Option<(KernelPage, bool)> {
        let ptes = self.ptes.lock().unwrap();
        let pte = ptes.get(&upage.0)?;
        pte.present.then_some((pte.kpage, pte.writable))
    }

    /// Simulate a user-mode store: requires a present writable mapping,
    /// sets the accessed and dirty bits like the MMU would.
    pub fn user_write(&self, addr: VirtAddr, bytes: &[u8]) {
        let mut ptes = self.ptes.lock().unwrap();
        let pte = ptes
            .get_mut(&addr.vpn_floor().0)
            .filter(|pte| pte.present)
            .expect("user write to an unmapped page");
        assert!(pte.writable, "user write to a read-only page");
        pte.accessed = true;
        pte.dirty = true;
        let offset = addr.page_offset();
        unsafe {
            pte.kpage.as_bytes_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
        }
    }

    /// Simulate a user-mode load: requires a present mapping, sets the
    /// accessed bit.
    pub fn user_read(&self, addr: VirtAddr, len: usize) -> Vec<u8> {
        let mut ptes = self.ptes.lock().unwrap();
        let pte = ptes
            .get_mut(&addr.vpn_floor().0)
            .filter(|pte| pte.present)
            .expect("user read from an unmapped page");
        pte.accessed = true;
        let offset = addr.page_offset();
        unsafe { pte.kpage.as_bytes()[offset..offset + len].to_vec() }
    }
}

impl PageDirectory for TestPageDir {
    fn map(&self, upage: VirtPageNum, kpage: KernelPage, writable: bool) -> bool {
        if self.fail_maps.load(Ordering::Relaxed) {
            return false;
        }
        self.ptes.lock().unwrap().insert(
            upage.0,
            Pte {
                kpage,
                writable,
                present: true,
                accessed: false,
                dirty: false,
            },
        );
        true
    }

    fn unmap(&self, upage: VirtPageNum) {
        if let Some(pte) = self.ptes.lock().unwrap().get_mut(&upage.0) {
            pte.present = false;
        }
    }

    fn is_accessed(&self, upage: VirtPageNum) -> bool {
        self.ptes
            .lock()
            .unwrap()
            .get(&upage.0)
            .is_some_and(|pte| pte.accessed)
    }

    fn set_accessed(&self, upage: VirtPageNum, accessed: bool) {
        if let Some(pte) = self.ptes.lock().unwrap().get_mut(&upage.0) {
            pte.accessed = accessed;
        }
    }

    fn is_dirty(&self, upage: VirtPageNum) -> bool {
        self.ptes
            .lock()
            .unwrap()
            .get(&upage.0)
            .is_some_and(|pte| pte.dirty)
    }

    fn set_dirty(&self, upage: VirtPageNum, dirty: bool) {
        if let Some(pte) = self.ptes.lock().unwrap().get_mut(&upage.0) {
            pte.dirty = dirty;
        }
    }

    fn is_kpage_dirty(&self, kpage: KernelPage) -> bool {
        self.kpage_dirty
            .lock()
            .unwrap()
            .get(&kpage.addr())
            .copied()
            .unwrap_or(false)
    }

    fn set_kpage_dirty(&self, kpage: KernelPage, dirty: bool) {
        self.kpage_dirty.lock().unwrap().insert(kpage.addr(), dirty);
    }
}

/// Sector-granular block device over a `Vec<u8>`.
pub struct MemBlockDevice {
    sectors: Mutex<Vec<u8>>,
    num_blocks: usize,
}

impl MemBlockDevice {
    pub fn new(num_blocks: usize) -> Arc<Self> {
        Arc::new(Self {
            sectors: Mutex::new(vec![0; num_blocks * SECTOR_SIZE]),
            num_blocks,
        })
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        let sectors = self.sectors.lock().unwrap();
        buf.copy_from_slice(&sectors[block_id * SECTOR_SIZE..(block_id + 1) * SECTOR_SIZE]);
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        let mut sectors = self.sectors.lock().unwrap();
        sectors[block_id * SECTOR_SIZE..(block_id + 1) * SECTOR_SIZE].copy_from_slice(buf);
    }

    fn num_blocks(&self) -> usize {
        self.num_blocks
    }
}

/// Fixed-length in-memory file. Reopened handles share the same content;
/// writes past the end are truncated, the file never grows.
pub struct MemFile {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data: Arc::new(Mutex::new(data)),
        })
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

impl VmFile for MemFile {
    fn len(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let data = self.data.lock().unwrap();
        if offset >= data.len() {
            return 0;
        }
        let n = usize::min(buf.len(), data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        n
    }

    fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
        let mut data = self.data.lock().unwrap();
        if offset >= data.len() {
            return 0;
        }
        let n = usize::min(buf.len(), data.len() - offset);
        data[offset..offset + n].copy_from_slice(&buf[..n]);
        n
    }

    fn reopen(&self) -> Option<std::sync::Arc<dyn VmFile>> {
        Some(Arc::new(MemFile {
            data: self.data.clone(),
        }))
    }
}

/// A fresh core over bounded pools and an in-memory swap device.
pub fn new_vm(
    user_frames: usize,
    kernel_frames: usize,
    swap_slots: usize,
) -> (Arc<Vm>, Arc<PoolFrameAllocator>) {
    let palloc = PoolFrameAllocator::new(user_frames, kernel_frames);
    let dev = MemBlockDevice::new(swap_slots * (PAGE_SIZE / SECTOR_SIZE));
    let vm = Arc::new(Vm::new(palloc.clone(), dev));
    (vm, palloc)
}

/// A fresh address space over its own fake page directory.
pub fn new_space() -> (triomphe::Arc<AddressSpace>, Arc<TestPageDir>) {
    let pagedir = TestPageDir::new();
    (AddressSpace::new(pagedir.clone()), pagedir)
}
