//! 页帧表：登记所有驻留的用户页帧，并实现时钟（二次机会）驱逐。
//!
//! 表由两个视图组成：按 `kpage` 索引的映射，以及按插入顺序排列的环，
//! 后者是时钟指针扫描的范围。所有公开操作都由同一把自旋锁串行化，
//! 驱逐（包括换出的设备写入）整体在锁内完成。

use alloc::collections::{BTreeMap, VecDeque};

use log::debug;
use spin::mutex::SpinMutex;
use triomphe::Arc;

use crate::{
    address::{KernelPage, VirtPageNum},
    memory_space::AddressSpace,
    palloc::{AllocFlags, FrameAllocator},
    swap::SwapStore,
};

struct FrameEntry {
    /// 当前映射到该页帧的用户页
    upage: VirtPageNum,
    /// 硬件映射所属的地址空间。驱逐可以跨地址空间进行，
    /// 这个反向链接用来找到牺牲帧的页目录和补充页表
    owner: Arc<AddressSpace>,
    /// 置位期间不可被驱逐
    pinned: bool,
}

struct FrameTableInner {
    entries: BTreeMap<KernelPage, FrameEntry>,
    /// 插入顺序的环，时钟指针的扫描域
    ring: VecDeque<KernelPage>,
    /// 下一个被检查的环位置
    hand: usize,
}

impl FrameTableInner {
    /// 将条目移出映射与时钟环。指针会先越过被移除的节点
    fn remove(&mut self, kpage: KernelPage) {
        self.entries
            .remove(&kpage)
            .unwrap_or_else(|| panic!("frame {kpage:?} is not registered"));
        let pos = self
            .ring
            .iter()
            .position(|&k| k == kpage)
            .expect("frame ring out of sync with the entry map");
        self.ring.remove(pos);
        if pos < self.hand {
            self.hand -= 1;
        }
        if self.hand >= self.ring.len() {
            self.hand = 0;
        }
    }
}

pub struct FrameTable {
    palloc: alloc::sync::Arc<dyn FrameAllocator>,
    swap: Arc<SwapStore>,
    inner: SpinMutex<FrameTableInner>,
}

impl FrameTable {
    pub(crate) fn new(palloc: alloc::sync::Arc<dyn FrameAllocator>, swap: Arc<SwapStore>) -> Self {
        Self {
            palloc,
            swap,
            inner: SpinMutex::new(FrameTableInner {
                entries: BTreeMap::new(),
                ring: VecDeque::new(),
                hand: 0,
            }),
        }
    }

    /// 获得一个新的用户页帧并登记到表中。物理分配器耗尽时先驱逐
    /// 一个牺牲帧再重试。新条目处于 pin 状态，由调用者在安装完硬件
    /// 映射之后解除，这样正在解决缺页的帧不会被并发的缺页驱逐
    pub fn alloc(
        &self,
        flags: AllocFlags,
        owner: &Arc<AddressSpace>,
        upage: VirtPageNum,
    ) -> KernelPage {
        let mut inner = self.inner.lock();

        let kpage = match self.palloc.alloc(flags | AllocFlags::USER) {
            Some(kpage) => kpage,
            None => {
                self.evict(&mut inner);
                self.palloc
                    .alloc(flags | AllocFlags::USER)
                    .expect("physical allocator still empty right after eviction")
            }
        };

        let prev = inner.entries.insert(
            kpage,
            FrameEntry {
                upage,
                owner: owner.clone(),
                pinned: true,
            },
        );
        assert!(prev.is_none(), "frame {kpage:?} is already registered");
        inner.ring.push_back(kpage);
        kpage
    }

    /// 时钟算法挑选并驱逐一个牺牲帧，物理页归还给分配器。
    ///
    /// 每个帧每轮有一次机会：访问位被置上的帧本次被跳过，同时清除
    /// 其访问位。扫描最多 `2n + 1` 步，超出说明所有帧都被 pin 住
    /// 或者系统已经在颠簸，视为致命错误
    fn evict(&self, inner: &mut FrameTableInner) {
        let n = inner.entries.len();
        assert!(n != 0, "evict rejected: frame table is empty");

        for _ in 0..=2 * n {
            let pos = inner.hand;
            let kpage = inner.ring[pos];
            inner.hand = (pos + 1) % inner.ring.len();

            let entry = inner
                .entries
                .get(&kpage)
                .expect("frame ring out of sync with the entry map");
            if entry.pinned {
                continue;
            }
            let owner = entry.owner.clone();
            let upage = entry.upage;
            if owner.pagedir().is_accessed(upage) {
                // 二次机会：清除访问位，本轮放过
                owner.pagedir().set_accessed(upage, false);
                continue;
            }

            // 先撤销翻译，让牺牲页上随后的访问重新缺页
            owner.pagedir().unmap(upage);
            // 内核可能透过内核别名写过这个帧，两个别名的脏位都要看
            let dirty =
                owner.pagedir().is_dirty(upage) || owner.pagedir().is_kpage_dirty(kpage);
            let slot = self.swap.swap_out(kpage);
            {
                let mut spt = owner.spt().lock();
                spt.set_swap(upage, slot);
                spt.set_dirty(upage, dirty);
            }
            debug!("evict {upage:?} of {kpage:?} -> slot {}", slot.0);

            inner.remove(kpage);
            // SAFETY: 条目已移除，本表不再引用该页帧
            unsafe { self.palloc.dealloc(kpage) };
            return;
        }

        panic!("cannot evict any frame");
    }

    /// 移除 `kpage` 的条目并把物理页归还给分配器
    pub fn free(&self, kpage: KernelPage) {
        self.inner.lock().remove(kpage);
        // SAFETY: 条目已移除，本表不再引用该页帧
        unsafe { self.palloc.dealloc(kpage) };
    }

    /// 只移除条目，不归还物理页。用于页帧所有权已经另行移交的
    /// 场合，比如地址空间销毁时页帧随页目录一起回收
    pub fn remove_entry(&self, kpage: KernelPage) {
        self.inner.lock().remove(kpage);
    }

    /// pin 住一个驻留帧，使其不被驱逐。帧必须已登记
    pub fn pin(&self, kpage: KernelPage) {
        self.set_pinned(kpage, true);
    }

    /// 解除 pin。帧必须已登记
    pub fn unpin(&self, kpage: KernelPage) {
        self.set_pinned(kpage, false);
    }

    fn set_pinned(&self, kpage: KernelPage, pinned: bool) {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .get_mut(&kpage)
            .unwrap_or_else(|| panic!("frame {kpage:?} to pin or unpin is not registered"));
        entry.pinned = pinned;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, kpage: KernelPage) -> bool {
        self.inner.lock().entries.contains_key(&kpage)
    }
}
