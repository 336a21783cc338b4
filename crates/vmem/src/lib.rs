//! 教学内核的虚拟内存核心。
//!
//! 用有限的物理页帧、一个交换设备、填零页和文件后备页共同支撑
//! 用户进程的地址空间：全局的页帧表实施时钟（二次机会）驱逐，
//! 每个地址空间的补充页表记录如何按需物质化它的页，交换区提供
//! 固定大小的槽位存放被驱逐的页。
//!
//! 物理页分配器、硬件页目录、块设备和文件系统都是外部协作者，
//! 以 trait 的形式注入，所以测试可以在宿主机上构造一份完整的核心。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod address;
mod block_dev;
mod fault;
mod file;
mod frame_table;
mod memory_space;
mod mmap;
mod page;
mod pagedir;
mod palloc;
mod swap;

use alloc::sync::Arc;

use log::info;

pub use self::address::{KernelPage, VirtAddr, VirtPageNum, VpnRange};
pub use self::block_dev::BlockDevice;
pub use self::file::VmFile;
pub use self::frame_table::FrameTable;
pub use self::memory_space::AddressSpace;
pub use self::mmap::MmapId;
pub use self::page::PageStatus;
pub use self::pagedir::PageDirectory;
pub use self::palloc::{AllocFlags, FrameAllocator};
pub use self::swap::{SwapSlot, SwapStore};

use self::page::Backing;

/// 虚拟内存核心：页帧表、交换区和物理分配器句柄的唯一拥有者。
///
/// 没有任何隐藏的全局状态，内核（或每个测试）自行构造一份，
/// 地址空间相关的操作都从这里进入
pub struct Vm {
    frames: FrameTable,
    swap: triomphe::Arc<SwapStore>,
    palloc: Arc<dyn FrameAllocator>,
}

impl Vm {
    /// 绑定物理页分配器与交换设备
    pub fn new(palloc: Arc<dyn FrameAllocator>, swap_dev: Arc<dyn BlockDevice>) -> Self {
        let swap = triomphe::Arc::new(SwapStore::new(swap_dev));
        info!("vm core ready, {} swap slots", swap.slot_count());
        Self {
            frames: FrameTable::new(palloc.clone(), swap.clone()),
            swap,
            palloc,
        }
    }

    pub fn frame_table(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapStore {
        &self.swap
    }

    pub(crate) fn palloc(&self) -> &dyn FrameAllocator {
        &*self.palloc
    }

    /// 销毁一个地址空间的虚拟内存记录。
    ///
    /// 残留的 mmap 区域先按 munmap 的语义解除（脏页写回文件），
    /// 然后清空补充页表：驻留页只摘除页帧表条目，物理页帧由内核
    /// 的页目录销毁路径统一回收；换出页释放交换槽位
    pub fn destroy_space(&self, space: &AddressSpace) {
        loop {
            let id = space.mmaps().lock().first().map(|desc| desc.id);
            match id {
                Some(id) => {
                    let _ = self.munmap(space, id);
                }
                None => break,
            }
        }

        let entries = space.spt().lock().drain();
        for (_, entry) in entries {
            match entry.backing {
                Backing::OnFrame { kpage } => self.frames.remove_entry(kpage),
                Backing::OnSwap { slot } => self.swap.free(slot),
                Backing::AllZeros | Backing::FromFilesys { .. } => {}
            }
        }
    }
}
