//! 用户地址空间的虚拟内存侧：硬件页目录句柄、补充页表，
//! 以及尚未解除的 mmap 登记。
//!
//! 每个地址空间私有，除了所属进程的系统调用之外，只有驱逐路径
//! 会经由页帧表里的 owner 反向链接触碰它。

use alloc::vec::Vec;

use spin::mutex::SpinMutex;
use triomphe::Arc;

use crate::{
    address::{KernelPage, VirtPageNum},
    file::VmFile,
    mmap::MmapDescriptor,
    page::{Backing, PageStatus, SupplementalPageTable},
    pagedir::PageDirectory,
};

pub struct AddressSpace {
    pagedir: alloc::sync::Arc<dyn PageDirectory>,
    spt: SpinMutex<SupplementalPageTable>,
    mmaps: SpinMutex<Vec<MmapDescriptor>>,
}

impl AddressSpace {
    /// 围绕外部给定的硬件页目录创建一个空的地址空间
    pub fn new(pagedir: alloc::sync::Arc<dyn PageDirectory>) -> Arc<Self> {
        Arc::new(Self {
            pagedir,
            spt: SpinMutex::new(SupplementalPageTable::new()),
            mmaps: SpinMutex::new(Vec::new()),
        })
    }

    pub fn pagedir(&self) -> &dyn PageDirectory {
        &*self.pagedir
    }

    pub(crate) fn spt(&self) -> &SpinMutex<SupplementalPageTable> {
        &self.spt
    }

    pub(crate) fn mmaps(&self) -> &SpinMutex<Vec<MmapDescriptor>> {
        &self.mmaps
    }

    /// 登记一个已经驻留的页，进程装载器安装初始段时用。
    /// 调用者需已经建立硬件映射、持有页帧的 pin，安装完成后自行解除。
    /// 该页已有记录时返回 false
    pub fn install_frame(&self, upage: VirtPageNum, kpage: KernelPage) -> bool {
        self.spt.lock().install_frame(upage, kpage)
    }

    /// 登记一个首次访问时填零的页，BSS 或栈增长用
    pub fn install_zeropage(&self, upage: VirtPageNum) {
        self.spt.lock().install_zeropage(upage);
    }

    /// 登记一个以文件内容为后备的页，代码段和 mmap 区域用。
    /// 首次缺页时从 `offset` 读入 `read_bytes` 字节，其余填零
    pub fn install_filesys(
        &self,
        upage: VirtPageNum,
        file: alloc::sync::Arc<dyn VmFile>,
        offset: usize,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) {
        self.spt
            .lock()
            .install_filesys(upage, file, offset, read_bytes, zero_bytes, writable);
    }

    pub fn has_entry(&self, upage: VirtPageNum) -> bool {
        self.spt.lock().has_entry(upage)
    }

    pub fn page_status(&self, upage: VirtPageNum) -> Option<PageStatus> {
        self.spt.lock().status(upage)
    }

    /// 若该页驻留则返回其页帧
    pub fn resident_page(&self, upage: VirtPageNum) -> Option<KernelPage> {
        match self.spt.lock().find(upage)?.backing {
            Backing::OnFrame { kpage } => Some(kpage),
            _ => None,
        }
    }

    /// 累计该页的脏标记。页不存在是内核错误
    pub fn set_dirty(&self, upage: VirtPageNum, dirty: bool) {
        self.spt.lock().set_dirty(upage, dirty);
    }
}
