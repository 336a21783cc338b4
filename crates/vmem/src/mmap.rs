//! 内存映射文件：安装和解除文件后备的页区间，解除时把脏页写回。
//!
//! 文件描述符的解析和校验属于系统调用层；这里拿到的已经是一个
//! 打开的文件句柄，安装前会私有地 reopen 一份，使映射不受用户
//! 关闭描述符的影响。

use alloc::sync::Arc;

use defines::{
    config::PAGE_SIZE,
    error::{errno, KResult},
};
use log::debug;

use crate::{
    address::{VirtAddr, VirtPageNum},
    file::VmFile,
    memory_space::AddressSpace,
    page::Backing,
    palloc::AllocFlags,
    Vm,
};

/// 一次 mmap 映射的登记号，进程内唯一
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct MmapId(pub usize);

pub(crate) struct MmapDescriptor {
    pub id: MmapId,
    /// 私有 reopen 出来的句柄，解除映射时随描述符一起关闭
    pub file: Arc<dyn VmFile>,
    pub addr: VirtAddr,
    /// 文件长度，也即映射覆盖的字节数
    pub size: usize,
}

impl Vm {
    /// 把 `file` 的内容映射到 `addr` 起的连续用户页上，返回登记号。
    ///
    /// `addr` 必须非空且页对齐；空文件和与已有页重叠的区间都被拒绝，
    /// 拒绝时不会留下任何部分安装的页
    pub fn mmap(
        &self,
        space: &AddressSpace,
        file: &Arc<dyn VmFile>,
        addr: VirtAddr,
    ) -> KResult<MmapId> {
        if addr.0 == 0 || addr.page_offset() != 0 {
            return Err(errno::EINVAL);
        }
        // 私有地重新打开，用户关掉原来的描述符也不影响映射
        let file = file.reopen().ok_or(errno::EBADF)?;
        if file.is_empty() {
            return Err(errno::EINVAL);
        }
        let size = file.len();

        // 先整体查重再安装，部分安装会破坏已有的映射
        for offset in (0..size).step_by(PAGE_SIZE) {
            if space.has_entry((addr + offset).vpn_floor()) {
                return Err(errno::EEXIST);
            }
        }
        for offset in (0..size).step_by(PAGE_SIZE) {
            let read_bytes = usize::min(PAGE_SIZE, size - offset);
            space.install_filesys(
                (addr + offset).vpn_floor(),
                file.clone(),
                offset,
                read_bytes,
                PAGE_SIZE - read_bytes,
                true,
            );
        }

        let mut mmaps = space.mmaps().lock();
        let id = MmapId(mmaps.last().map_or(1, |desc| desc.id.0 + 1));
        mmaps.push(MmapDescriptor {
            id,
            file,
            addr,
            size,
        });
        debug!("mmap {addr:?} size {size} -> id {}", id.0);
        Ok(id)
    }

    /// 解除编号为 `id` 的映射：逐页写回脏内容，移除记录，
    /// 最后关闭私有的文件句柄。未知的编号返回错误
    pub fn munmap(&self, space: &AddressSpace, id: MmapId) -> KResult {
        let desc = {
            let mut mmaps = space.mmaps().lock();
            let pos = mmaps
                .iter()
                .position(|desc| desc.id == id)
                .ok_or(errno::ENOENT)?;
            mmaps.remove(pos)
        };
        for offset in (0..desc.size).step_by(PAGE_SIZE) {
            let bytes = usize::min(PAGE_SIZE, desc.size - offset);
            self.munmap_page(space, (desc.addr + offset).vpn_floor(), &desc.file, offset, bytes);
        }
        debug!("munmap id {} at {:?}", id.0, desc.addr);
        // desc 连同 reopen 的句柄在此丢弃
        Ok(())
    }

    /// 解除单个页，按其当前形态决定写回方式
    pub(crate) fn munmap_page(
        &self,
        space: &AddressSpace,
        upage: VirtPageNum,
        file: &Arc<dyn VmFile>,
        offset: usize,
        bytes: usize,
    ) {
        let (was_dirty, backing) = {
            let spt = space.spt().lock();
            let entry = spt
                .find(upage)
                .unwrap_or_else(|| panic!("page {upage:?} of an active mapping is missing"));
            (entry.dirty, entry.backing.clone())
        };

        match backing {
            Backing::OnFrame { kpage } => {
                // 写回期间页帧不能被驱逐
                self.frame_table().pin(kpage);
                let pd = space.pagedir();
                let dirty = was_dirty || pd.is_dirty(upage) || pd.is_kpage_dirty(kpage);
                if dirty {
                    // SAFETY: 页帧已被 pin 住，写回期间不会被释放
                    let data = unsafe { kpage.as_bytes() };
                    file.write_at(offset, &data[..bytes]);
                }
                // 先写回，再撤销页帧和映射
                self.frame_table().free(kpage);
                pd.unmap(upage);
            }
            Backing::OnSwap { slot } => {
                let dirty = was_dirty || space.pagedir().is_dirty(upage);
                if dirty {
                    // 换出的脏页借一个临时页帧中转；文件层会在
                    // 文件末尾截断写入，所以整页写出即可
                    let scratch = self
                        .palloc()
                        .alloc(AllocFlags::empty())
                        .expect("no scratch frame for mmap write back");
                    self.swap().swap_in(slot, scratch);
                    // SAFETY: scratch 由本函数独占
                    let data = unsafe { scratch.as_bytes() };
                    file.write_at(offset, data);
                    // SAFETY: 中转完毕，页帧归还给分配器
                    unsafe { self.palloc().dealloc(scratch) };
                } else {
                    self.swap().free(slot);
                }
            }
            // 从未真正载入过，文件里仍是原始内容
            Backing::FromFilesys { .. } => {}
            Backing::AllZeros => panic!("zero page {upage:?} inside a file mapping"),
        }

        space.spt().lock().remove(upage);
    }
}
