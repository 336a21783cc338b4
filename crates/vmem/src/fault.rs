//! 缺页解决：按补充页表的记录把一个用户页物质化并建立硬件映射。
//!
//! 同一套协议覆盖了按需填零、换入和文件按需装载三种来源；
//! 内核对用户缓冲区做 I/O 前的预载和 pin 也建立在它之上。

use defines::{
    config::PAGE_SIZE,
    error::{errno, KResult},
};
use log::{trace, warn};
use triomphe::Arc;

use crate::{
    address::{VirtAddr, VirtPageNum, VpnRange},
    memory_space::AddressSpace,
    page::Backing,
    palloc::AllocFlags,
    Vm,
};

impl Vm {
    /// 让 `upage` 驻留并映射好。页不存在或物质化失败时返回错误，
    /// 由上层的缺页处理决定是否终止进程。
    /// 对已经驻留的页调用是无害的空操作
    pub fn load_page(&self, space: &Arc<AddressSpace>, upage: VirtPageNum) -> KResult {
        // 先快照后备描述。不能跨页帧分配持有补充页表的锁，
        // 否则会和驱逐路径（先拿页帧表锁再拿补充页表锁）死锁
        let backing = {
            let spt = space.spt().lock();
            match spt.find(upage) {
                None => return Err(errno::EFAULT),
                Some(entry) => {
                    if let Backing::OnFrame { .. } = entry.backing {
                        // 与并发缺页竞争时后到者直接完成
                        return Ok(());
                    }
                    entry.backing.clone()
                }
            }
        };

        // 新页帧处于 pin 状态，期间不会被并发缺页驱逐
        let kpage = self.frame_table().alloc(AllocFlags::USER, space, upage);

        // 按后备形态填充内容，并确定映射的写权限
        let writable = match &backing {
            Backing::AllZeros => {
                // SAFETY: 页帧刚分配且被 pin 住，本线程独占
                unsafe { kpage.as_bytes_mut().fill(0) };
                true
            }
            Backing::OnSwap { slot } => {
                // 读回之后槽位即告释放
                self.swap().swap_in(*slot, kpage);
                true
            }
            Backing::FromFilesys {
                file,
                offset,
                read_bytes,
                zero_bytes,
                writable,
            } => {
                debug_assert_eq!(read_bytes + zero_bytes, PAGE_SIZE);
                // SAFETY: 同上
                let buf = unsafe { kpage.as_bytes_mut() };
                let n = file.read_at(*offset, &mut buf[..*read_bytes]);
                if n != *read_bytes {
                    warn!("short read for {upage:?}: {n} of {read_bytes} bytes");
                    self.frame_table().free(kpage);
                    return Err(errno::EIO);
                }
                buf[*read_bytes..].fill(0);
                *writable
            }
            Backing::OnFrame { .. } => unreachable!("resident pages returned above"),
        };

        if !space.pagedir().map(upage, kpage, writable) {
            self.frame_table().free(kpage);
            return Err(errno::ENOMEM);
        }

        space.spt().lock().set_frame(upage, kpage);
        // 新装载的页按约定是干净的
        space.pagedir().set_kpage_dirty(kpage, false);
        self.frame_table().unpin(kpage);
        trace!("loaded {upage:?} into {kpage:?}");
        Ok(())
    }

    /// 若 `upage` 驻留则 pin 住其页帧；没有这个页时静默返回
    pub fn pin_page(&self, space: &AddressSpace, upage: VirtPageNum) {
        let kpage = {
            let spt = space.spt().lock();
            match spt.find(upage) {
                None => return,
                Some(entry) => match entry.backing {
                    Backing::OnFrame { kpage } => kpage,
                    _ => panic!("page {upage:?} to pin is not resident"),
                },
            }
        };
        self.frame_table().pin(kpage);
    }

    /// 解除 `upage` 页帧的 pin。页不存在是内核错误
    pub fn unpin_page(&self, space: &AddressSpace, upage: VirtPageNum) {
        let kpage = {
            let spt = space.spt().lock();
            let entry = spt
                .find(upage)
                .unwrap_or_else(|| panic!("page {upage:?} to unpin does not exist"));
            match entry.backing {
                Backing::OnFrame { kpage } => Some(kpage),
                _ => None,
            }
        };
        if let Some(kpage) = kpage {
            self.frame_table().unpin(kpage);
        }
    }

    /// 内核对用户缓冲区做 I/O 之前，把覆盖到的页全部载入并 pin 住。
    /// 这样 I/O 路径不会在持有文件系统锁时再次缺页，避免自死锁
    pub fn pin_user_buffer(&self, space: &Arc<AddressSpace>, buf: VirtAddr, len: usize) {
        for upage in VpnRange::covering(buf, len) {
            // 载入失败的页（比如根本无效的地址）留给 I/O 路径自己报错
            let _ = self.load_page(space, upage);
            self.pin_page(space, upage);
        }
    }

    /// I/O 完成后解除 pin，无论 I/O 本身成败
    pub fn unpin_user_buffer(&self, space: &AddressSpace, buf: VirtAddr, len: usize) {
        for upage in VpnRange::covering(buf, len) {
            self.unpin_page(space, upage);
        }
    }
}
