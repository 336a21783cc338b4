//! 补充页表：记录一个地址空间里每个已知用户页的后备来源。
//!
//! 每个用户页至多一条记录，硬件页表翻译不了的页都要靠它
//! 才能在缺页时重新物质化。

use alloc::{
    collections::{btree_map, BTreeMap},
    sync::Arc,
};

use defines::config::PAGE_SIZE;

use crate::{
    address::{KernelPage, VirtPageNum},
    file::VmFile,
    swap::SwapSlot,
};

/// 一个用户页当前的后备形态，查询接口用
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageStatus {
    AllZeros,
    OnFrame,
    OnSwap,
    FromFilesys,
}

/// 页的后备描述，带数据的判别变体。
/// 状态转移只发生在缺页解决、驱逐和 munmap 这几条路径上
#[derive(Clone)]
pub(crate) enum Backing {
    /// 尚未被访问过，首次缺页时填零
    AllZeros,
    /// 驻留在物理页帧中
    OnFrame { kpage: KernelPage },
    /// 被换出到交换区
    OnSwap { slot: SwapSlot },
    /// 以文件内容为后备，首次缺页时从文件读入
    FromFilesys {
        file: Arc<dyn VmFile>,
        offset: usize,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    },
}

impl Backing {
    fn status(&self) -> PageStatus {
        match self {
            Backing::AllZeros => PageStatus::AllZeros,
            Backing::OnFrame { .. } => PageStatus::OnFrame,
            Backing::OnSwap { .. } => PageStatus::OnSwap,
            Backing::FromFilesys { .. } => PageStatus::FromFilesys,
        }
    }
}

pub(crate) struct PageEntry {
    /// 累计的脏观测。只会被置位，不随换入换出清除
    pub dirty: bool,
    pub backing: Backing,
}

pub(crate) struct SupplementalPageTable {
    map: BTreeMap<VirtPageNum, PageEntry>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    /// 为刚获得页帧的页登记驻留项。该页已有记录时返回 false
    pub fn install_frame(&mut self, upage: VirtPageNum, kpage: KernelPage) -> bool {
        match self.map.entry(upage) {
            btree_map::Entry::Occupied(_) => false,
            btree_map::Entry::Vacant(vacant) => {
                vacant.insert(PageEntry {
                    dirty: false,
                    backing: Backing::OnFrame { kpage },
                });
                true
            }
        }
    }

    /// 登记一个首次访问时填零的页。重复登记是内核错误
    pub fn install_zeropage(&mut self, upage: VirtPageNum) {
        let prev = self.map.insert(
            upage,
            PageEntry {
                dirty: false,
                backing: Backing::AllZeros,
            },
        );
        assert!(prev.is_none(), "duplicated entry for zero page {upage:?}");
    }

    /// 登记一个以文件内容为后备的页。重复登记是内核错误
    pub fn install_filesys(
        &mut self,
        upage: VirtPageNum,
        file: Arc<dyn VmFile>,
        offset: usize,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) {
        debug_assert_eq!(read_bytes + zero_bytes, PAGE_SIZE);
        let prev = self.map.insert(
            upage,
            PageEntry {
                dirty: false,
                backing: Backing::FromFilesys {
                    file,
                    offset,
                    read_bytes,
                    zero_bytes,
                    writable,
                },
            },
        );
        assert!(prev.is_none(), "duplicated entry for file page {upage:?}");
    }

    /// 把已有的项转为换出状态，清除其页帧。项不存在时返回 false
    pub fn set_swap(&mut self, upage: VirtPageNum, slot: SwapSlot) -> bool {
        match self.map.get_mut(&upage) {
            Some(entry) => {
                entry.backing = Backing::OnSwap { slot };
                true
            }
            None => false,
        }
    }

    /// 把已有的项转为驻留状态，缺页解决的最后一步
    pub fn set_frame(&mut self, upage: VirtPageNum, kpage: KernelPage) {
        let entry = self
            .map
            .get_mut(&upage)
            .unwrap_or_else(|| panic!("page {upage:?} vanished while being loaded"));
        entry.backing = Backing::OnFrame { kpage };
    }

    /// 累计脏标记。页不存在是内核错误
    pub fn set_dirty(&mut self, upage: VirtPageNum, dirty: bool) {
        let entry = self
            .map
            .get_mut(&upage)
            .unwrap_or_else(|| panic!("page {upage:?} does not exist"));
        entry.dirty |= dirty;
    }

    pub fn find(&self, upage: VirtPageNum) -> Option<&PageEntry> {
        self.map.get(&upage)
    }

    pub fn has_entry(&self, upage: VirtPageNum) -> bool {
        self.map.contains_key(&upage)
    }

    pub fn status(&self, upage: VirtPageNum) -> Option<PageStatus> {
        self.map.get(&upage).map(|entry| entry.backing.status())
    }

    pub fn remove(&mut self, upage: VirtPageNum) -> Option<PageEntry> {
        self.map.remove(&upage)
    }

    /// 取走全部记录，地址空间销毁时用
    pub fn drain(&mut self) -> BTreeMap<VirtPageNum, PageEntry> {
        core::mem::take(&mut self.map)
    }
}
