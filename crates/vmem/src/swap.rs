//! 交换区：以页为粒度管理块设备上的槽位。
//!
//! 占用状态由内存中的位图记录，重启后不保留，
//! 所有槽位在初始化时都视为空闲。

use alloc::{sync::Arc, vec, vec::Vec};

use defines::config::{SECTORS_PER_PAGE, SECTOR_SIZE};
use log::{info, trace};
use spin::mutex::SpinMutex;

use crate::{address::KernelPage, block_dev::BlockDevice};

/// 交换区槽位编号。编号为 `i` 的槽位对应设备上
/// `[i * SECTORS_PER_PAGE, (i + 1) * SECTORS_PER_PAGE)` 的扇区
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapSlot(pub usize);

pub struct SwapStore {
    dev: Arc<dyn BlockDevice>,
    occupied: SpinMutex<Bitmap>,
    slot_count: usize,
}

impl SwapStore {
    /// 绑定交换设备，槽位数由设备容量决定
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        let slot_count = dev.num_blocks() / SECTORS_PER_PAGE;
        info!(
            "swap store: {slot_count} slots over {} sectors",
            dev.num_blocks()
        );
        Self {
            dev,
            occupied: SpinMutex::new(Bitmap::new(slot_count)),
            slot_count,
        }
    }

    /// 把 `kpage` 的内容写出到第一个空闲槽位，返回其编号。
    /// 交换区耗尽是致命错误
    pub fn swap_out(&self, kpage: KernelPage) -> SwapSlot {
        let slot = self.occupied.lock().alloc().expect("swap store exhausted");
        // SAFETY: 调用者保证 kpage 在换出期间有效且无并发写入
        let bytes = unsafe { kpage.as_bytes() };
        for i in 0..SECTORS_PER_PAGE {
            self.dev.write_block(
                slot * SECTORS_PER_PAGE + i,
                &bytes[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE],
            );
        }
        trace!("swap out {kpage:?} -> slot {slot}");
        SwapSlot(slot)
    }

    /// 把 `slot` 的内容读入 `kpage`，并释放该槽位。
    /// 此后该页与槽位不再有任何关联
    pub fn swap_in(&self, slot: SwapSlot, kpage: KernelPage) {
        self.check_occupied(slot);
        // SAFETY: 调用者保证 kpage 已被分配且由本线程独占
        let bytes = unsafe { kpage.as_bytes_mut() };
        for i in 0..SECTORS_PER_PAGE {
            self.dev.read_block(
                slot.0 * SECTORS_PER_PAGE + i,
                &mut bytes[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE],
            );
        }
        trace!("swap in slot {} -> {kpage:?}", slot.0);
        self.occupied.lock().clear(slot.0);
    }

    /// 直接释放一个占用中的槽位，丢弃其内容
    pub fn free(&self, slot: SwapSlot) {
        self.check_occupied(slot);
        self.occupied.lock().clear(slot.0);
    }

    /// 释放或读回一个未分配的槽位说明内核记账出了问题
    fn check_occupied(&self, slot: SwapSlot) {
        assert!(
            slot.0 < self.slot_count,
            "swap slot {} out of range",
            slot.0
        );
        assert!(
            self.occupied.lock().test(slot.0),
            "swap slot {} is not occupied",
            slot.0
        );
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn used_slots(&self) -> usize {
        self.occupied.lock().used()
    }

    pub fn free_slots(&self) -> usize {
        self.slot_count - self.used_slots()
    }
}

/// 槽位占用位图，置位表示占用。按 u64 分组扫描空闲位
struct Bitmap {
    words: Vec<u64>,
    len: usize,
    used: usize,
}

impl Bitmap {
    fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(u64::BITS as usize)],
            len,
            used: 0,
        }
    }

    /// 找到第一个空闲位并置位
    fn alloc(&mut self) -> Option<usize> {
        let (word_pos, word) = self
            .words
            .iter_mut()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)?;
        let inner_pos = word.trailing_ones() as usize;
        let pos = word_pos * u64::BITS as usize + inner_pos;
        if pos >= self.len {
            return None;
        }
        *word |= 1 << inner_pos;
        self.used += 1;
        Some(pos)
    }

    fn clear(&mut self, pos: usize) {
        debug_assert!(self.test(pos));
        self.words[pos / u64::BITS as usize] &= !(1 << (pos % u64::BITS as usize));
        self.used -= 1;
    }

    fn test(&self, pos: usize) -> bool {
        self.words[pos / u64::BITS as usize] & (1 << (pos % u64::BITS as usize)) != 0
    }

    fn used(&self) -> usize {
        self.used
    }
}
