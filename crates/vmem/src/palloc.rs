use bitflags::bitflags;

use crate::address::KernelPage;

bitflags! {
    /// 物理页分配标志
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AllocFlags: u8 {
        /// 从用户内存池中分配
        const USER = 1 << 0;
        /// 分配后清零
        const ZERO = 1 << 1;
    }
}

/// 物理页帧分配器，由外围内核提供。
///
/// 页帧表从这里取得用户页帧，驱逐时归还；munmap 写回换出页时
/// 也从这里借一个临时页帧做中转。
pub trait FrameAllocator: Send + Sync {
    /// 分配一个页帧，返回其内核别名；内存耗尽时返回 `None`
    fn alloc(&self, flags: AllocFlags) -> Option<KernelPage>;

    /// # Safety
    ///
    /// 需保证 `kpage` 之前由同一个分配器分配，且此后不再被访问
    unsafe fn dealloc(&self, kpage: KernelPage);
}
