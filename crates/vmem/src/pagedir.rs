use crate::address::{KernelPage, VirtPageNum};

/// 硬件页目录的抽象，由外围内核提供。
///
/// 约定：`unmap` 只撤销翻译，被撤销映射的 accessed/dirty 位
/// 在该页重新映射之前仍然可以查询。硬件 PTE 正是如此，
/// 清除 present 位并不清除状态位，驱逐路径依赖这一点
/// 在撤销翻译之后再观测脏位。
pub trait PageDirectory: Send + Sync {
    /// 建立 `upage -> kpage` 的映射。页目录内部分配失败时返回 false
    fn map(&self, upage: VirtPageNum, kpage: KernelPage, writable: bool) -> bool;

    /// 撤销 `upage` 的翻译，此后的访问将重新缺页
    fn unmap(&self, upage: VirtPageNum);

    fn is_accessed(&self, upage: VirtPageNum) -> bool;

    fn set_accessed(&self, upage: VirtPageNum, accessed: bool);

    /// 用户别名的 dirty 位
    fn is_dirty(&self, upage: VirtPageNum) -> bool;

    fn set_dirty(&self, upage: VirtPageNum, dirty: bool);

    /// 内核别名的 dirty 位。内核可能透过 kpage 写入同一个页帧，
    /// 所以观测脏状态时两个别名都要看
    fn is_kpage_dirty(&self, kpage: KernelPage) -> bool;

    fn set_kpage_dirty(&self, kpage: KernelPage, dirty: bool);
}
