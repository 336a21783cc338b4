/// 一个页大小的 bit 数
pub const PAGE_SIZE_BITS: usize = 12;
/// 页大小
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_BITS;
/// 页内偏移的掩码
pub const PAGE_OFFSET_MASK: usize = PAGE_SIZE - 1;

/// 块设备的扇区大小
pub const SECTOR_SIZE: usize = 512;
/// 一个页占用的扇区数，交换区以此为槽位粒度
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

const _: () = assert!(PAGE_SIZE % SECTOR_SIZE == 0 && SECTORS_PER_PAGE > 0);
