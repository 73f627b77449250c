//! # 块设备接口层
//!
//! 块设备是以**块**（扇区）为单位存储数据的设备；
//! [`BlockDevice`] 就是对读写块设备的抽象，实现了此特质的类型称为**块设备驱动**。
//!
//! 读写都是整块、同步的，不支持块内的部分读写。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod mem_disk;

use core::any::Any;

pub use self::mem_disk::MemDisk;

/// 扇区大小
pub const BLOCK_SIZE: usize = 512;

/// 块设备驱动特质
///
/// 设备错误视为不可恢复，由驱动自行 panic。
pub trait BlockDevice: Send + Sync + Any {
    fn read_block(&self, block_id: usize, buf: &mut [u8]);
    fn write_block(&self, block_id: usize, buf: &[u8]);
}
