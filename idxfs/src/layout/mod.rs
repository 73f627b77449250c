//! # 磁盘数据结构层
//!
//! idxfs 的磁盘布局：
//! 超级块 | 空闲位图 | 根目录索引节点 | 数据与索引块

mod super_block;
pub use super_block::SuperBlock;

mod bitmap;
pub use bitmap::{Allocator, FreeMap};

mod inode;
pub use inode::{
    DIRECT_COUNT, DiskInode, INDIRECT_COUNT, IndexBlock, InodeKind, MAX_FILE_SIZE,
};
