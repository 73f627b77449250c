/* idxfs 的整体架构，自上而下 */

// 卷管理层：格式化、挂载与关闭，持有下面各层
mod fs;

// 索引节点层：打开索引节点表与文件的读写、扩展、删除
mod vfs;

// 磁盘数据结构层：超级块、空闲位图与盘上索引节点
mod layout;

// 块缓存层：所有扇区访问都经过的共享缓存
mod block_cache;

mod error;
mod sector;

use core::time::Duration;

pub use block_dev::{BlockDevice, MemDisk};

pub use self::{
    block_cache::{BufferCache, CacheStats, Daemons, OnDisk},
    error::{Error, Result},
    fs::FileSystem,
    layout::{
        Allocator, DIRECT_COUNT, DiskInode, FreeMap, INDIRECT_COUNT, IndexBlock, InodeKind,
        MAX_FILE_SIZE,
    },
    sector::SectorId,
    vfs::{Inode, InodeTable, Stat, StatKind},
};

/// 超级块魔数
pub const MAGIC: u32 = 0x3b800001;
/// 盘上索引节点魔数
pub const INODE_MAGIC: u32 = 0x494e4f44;
pub const SECTOR_SIZE: usize = block_dev::BLOCK_SIZE;
pub const SECTOR_BITS: usize = SECTOR_SIZE * 8;

/// 缓存槽位个数
pub const CACHE_CAPACITY: usize = 64;
/// 写回守护线程的周期
pub const WRITE_BACK_INTERVAL: Duration = Duration::from_secs(10);
/// 预读队列的最大长度，超出的请求直接丢弃
pub const READ_AHEAD_DEPTH: usize = 32;
/// 时钟淘汰的最大扫描轮数，超出则报告缓存耗尽
pub const MAX_EVICT_SWEEPS: usize = 16;

type DataBlock = [u8; SECTOR_SIZE];

/// 运行期配置
#[derive(Debug, Clone)]
pub struct Config {
    pub cache_capacity: usize,
    pub write_back_interval: Duration,
    /// 是否启动预读线程
    pub read_ahead: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_capacity: CACHE_CAPACITY,
            write_back_interval: WRITE_BACK_INTERVAL,
            read_ahead: true,
        }
    }
}
