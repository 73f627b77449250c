#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use idxfs::{Allocator, BufferCache, Config, FreeMap, InodeTable, MemDisk, SectorId};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// 不会在测试期间自行写回的配置
pub fn quiet_config() -> Config {
    Config {
        write_back_interval: Duration::from_secs(3600),
        read_ahead: false,
        ..Config::default()
    }
}

pub struct Table {
    pub disk: Arc<MemDisk>,
    pub cache: Arc<BufferCache>,
    pub free_map: Arc<FreeMap>,
    pub inodes: InodeTable,
}

impl Table {
    /// 0 号扇区留给超级块，位图只在内存里
    pub fn new(sectors: usize, capacity: usize) -> Self {
        init_logger();
        let disk = Arc::new(MemDisk::new(sectors));
        let cache = Arc::new(BufferCache::new(disk.clone(), capacity));
        let free_map = Arc::new(FreeMap::new(SectorId::new(1), sectors));
        free_map.reserve(SectorId::new(0), 1);
        let inodes = InodeTable::new(cache.clone(), free_map.clone() as Arc<dyn Allocator>);

        Self {
            disk,
            cache,
            free_map,
            inodes,
        }
    }

    /// 分配扇区并创建索引节点
    pub fn create(&self, length: usize) -> SectorId {
        let sector = self.free_map.allocate(1).unwrap();
        self.inodes
            .create(sector, length, SectorId::new(0), Default::default())
            .unwrap();
        sector
    }
}

/// 轮询直到条件成立或超时
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
