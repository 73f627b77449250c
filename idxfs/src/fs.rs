use std::sync::Arc;

use spin::Mutex;

use crate::layout::{Allocator, FreeMap, InodeKind, SuperBlock};
use crate::{
    BlockDevice, BufferCache, Config, Daemons, Error, Inode, InodeTable, Result, SectorId,
};

const SUPER_BLOCK: SectorId = SectorId::new(0);

/// 一个卷：块缓存、空闲位图、打开索引节点表与后台线程
///
/// 释放时自动关闭，见 [`FileSystem::shutdown`]。
#[derive(Debug)]
pub struct FileSystem {
    cache: Arc<BufferCache>,
    free_map: Arc<FreeMap>,
    inodes: InodeTable,
    /// 根目录索引节点所在扇区
    root: SectorId,
    daemons: Mutex<Option<Daemons>>,
}

impl FileSystem {
    /// 在设备上创建新的卷
    pub fn format(
        device: Arc<dyn BlockDevice>,
        total_sectors: usize,
        config: Config,
    ) -> Result<Self> {
        let free_map_sectors = FreeMap::sectors_for(total_sectors);
        // 超级块、位图与根目录至少要放得下
        if total_sectors < free_map_sectors + 2 || total_sectors > u32::MAX as usize {
            return Err(Error::NoSpace);
        }

        let cache = Arc::new(BufferCache::new(device, config.cache_capacity));
        let free_map = Arc::new(FreeMap::new(SUPER_BLOCK + 1, total_sectors));
        free_map.reserve(SUPER_BLOCK, 1);
        free_map.reserve(free_map.start(), free_map.sectors());
        let root = free_map.allocate(1).ok_or(Error::NoSpace)?;

        cache.map_mut(SUPER_BLOCK, 0, |super_block: &mut SuperBlock| {
            super_block.init(
                total_sectors as u32,
                free_map.start(),
                free_map.sectors() as u32,
                root,
            )
        })?;

        let inodes = InodeTable::new(
            Arc::clone(&cache),
            Arc::clone(&free_map) as Arc<dyn Allocator>,
        );
        // 根目录的父目录是它自己
        inodes.create(root, 0, root, InodeKind::Directory)?;

        free_map.store(&cache)?;
        cache.write_back_all();

        log::info!(
            "formatted {total_sectors} sectors: {free_map_sectors} free map sectors, root at {root}"
        );
        Self::assemble(cache, free_map, inodes, root, &config)
    }

    /// 打开设备上已有的卷
    pub fn mount(device: Arc<dyn BlockDevice>, config: Config) -> Result<Self> {
        let cache = Arc::new(BufferCache::new(device, config.cache_capacity));

        let super_block = cache.map(SUPER_BLOCK, 0, |super_block: &SuperBlock| *super_block)?;
        if !super_block.is_valid() {
            return Err(Error::BadSuperBlock);
        }

        let free_map = Arc::new(FreeMap::load(
            &cache,
            SectorId::from(super_block.free_map_start),
            super_block.total_sectors as usize,
        )?);
        let root = SectorId::from(super_block.root);
        let inodes = InodeTable::new(
            Arc::clone(&cache),
            Arc::clone(&free_map) as Arc<dyn Allocator>,
        );

        log::info!(
            "mounted {} sectors, {} free",
            super_block.total_sectors,
            free_map.free_count()
        );
        Self::assemble(cache, free_map, inodes, root, &config)
    }

    fn assemble(
        cache: Arc<BufferCache>,
        free_map: Arc<FreeMap>,
        inodes: InodeTable,
        root: SectorId,
        config: &Config,
    ) -> Result<Self> {
        let daemons = Daemons::spawn(&cache, config.write_back_interval, config.read_ahead)?;
        Ok(Self {
            cache,
            free_map,
            inodes,
            root,
            daemons: Mutex::new(Some(daemons)),
        })
    }

    /// 分配一个扇区并在上面创建索引节点，父目录记为根目录
    pub fn create(&self, length: usize, kind: InodeKind) -> Result<SectorId> {
        let sector = self.free_map.allocate(1).ok_or(Error::NoSpace)?;
        if let Err(err) = self.inodes.create(sector, length, self.root, kind) {
            self.free_map.release(sector, 1);
            return Err(err);
        }
        Ok(sector)
    }

    pub fn root(&self) -> Result<Arc<Inode>> {
        self.inodes.open(self.root)
    }

    #[inline]
    pub fn root_sector(&self) -> SectorId {
        self.root
    }

    #[inline]
    pub fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    #[inline]
    pub fn cache(&self) -> &Arc<BufferCache> {
        &self.cache
    }

    #[inline]
    pub fn free_map(&self) -> &FreeMap {
        &self.free_map
    }

    /// 停止后台线程，写回空闲位图与全部脏扇区；可以重复调用
    pub fn shutdown(&self) -> Result<()> {
        let daemons = self.daemons.lock().take();
        if let Some(daemons) = daemons {
            daemons.stop();
        }

        self.free_map.store(&self.cache)?;
        let flushed = self.cache.write_back_all();
        log::info!("shutdown: {flushed} sectors written back");
        Ok(())
    }
}

impl Drop for FileSystem {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::error!("failed to shut down: {err}");
        }
    }
}
