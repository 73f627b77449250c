//! # 索引节点层
//!
//! 打开的索引节点登记在 [`InodeTable`] 里，同一扇区的多次打开共享同一个 [`Inode`]；
//! 最后一次关闭时离开登记表，已被删除的还会归还它占据的全部扇区。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use enumflags2::bitflags;
use spin::{Mutex, MutexGuard};

use crate::layout::{Allocator, DiskInode, InodeKind};
use crate::{BufferCache, Error, MAX_FILE_SIZE, Result, SECTOR_SIZE, SectorId};

/// 打开索引节点表
pub struct InodeTable {
    cache: Arc<BufferCache>,
    allocator: Arc<dyn Allocator>,
    /// 扇区 -> 打开的索引节点
    open: Mutex<BTreeMap<SectorId, Arc<Inode>>>,
}

pub struct Inode {
    /// 索引节点所在扇区，也是它的身份
    sector: SectorId,
    cache: Arc<BufferCache>,
    allocator: Arc<dyn Allocator>,
    inner: Mutex<InodeInner>,
}

struct InodeInner {
    open_count: usize,
    /// 大于 0 时拒绝写入
    deny_write_count: usize,
    /// 最后一次关闭时删除
    removed: bool,
    /// 盘上记录的副本，每次改动后同步写入缓存
    disk: DiskInode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub sector: SectorId,
    pub kind: StatKind,
    /// 文件长度（字节）
    pub size: usize,
    /// 占据的扇区数，包括索引块
    pub sectors: usize,
}

#[allow(clippy::upper_case_acronyms)]
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StatKind {
    DIR = 0o040000,
    #[default]
    FILE = 0o100000,
}

impl From<InodeKind> for StatKind {
    fn from(kind: InodeKind) -> Self {
        match kind {
            InodeKind::File => Self::FILE,
            InodeKind::Directory => Self::DIR,
        }
    }
}

impl InodeTable {
    pub fn new(cache: Arc<BufferCache>, allocator: Arc<dyn Allocator>) -> Self {
        Self {
            cache,
            allocator,
            open: Mutex::new(BTreeMap::new()),
        }
    }

    /// 在扇区 `sector` 上写入一个长度为 `length` 的新索引节点，数据块全部分配并清零
    pub fn create(
        &self,
        sector: SectorId,
        length: usize,
        parent: SectorId,
        kind: InodeKind,
    ) -> Result<()> {
        if length > MAX_FILE_SIZE {
            return Err(Error::FileTooLarge);
        }

        // 先落下空记录，扩展失败时只剩这一个扇区要由调用者归还
        let mut disk_inode = DiskInode::new(parent, kind);
        self.cache
            .map_mut(sector, 0, |dest: &mut DiskInode| *dest = disk_inode)?;
        disk_inode.expand_to(sector, length as u32, &self.cache, self.allocator.as_ref())?;

        log::debug!("inode {sector} created: {kind:?}, {length} bytes");
        Ok(())
    }

    /// 打开扇区上的索引节点；已打开时只增加打开计数
    pub fn open(&self, sector: SectorId) -> Result<Arc<Inode>> {
        let mut open = self.open.lock();

        if let Some(inode) = open.get(&sector) {
            inode.inner.lock().open_count += 1;
            return Ok(Arc::clone(inode));
        }

        let disk = self.cache.map(sector, 0, |disk_inode: &DiskInode| *disk_inode)?;
        if !disk.is_valid() {
            log::warn!("inode {sector} has a bad magic number");
            return Err(Error::Corrupted(sector));
        }

        let inode = Arc::new(Inode {
            sector,
            cache: Arc::clone(&self.cache),
            allocator: Arc::clone(&self.allocator),
            inner: Mutex::new(InodeInner {
                open_count: 1,
                deny_write_count: 0,
                removed: false,
                disk,
            }),
        });
        open.insert(sector, Arc::clone(&inode));

        log::debug!("inode {sector} opened");
        Ok(inode)
    }

    pub fn reopen(&self, inode: &Arc<Inode>) -> Arc<Inode> {
        let _open = self.open.lock();
        inode.inner.lock().open_count += 1;
        Arc::clone(inode)
    }

    /// 关闭一次；最后一次关闭时离开登记表，已删除的归还全部扇区
    ///
    /// 收集扇区失败时返回错误，索引节点以打开计数 0 留在登记表里，
    /// 再次打开并关闭即重试归还。
    ///
    /// 最后一次关闭之后，其余的 `Arc` 副本不能再读写，否则 panic。
    pub fn close(&self, inode: Arc<Inode>) -> Result<()> {
        // 释放期间一直持有登记表，同一扇区不会在此时被重新打开
        let mut open = self.open.lock();
        let mut inner = inode.inner.lock();

        assert!(inner.open_count > 0, "inode {} closed too many times", inode.sector);
        inner.open_count -= 1;
        if inner.open_count > 0 {
            return Ok(());
        }

        if !inner.removed {
            open.remove(&inode.sector);
            log::debug!("inode {} closed", inode.sector);
            return Ok(());
        }

        let blocks = inner.disk.blocks(&self.cache).inspect_err(|err| {
            log::warn!("inode {} kept open, releasing failed: {err}", inode.sector);
        })?;
        open.remove(&inode.sector);
        for &block in &blocks {
            self.allocator.release(block, 1);
        }
        self.allocator.release(inode.sector, 1);

        log::debug!(
            "inode {} deleted, {} sectors released",
            inode.sector,
            blocks.len() + 1
        );
        Ok(())
    }

    pub fn is_open(&self, sector: SectorId) -> bool {
        self.open.lock().contains_key(&sector)
    }

    /// 当前打开的索引节点个数
    pub fn open_inodes(&self) -> usize {
        self.open.lock().len()
    }
}

impl Inode {
    /// 标记为删除，最后一次关闭时生效
    pub fn remove(&self) {
        self.inner.lock().removed = true;
    }

    /// 从 `offset` 处读取，在文件末尾截断；之后请求预读紧随其后的扇区
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let inner = self.lock_open();
        let read_size = inner.disk.read_at(offset, buf, &self.cache)?;

        if read_size > 0 {
            let next = (offset + read_size - 1) / SECTOR_SIZE + 1;
            if let Some(sector) = inner.disk.block_id(next, &self.cache)? {
                self.cache.read_ahead(sector);
            }
        }

        Ok(read_size)
    }

    /// 在 `offset` 处写入，必要时先扩展文件；拒绝写入期间返回 0
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize> {
        let mut inner = self.lock_open();
        if inner.deny_write_count > 0 || buf.is_empty() {
            return Ok(0);
        }

        let end = offset
            .checked_add(buf.len())
            .filter(|&end| end <= MAX_FILE_SIZE)
            .ok_or(Error::FileTooLarge)?;
        if end > inner.disk.length() as usize {
            inner
                .disk
                .expand_to(self.sector, end as u32, &self.cache, self.allocator.as_ref())?;
        }

        inner.disk.write_at(offset, buf, &self.cache)
    }

    fn lock_open(&self) -> MutexGuard<'_, InodeInner> {
        let inner = self.inner.lock();
        assert!(inner.open_count > 0, "inode {} used after its last close", self.sector);
        inner
    }

    pub fn deny_write(&self) {
        let mut inner = self.inner.lock();
        inner.deny_write_count += 1;
        assert!(
            inner.deny_write_count <= inner.open_count,
            "inode {} denied more often than opened",
            self.sector
        );
    }

    pub fn allow_write(&self) {
        let mut inner = self.inner.lock();
        assert!(
            inner.deny_write_count > 0,
            "inode {} allowed without a matching deny",
            self.sector
        );
        inner.deny_write_count -= 1;
    }

    #[inline]
    pub fn sector(&self) -> SectorId {
        self.sector
    }

    pub fn length(&self) -> usize {
        self.inner.lock().disk.length() as usize
    }

    pub fn is_dir(&self) -> bool {
        self.inner.lock().disk.is_dir()
    }

    pub fn parent(&self) -> SectorId {
        self.inner.lock().disk.parent()
    }

    pub fn is_removed(&self) -> bool {
        self.inner.lock().removed
    }

    pub fn open_count(&self) -> usize {
        self.inner.lock().open_count
    }

    pub fn stat(&self) -> Stat {
        let inner = self.inner.lock();
        Stat {
            sector: self.sector,
            kind: inner.disk.kind().into(),
            size: inner.disk.length() as usize,
            sectors: DiskInode::count_total_block(inner.disk.length()),
        }
    }
}

impl fmt::Debug for InodeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InodeTable")
            .field("open", &self.open_inodes())
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Inode")
            .field("sector", &self.sector)
            .field("length", &inner.disk.length())
            .field("open_count", &inner.open_count)
            .field("deny_write_count", &inner.deny_write_count)
            .field("removed", &inner.removed)
            .finish_non_exhaustive()
    }
}
