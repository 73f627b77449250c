//! 盘上索引节点
//!
//! 一个索引节点恰好占据一个扇区，通过三级索引指向文件的数据扇区：
//! - 直接索引：记录内的 [`DIRECT_COUNT`] 个扇区编号，每个都指向一个**数据块**
//! - 一级索引：整个块连续存储扇区编号，每个编号都指向一个数据块
//! - 二级索引：整个块连续存储扇区编号，每个编号都指向一个一级索引块
//!
//! 编号为 0 表示尚未分配。只有文件长度覆盖的编号才有意义，
//! 长度之外残留的编号在扩展时直接覆盖。
//!
//! ## 块索引编码
//!
//! 减去前面各级的容量后，二级索引内的相对索引除以 [`INDIRECT_COUNT`]
//! 可得一级索引块的位置，取模可得块内位置。

use std::mem;
use std::ops::Range;

use crate::block_cache::{BufferCache, OnDisk};
use crate::layout::Allocator;
use crate::{Error, INODE_MAGIC, Result, SECTOR_SIZE, SectorId};

/// 间接索引块的编号容量
pub const INDIRECT_COUNT: usize = SECTOR_SIZE / 4;
/// 间接索引块
pub type IndexBlock = [u32; INDIRECT_COUNT];

unsafe impl OnDisk for IndexBlock {}

/// 直接索引块可编号数量，恰好把记录填满一个扇区
pub const DIRECT_COUNT: usize = 122;
/// 二级索引块可编号数量
const DOUBLE_INDIRECT_COUNT: usize = INDIRECT_COUNT.pow(2);
/// 直接索引时的编号容量
const DIRECT_CAP: usize = DIRECT_COUNT;
/// 用上一级索引时的编号容量
const INDIRECT_CAP: usize = DIRECT_CAP + INDIRECT_COUNT;
/// 用上二级索引时的编号容量
const DOUBLE_INDIRECT_CAP: usize = INDIRECT_CAP + DOUBLE_INDIRECT_COUNT;
/// 文件的最大字节数
pub const MAX_FILE_SIZE: usize = DOUBLE_INDIRECT_CAP * SECTOR_SIZE;

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct DiskInode {
    /// 逻辑长度（字节），不用usize是为了严控布局
    length: u32,
    /// 魔数：用于检测损坏的记录
    magic: u32,
    /// 0 为文件，1 为目录
    is_directory: u8,
    _pad: [u8; 3],
    /// 父目录索引节点所在扇区
    parent: u32,
    /// 直接索引块，存储容量：DIRECT_CAP * SECTOR_SIZE 字节
    direct: [u32; DIRECT_COUNT],
    /// 指向一个一级索引块
    indirect: u32,
    /// 指向一个二级索引块
    double_indirect: u32,
}

unsafe impl OnDisk for DiskInode {}

const _: () = assert!(mem::size_of::<DiskInode>() == SECTOR_SIZE);

#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub enum InodeKind {
    #[default]
    File,
    Directory,
}

/// 逻辑块在索引树上的位置
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum BlockPos {
    Direct(usize),
    Indirect(usize),
    /// (一级索引块在二级索引块中的位置, 块内位置)
    DoubleIndirect(usize, usize),
}

impl BlockPos {
    pub(crate) fn locate(block_index: usize) -> Option<Self> {
        if block_index < DIRECT_CAP {
            Some(Self::Direct(block_index))
        } else if block_index < INDIRECT_CAP {
            // 剔去直接索引的部分
            Some(Self::Indirect(block_index - DIRECT_CAP))
        } else if block_index < DOUBLE_INDIRECT_CAP {
            // 剔去使用了一级索引的部分
            let index = block_index - INDIRECT_CAP;
            Some(Self::DoubleIndirect(
                index / INDIRECT_COUNT,
                index % INDIRECT_COUNT,
            ))
        } else {
            None
        }
    }
}


impl DiskInode {
    pub fn new(parent: SectorId, kind: InodeKind) -> Self {
        Self {
            length: 0,
            magic: INODE_MAGIC,
            is_directory: (kind == InodeKind::Directory) as u8,
            _pad: [0; 3],
            parent: parent.into(),
            direct: [0; DIRECT_COUNT],
            indirect: 0,
            double_indirect: 0,
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.magic == INODE_MAGIC
    }

    #[inline]
    pub fn length(&self) -> u32 {
        self.length
    }

    #[inline]
    pub fn kind(&self) -> InodeKind {
        if self.is_directory != 0 {
            InodeKind::Directory
        } else {
            InodeKind::File
        }
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        self.kind() == InodeKind::Directory
    }

    #[inline]
    pub fn parent(&self) -> SectorId {
        SectorId::from(self.parent)
    }

    /// 逻辑上 inode 指向一系列数据块，此处传入的是这些数据块的索引（逻辑索引），
    /// 然后返回给**块缓存层**使用的扇区；超出文件长度时返回空
    pub fn block_id(&self, block_index: usize, cache: &BufferCache) -> Result<Option<SectorId>> {
        if block_index >= Self::count_data_block(self.length) {
            return Ok(None);
        }

        let raw = match BlockPos::locate(block_index) {
            None => 0,
            Some(BlockPos::Direct(index)) => self.direct[index],
            Some(BlockPos::Indirect(index)) => match SectorId::decode(self.indirect) {
                Some(indirect) => cache.map(indirect, 0, |block: &IndexBlock| block[index])?,
                None => 0,
            },
            Some(BlockPos::DoubleIndirect(outer, inner)) => {
                let Some(double) = SectorId::decode(self.double_indirect) else {
                    return Ok(None);
                };
                let child = cache.map(double, 0, |block: &IndexBlock| block[outer])?;
                match SectorId::decode(child) {
                    Some(child) => cache.map(child, 0, |block: &IndexBlock| block[inner])?,
                    None => 0,
                }
            }
        };

        Ok(SectorId::decode(raw))
    }

    /// 字节偏移所在的扇区；在文件长度之外时返回空
    #[inline]
    pub fn byte_to_sector(&self, offset: usize, cache: &BufferCache) -> Result<Option<SectorId>> {
        if offset >= self.length as usize {
            return Ok(None);
        }
        self.block_id(offset / SECTOR_SIZE, cache)
    }

    /// 把长度扩展到 `new_length`，并把新的记录写入它所在的扇区 `home`
    ///
    /// 按直接、一级、二级的顺序为新增的逻辑块分配并清零扇区。
    /// 任何一步失败都归还本次分配的全部扇区，内存与盘上的记录都保持原样。
    pub fn expand_to(
        &mut self,
        home: SectorId,
        new_length: u32,
        cache: &BufferCache,
        allocator: &dyn Allocator,
    ) -> Result<()> {
        if new_length as usize > MAX_FILE_SIZE {
            return Err(Error::FileTooLarge);
        }
        if new_length <= self.length {
            return Ok(());
        }

        let mut staged = *self;
        staged.length = new_length;
        let mut fresh = Fresh {
            cache,
            allocator,
            sectors: Vec::new(),
        };

        // 改写的索引块只多出长度以外的编号，记录未提交前它们没有意义
        let committed = staged
            .grow(
                Self::count_data_block(self.length),
                Self::count_data_block(new_length),
                &mut fresh,
            )
            .and_then(|index_blocks| {
                for (sector, block) in index_blocks {
                    cache.map_mut(sector, 0, |dest: &mut IndexBlock| *dest = block)?;
                }
                cache.map_mut(home, 0, |dest: &mut DiskInode| *dest = staged)
            });
        if let Err(err) = committed {
            fresh.rollback();
            return Err(err);
        }

        log::debug!(
            "inode {home} expanded {} -> {new_length} bytes, {} new sectors",
            self.length,
            fresh.sectors.len()
        );
        *self = staged;
        Ok(())
    }

    /// 记录所拥有的全部扇区：长度覆盖的数据块与索引块
    pub fn blocks(&self, cache: &BufferCache) -> Result<Vec<SectorId>> {
        let data_blocks = Self::count_data_block(self.length);
        let mut blocks = Vec::with_capacity(Self::count_total_block(self.length));

        let direct = span(0, data_blocks, 0, DIRECT_CAP);
        blocks.extend(entries(&self.direct[direct]));

        let indirect = span(0, data_blocks, DIRECT_CAP, INDIRECT_CAP);
        if let Some(sector) = SectorId::decode(self.indirect).filter(|_| !indirect.is_empty()) {
            blocks.push(sector);
            blocks.extend(cache.map(sector, 0, |block: &IndexBlock| entries(&block[indirect]))?);
        }

        let double = span(0, data_blocks, INDIRECT_CAP, DOUBLE_INDIRECT_CAP);
        if let Some(outer) = SectorId::decode(self.double_indirect).filter(|_| !double.is_empty()) {
            blocks.push(outer);
            let children = double.end.div_ceil(INDIRECT_COUNT);
            let children = cache.map(outer, 0, |block: &IndexBlock| block[..children].to_vec())?;
            for (i, child) in children.into_iter().enumerate() {
                let Some(child) = SectorId::decode(child) else {
                    continue;
                };
                let used = span(0, double.end, i * INDIRECT_COUNT, (i + 1) * INDIRECT_COUNT);
                blocks.push(child);
                blocks.extend(cache.map(child, 0, |block: &IndexBlock| entries(&block[used]))?);
            }
        }

        Ok(blocks)
    }

    /// 从指定位置(字节偏移)读出数据填充`buf`，返回读出的字节数
    pub fn read_at(&self, offset: usize, buf: &mut [u8], cache: &BufferCache) -> Result<usize> {
        let mut start = offset;
        let end = offset.saturating_add(buf.len()).min(self.length as usize);
        if start >= end {
            return Ok(0);
        }

        // 已读取多少字节
        let mut read_size = 0;
        while start < end {
            let block_index = start / SECTOR_SIZE;
            // 当前块的末地址(字节)
            let block_end = ((block_index + 1) * SECTOR_SIZE).min(end);
            let dest = &mut buf[read_size..read_size + block_end - start];

            match self.block_id(block_index, cache)? {
                // 绝对地址 % 块大小 = 块内偏移
                Some(sector) => cache.read(sector, dest, start % SECTOR_SIZE)?,
                None => dest.fill(0),
            }

            read_size += dest.len();
            start = block_end;
        }

        Ok(read_size)
    }

    /// 写入已经分配好的范围，超出长度的部分被截断
    pub fn write_at(&self, offset: usize, buf: &[u8], cache: &BufferCache) -> Result<usize> {
        let mut start = offset;
        let end = offset.saturating_add(buf.len()).min(self.length as usize);
        if start >= end {
            return Ok(0);
        }

        let mut written_size = 0;
        while start < end {
            let block_index = start / SECTOR_SIZE;
            let block_end = ((block_index + 1) * SECTOR_SIZE).min(end);
            let src = &buf[written_size..written_size + block_end - start];

            let sector = self
                .block_id(block_index, cache)?
                .expect("every block below the length is allocated");
            cache.write(sector, src, start % SECTOR_SIZE)?;

            written_size += src.len();
            start = block_end;
        }

        Ok(written_size)
    }

    /// 计算容纳指定数据量需要多少个**数据块**
    #[inline]
    pub fn count_data_block(size: u32) -> usize {
        (size as usize).div_ceil(SECTOR_SIZE)
    }

    /// 计算容纳指定数据量需要多少个 **数据块** 和 **索引块**(`IndexBlock`)
    pub fn count_total_block(size: u32) -> usize {
        let data_blocks = Self::count_data_block(size);
        let mut total = data_blocks;

        // 超出直接索引，使用一级索引块
        if data_blocks > DIRECT_CAP {
            total += 1;
        }

        // 超出一级索引，使用二级索引块及其下的一级索引块
        if data_blocks > INDIRECT_CAP {
            total += 1 + (data_blocks - INDIRECT_CAP).div_ceil(INDIRECT_COUNT);
        }

        total
    }
}

impl DiskInode {
    /// 为逻辑块 `from..to` 分配扇区，返回需要写回的索引块副本
    fn grow(
        &mut self,
        from: usize,
        to: usize,
        fresh: &mut Fresh<'_>,
    ) -> Result<Vec<(SectorId, IndexBlock)>> {
        let mut index_blocks = Vec::new();

        /******************** 直接索引 ********************/
        fresh.fill(&mut self.direct[span(from, to, 0, DIRECT_CAP)])?;

        /******************** 一级索引 ********************/
        let indirect = span(from, to, DIRECT_CAP, INDIRECT_CAP);
        if !indirect.is_empty() {
            let (sector, mut block) = fresh.index_block(&mut self.indirect, indirect.start > 0)?;
            fresh.fill(&mut block[indirect])?;
            index_blocks.push((sector, block));
        }

        /******************** 二级索引 ********************/
        let double = span(from, to, INDIRECT_CAP, DOUBLE_INDIRECT_CAP);
        if !double.is_empty() {
            let (outer_sector, mut outer) =
                fresh.index_block(&mut self.double_indirect, double.start > 0)?;
            for i in double.start / INDIRECT_COUNT..double.end.div_ceil(INDIRECT_COUNT) {
                let used = span(
                    double.start,
                    double.end,
                    i * INDIRECT_COUNT,
                    (i + 1) * INDIRECT_COUNT,
                );
                let (sector, mut block) = fresh.index_block(&mut outer[i], used.start > 0)?;
                fresh.fill(&mut block[used])?;
                index_blocks.push((sector, block));
            }
            index_blocks.push((outer_sector, outer));
        }

        Ok(index_blocks)
    }
}

/// 一次扩展中新分配的扇区，失败时整批归还
struct Fresh<'a> {
    cache: &'a BufferCache,
    allocator: &'a dyn Allocator,
    sectors: Vec<SectorId>,
}

impl Fresh<'_> {
    fn zeroed(&mut self) -> Result<SectorId> {
        let sector = self.allocator.allocate(1).ok_or(Error::NoSpace)?;
        self.sectors.push(sector);
        self.cache.zero(sector)?;
        Ok(sector)
    }

    /// 为每个指针分配一个新扇区
    fn fill(&mut self, pointers: &mut [u32]) -> Result<()> {
        for pointer in pointers {
            *pointer = self.zeroed()?.into();
        }
        Ok(())
    }

    /// 取出已有索引块的副本，或者新建一个全零的
    fn index_block(&mut self, pointer: &mut u32, existing: bool) -> Result<(SectorId, IndexBlock)> {
        match SectorId::decode(*pointer).filter(|_| existing) {
            Some(sector) => {
                let block = self.cache.map(sector, 0, |block: &IndexBlock| *block)?;
                Ok((sector, block))
            }
            None => {
                let sector = self.zeroed()?;
                *pointer = sector.into();
                Ok((sector, [0; INDIRECT_COUNT]))
            }
        }
    }

    fn rollback(self) {
        log::warn!(
            "inode extension failed, releasing {} fresh sectors",
            self.sectors.len()
        );
        for sector in self.sectors {
            self.allocator.release(sector, 1);
        }
    }
}

/// 逻辑块范围 `from..to` 落在某一级 `lo..hi` 内的部分，以该级起点为 0
fn span(from: usize, to: usize, lo: usize, hi: usize) -> Range<usize> {
    from.clamp(lo, hi) - lo..to.clamp(lo, hi) - lo
}

fn entries(pointers: &[u32]) -> Vec<SectorId> {
    pointers.iter().copied().filter_map(SectorId::decode).collect()
}
