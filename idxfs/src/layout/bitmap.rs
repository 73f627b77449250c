//! 空闲扇区位图
//!
//! 每一位对应一个扇区，置位表示已分配。位图常驻内存，
//! 挂载时从保留扇区读入，关闭时经块缓存写回。

use spin::Mutex;

use crate::block_cache::{BufferCache, OnDisk};
use crate::{Result, SECTOR_BITS, SectorId};

/// 位图区域内扇区的结构
type BitmapBlock = [u64; SECTOR_BITS / 64];

unsafe impl OnDisk for BitmapBlock {}

const GROUPS_PER_SECTOR: usize = SECTOR_BITS / 64;

/// 扇区分配器
///
/// 索引节点层只通过它申请与归还扇区，自身负责同步。
pub trait Allocator: Send + Sync {
    /// 分配 `count` 个连续扇区，返回首个扇区；空间用尽时返回空
    fn allocate(&self, count: usize) -> Option<SectorId>;
    fn release(&self, sector: SectorId, count: usize);
}

#[derive(Debug)]
pub struct FreeMap {
    /// 位图在盘上的起始扇区
    start: SectorId,
    /// 位图所管理的扇区总数
    total: usize,
    bits: Mutex<Vec<u64>>,
}

impl FreeMap {
    /// 全空的位图，尾部不存在的扇区预先置位
    pub fn new(start: SectorId, total: usize) -> Self {
        let groups = Self::sectors_for(total) * GROUPS_PER_SECTOR;
        let mut bits = vec![0u64; groups];
        for bit in total..groups * 64 {
            bits[bit / 64] |= 1u64 << (bit % 64);
        }

        Self {
            start,
            total,
            bits: Mutex::new(bits),
        }
    }

    /// 管理 `total` 个扇区需要多少个位图扇区
    #[inline]
    pub fn sectors_for(total: usize) -> usize {
        total.div_ceil(SECTOR_BITS)
    }

    pub fn load(cache: &BufferCache, start: SectorId, total: usize) -> Result<Self> {
        let map = Self::new(start, total);
        {
            let mut bits = map.bits.lock();
            for (i, group) in bits.chunks_mut(GROUPS_PER_SECTOR).enumerate() {
                cache.map(start + i as u32, 0, |block: &BitmapBlock| {
                    group.copy_from_slice(block)
                })?;
            }
        }
        log::debug!("free map loaded: {} of {total} sectors free", map.free_count());
        Ok(map)
    }

    pub fn store(&self, cache: &BufferCache) -> Result<()> {
        let bits = self.bits.lock().clone();
        for (i, group) in bits.chunks(GROUPS_PER_SECTOR).enumerate() {
            cache.map_mut(self.start + i as u32, 0, |block: &mut BitmapBlock| {
                block.copy_from_slice(group)
            })?;
        }
        Ok(())
    }

    /// 把扇区标记为已占用，用于超级块等固定位置
    pub fn reserve(&self, sector: SectorId, count: usize) {
        let mut bits = self.bits.lock();
        for bit in sector.block()..sector.block() + count {
            assert!(!test(&bits, bit), "sector #{bit} reserved twice");
            bits[bit / 64] |= 1u64 << (bit % 64);
        }
    }

    #[inline]
    pub fn start(&self) -> SectorId {
        self.start
    }

    #[inline]
    pub fn total(&self) -> usize {
        self.total
    }

    #[inline]
    pub fn sectors(&self) -> usize {
        Self::sectors_for(self.total)
    }

    pub fn free_count(&self) -> usize {
        let bits = self.bits.lock();
        (0..self.total).filter(|&bit| !test(&bits, bit)).count()
    }
}

impl Allocator for FreeMap {
    fn allocate(&self, count: usize) -> Option<SectorId> {
        assert!(count > 0);
        let mut bits = self.bits.lock();
        let first = find_run(&bits, self.total, count)?;
        for bit in first..first + count {
            bits[bit / 64] |= 1u64 << (bit % 64);
        }
        Some(SectorId::from(first as u32))
    }

    fn release(&self, sector: SectorId, count: usize) {
        let mut bits = self.bits.lock();
        for bit in sector.block()..sector.block() + count {
            // 编号一定得有对应的位
            assert!(test(&bits, bit), "releasing free sector #{bit}");
            bits[bit / 64] &= !(1u64 << (bit % 64));
        }
    }
}

#[inline]
fn test(bits: &[u64], bit: usize) -> bool {
    bits[bit / 64] & (1u64 << (bit % 64)) != 0
}

/// 首次适配：找出 `count` 个连续的空闲位
fn find_run(bits: &[u64], total: usize, count: usize) -> Option<usize> {
    if count == 1 {
        // 找到还有 0 的位组，组内第一个 0 即是
        return bits
            .iter()
            .enumerate()
            .find_map(|(group, &word)| {
                (word != u64::MAX).then(|| group * 64 + word.trailing_ones() as usize)
            })
            .filter(|&bit| bit < total);
    }

    let mut run = 0;
    for bit in 0..total {
        if test(bits, bit) {
            run = 0;
        } else {
            run += 1;
            if run == count {
                return Some(bit + 1 - count);
            }
        }
    }
    None
}
