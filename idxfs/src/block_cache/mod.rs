//! # 块缓存层
//!
//! 块设备读写速度远慢于内存，因此在内存中开辟固定数量的槽位，
//! 把即将操作的扇区复制进来；所有对扇区的访问都经过这里，且**一定发生在槽位当中**。
//!
//! - 每个槽位各有一把锁，不同扇区上的操作互不阻塞；
//! - 一把全局的决策锁保护“扇区 -> 槽位”的判定，保证同一扇区最多只占一个槽位；
//! - 槽位满时按时钟算法（second chance）淘汰，脏槽位先同步写回；
//! - 写回守护线程周期性写回全部脏槽位，预读线程异步预热扇区，见 [`Daemons`]。

mod daemon;

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, PoisonError};
use std::thread;

use block_dev::BlockDevice;
use spin::{Mutex, MutexGuard};

pub use self::daemon::Daemons;
use crate::{DataBlock, Error, MAX_EVICT_SWEEPS, READ_AHEAD_DEPTH, Result, SECTOR_SIZE, SectorId};

/// 可以直接映射到槽位内存上的盘上结构
///
/// # Safety
///
/// 实现者必须是 `repr(C)` 或数组这样布局确定的类型，
/// 任意位模式都是合法值，且不含指针与引用。
pub unsafe trait OnDisk: Sized {}

unsafe impl OnDisk for DataBlock {}

/// 按 8 字节对齐的扇区数据，保证盘上结构可以原地映射
#[repr(C, align(8))]
struct SectorBuf(DataBlock);

/// 缓存槽位
struct Slot {
    /// 槽位所存的扇区，`None` 表示槽位无效
    sector: Option<SectorId>,
    data: SectorBuf,
    /// 数据与磁盘上不一致
    dirty: bool,
    /// 上次时钟扫过之后被访问过
    accessed: bool,
}

/// 全局决策锁保护的状态
struct Directory {
    /// 时钟指针
    hand: usize,
    /// 有效槽位的索引：扇区 -> 槽位下标
    index: BTreeMap<SectorId, usize>,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    write_backs: AtomicU64,
    prefetches: AtomicU64,
}

/// 缓存统计的快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// 写回设备的扇区数，包括淘汰时的写回
    pub write_backs: u64,
    pub prefetches: u64,
}

struct ReadAheadQueue {
    pending: VecDeque<SectorId>,
    /// 有预读线程在消费队列
    accepting: bool,
}

pub struct BufferCache {
    /// 底层块设备的引用
    device: Arc<dyn BlockDevice>,
    slots: Box<[Mutex<Slot>]>,
    directory: Mutex<Directory>,
    counters: Counters,
    read_ahead: std::sync::Mutex<ReadAheadQueue>,
    read_ahead_ready: Condvar,
}

impl BufferCache {
    pub fn new(device: Arc<dyn BlockDevice>, capacity: usize) -> Self {
        assert!(capacity > 0, "buffer cache needs at least one slot");

        Self {
            device,
            slots: (0..capacity).map(|_| Mutex::new(Slot::empty())).collect(),
            directory: Mutex::new(Directory {
                hand: 0,
                index: BTreeMap::new(),
            }),
            counters: Counters::default(),
            read_ahead: std::sync::Mutex::new(ReadAheadQueue {
                pending: VecDeque::with_capacity(READ_AHEAD_DEPTH),
                accepting: false,
            }),
            read_ahead_ready: Condvar::new(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// 从扇区 `sector` 的 `offset` 处读出 `buf.len()` 个字节
    pub fn read(&self, sector: SectorId, buf: &mut [u8], offset: usize) -> Result<()> {
        check_range(offset, buf.len());
        self.map(sector, 0, |data: &DataBlock| {
            buf.copy_from_slice(&data[offset..offset + buf.len()]);
        })
    }

    /// 把 `buf` 写入扇区 `sector` 的 `offset` 处
    pub fn write(&self, sector: SectorId, buf: &[u8], offset: usize) -> Result<()> {
        check_range(offset, buf.len());
        self.map_mut(sector, 0, |data: &mut DataBlock| {
            data[offset..offset + buf.len()].copy_from_slice(buf);
        })
    }

    pub fn zero(&self, sector: SectorId) -> Result<()> {
        self.map_mut(sector, 0, |data: &mut DataBlock| data.fill(0))
    }

    /// 以 `T` 的视角读取扇区内 `offset` 处的数据
    ///
    /// 闭包执行期间持有槽位锁，不可以在闭包里再访问缓存。
    pub fn map<T: OnDisk, V>(
        &self,
        sector: SectorId,
        offset: usize,
        f: impl FnOnce(&T) -> V,
    ) -> Result<V> {
        let mut slot = self.fetch(sector)?;
        slot.accessed = true;
        Ok(f(slot.get(offset)))
    }

    /// 以 `T` 的视角修改扇区内 `offset` 处的数据，槽位随之变脏
    pub fn map_mut<T: OnDisk, V>(
        &self,
        sector: SectorId,
        offset: usize,
        f: impl FnOnce(&mut T) -> V,
    ) -> Result<V> {
        let mut slot = self.fetch(sector)?;
        slot.accessed = true;
        Ok(f(slot.get_mut(offset)))
    }

    /// 把全部脏槽位写回设备，返回写回的扇区数
    pub fn write_back_all(&self) -> usize {
        let flushed = self
            .slots
            .iter()
            .filter(|slot| slot.lock().flush(&self.device))
            .count();
        self.counters
            .write_backs
            .fetch_add(flushed as u64, Ordering::Relaxed);
        flushed
    }

    /// 请求预读扇区，只是尽力而为：没有预读线程、队列已满或已在队列中时直接放弃
    pub fn read_ahead(&self, sector: SectorId) -> bool {
        let mut queue = self
            .read_ahead
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !queue.accepting
            || queue.pending.len() >= READ_AHEAD_DEPTH
            || queue.pending.contains(&sector)
        {
            return false;
        }
        queue.pending.push_back(sector);
        self.read_ahead_ready.notify_one();
        true
    }

    /// 当前各有效槽位所存的扇区
    pub fn resident(&self) -> Vec<SectorId> {
        self.slots
            .iter()
            .filter_map(|slot| slot.lock().sector)
            .collect()
    }

    pub fn stats(&self) -> CacheStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CacheStats {
            hits: load(&self.counters.hits),
            misses: load(&self.counters.misses),
            evictions: load(&self.counters.evictions),
            write_backs: load(&self.counters.write_backs),
            prefetches: load(&self.counters.prefetches),
        }
    }
}

impl BufferCache {
    /// 找到或调入扇区，返回已上锁的槽位
    ///
    /// 未命中时，从淘汰、登记到读盘的全过程都持有决策锁，
    /// 两个线程不可能各自为同一个扇区调入一个槽位。
    fn fetch(&self, sector: SectorId) -> Result<MutexGuard<'_, Slot>> {
        let mut directory = self.directory.lock();

        let hit = directory.index.get(&sector).copied();
        if let Some(index) = hit {
            let slot = self.slots[index].lock();
            drop(directory);
            debug_assert_eq!(slot.sector, Some(sector));
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(slot);
        }

        let (index, mut slot) = self.evict(&mut directory)?;
        if let Some(old) = slot.sector.take() {
            directory.index.remove(&old);
        }
        self.device.read_block(sector.block(), &mut slot.data.0);
        slot.sector = Some(sector);
        slot.accessed = false;
        directory.index.insert(sector, index);
        drop(directory);

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        log::trace!("cache miss: {sector} -> slot {index}");
        Ok(slot)
    }

    /// 时钟算法：跳过忙碌的槽位，直接占用无效槽位，
    /// 对访问过的槽位清除访问位再给一次机会，其余的即为牺牲者。
    ///
    /// 每轮扫描绕两圈，轮与轮之间让出处理器；
    /// 连续 [`MAX_EVICT_SWEEPS`] 轮都找不到牺牲者时报告缓存耗尽。
    fn evict(&self, directory: &mut Directory) -> Result<(usize, MutexGuard<'_, Slot>)> {
        let capacity = self.capacity();

        for _ in 0..MAX_EVICT_SWEEPS {
            for _ in 0..2 * capacity {
                let index = directory.hand;
                directory.hand = (index + 1) % capacity;

                let Some(mut slot) = self.slots[index].try_lock() else {
                    continue;
                };
                let sector = slot.sector;
                match sector {
                    None => return Ok((index, slot)),
                    Some(_) if slot.accessed => slot.accessed = false,
                    Some(victim) => {
                        if slot.flush(&self.device) {
                            self.counters.write_backs.fetch_add(1, Ordering::Relaxed);
                        }
                        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                        log::trace!("evict {victim} from slot {index}");
                        return Ok((index, slot));
                    }
                }
            }
            thread::yield_now();
        }

        log::error!("buffer cache exhausted: all {capacity} slots busy");
        Err(Error::CacheExhausted(MAX_EVICT_SWEEPS))
    }

    /// 预读：调入扇区但不复制数据，也不设置访问位
    fn prefetch(&self, sector: SectorId) -> Result<()> {
        drop(self.fetch(sector)?);
        self.counters.prefetches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn start_read_ahead(&self) {
        self.read_ahead
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .accepting = true;
    }

    fn stop_read_ahead(&self) {
        let mut queue = self
            .read_ahead
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        queue.accepting = false;
        queue.pending.clear();
        self.read_ahead_ready.notify_all();
    }

    /// 阻塞直到队列非空；预读停止后返回 `None`
    fn next_read_ahead(&self) -> Option<SectorId> {
        let mut queue = self
            .read_ahead
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if !queue.accepting {
                return None;
            }
            if let Some(sector) = queue.pending.pop_front() {
                return Some(sector);
            }
            queue = self
                .read_ahead_ready
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl fmt::Debug for BufferCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferCache")
            .field("capacity", &self.capacity())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Slot {
    const fn empty() -> Self {
        Self {
            sector: None,
            data: SectorBuf([0; SECTOR_SIZE]),
            dirty: false,
            accessed: false,
        }
    }

    fn get<T: OnDisk>(&self, offset: usize) -> &T {
        check_layout::<T>(offset);
        let addr = self.data.0[offset..].as_ptr().cast::<T>();
        // SAFETY: 范围与对齐已检查，`T: OnDisk` 接受任意位模式
        unsafe { &*addr }
    }

    fn get_mut<T: OnDisk>(&mut self, offset: usize) -> &mut T {
        check_layout::<T>(offset);
        self.dirty = true;
        let addr = self.data.0[offset..].as_mut_ptr().cast::<T>();
        // SAFETY: 同上，且持有槽位的独占引用
        unsafe { &mut *addr }
    }

    /// 脏槽位写回设备，返回是否发生了写回
    fn flush(&mut self, device: &Arc<dyn BlockDevice>) -> bool {
        match self.sector {
            Some(sector) if self.dirty => {
                device.write_block(sector.block(), &self.data.0);
                self.dirty = false;
                true
            }
            _ => false,
        }
    }
}

#[inline]
fn check_range(offset: usize, len: usize) {
    assert!(
        offset + len <= SECTOR_SIZE,
        "range {offset}..{} crosses the sector boundary",
        offset + len
    );
}

#[inline]
fn check_layout<T>(offset: usize) {
    assert!(mem::size_of::<T>() + offset <= SECTOR_SIZE);
    assert_eq!(offset % mem::align_of::<T>(), 0, "misaligned offset {offset}");
    debug_assert!(mem::align_of::<T>() <= mem::align_of::<SectorBuf>());
}
