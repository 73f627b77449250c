//! 内存盘：用一段堆内存模拟块设备，并统计读写次数。

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::{BLOCK_SIZE, BlockDevice};

#[derive(Debug)]
pub struct MemDisk {
    blocks: Mutex<Vec<[u8; BLOCK_SIZE]>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemDisk {
    pub fn new(block_count: usize) -> Self {
        Self {
            blocks: Mutex::new(vec![[0; BLOCK_SIZE]; block_count]),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.lock().len()
    }

    /// 绕过统计，直接查看设备上的块内容
    pub fn snapshot(&self, block_id: usize) -> [u8; BLOCK_SIZE] {
        self.blocks.lock()[block_id]
    }

    /// 绕过统计，直接改写设备上的块内容
    pub fn poke(&self, block_id: usize, data: &[u8; BLOCK_SIZE]) {
        self.blocks.lock()[block_id] = *data;
    }

    #[inline]
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }
}

impl BlockDevice for MemDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        let blocks = self.blocks.lock();
        assert!(block_id < blocks.len(), "block {block_id} out of range");
        buf.copy_from_slice(&blocks[block_id]);
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        let mut blocks = self.blocks.lock();
        assert!(block_id < blocks.len(), "block {block_id} out of range");
        blocks[block_id].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_back_written_block() {
        let disk = MemDisk::new(4);
        let data = [0xA5; BLOCK_SIZE];
        disk.write_block(2, &data);

        let mut buf = [0; BLOCK_SIZE];
        disk.read_block(2, &mut buf);
        assert_eq!(buf, data);
        assert_eq!(disk.snapshot(1), [0; BLOCK_SIZE]);
        assert_eq!((disk.reads(), disk.writes()), (1, 1));
    }

    #[test]
    #[should_panic]
    fn out_of_range() {
        let disk = MemDisk::new(1);
        disk.write_block(1, &[0; BLOCK_SIZE]);
    }
}
