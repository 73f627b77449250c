use crate::block_cache::OnDisk;
use crate::{MAGIC, SectorId};

/// 超级块：
/// - 提供文件系统合法性校验；
/// - 定位空闲位图与根目录
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct SuperBlock {
    /// 魔数：用于校验文件系统合法性
    magic: u32,
    /// 文件系统占据扇区数
    pub total_sectors: u32,
    pub free_map_start: u32,
    pub free_map_sectors: u32,
    pub root: u32,
}

unsafe impl OnDisk for SuperBlock {}

impl SuperBlock {
    #[inline]
    pub fn init(
        &mut self,
        total_sectors: u32,
        free_map_start: SectorId,
        free_map_sectors: u32,
        root: SectorId,
    ) {
        *self = Self {
            magic: MAGIC,
            total_sectors,
            free_map_start: free_map_start.into(),
            free_map_sectors,
            root: root.into(),
        };
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.magic == MAGIC
    }
}
