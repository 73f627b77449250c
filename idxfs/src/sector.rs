//! 扇区编号

use core::fmt;
use core::ops::Add;

use derive_more::{From, Into};

/// 设备上的扇区编号
///
/// 0 号扇区永远是超级块，所以盘上的指针用 0 表示“尚未分配”；
/// 内存里则统一用 `Option<SectorId>` 表达。与盘上的 `u32` 之间用 `From`/`Into` 互转。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into)]
#[repr(transparent)]
pub struct SectorId(u32);

impl SectorId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// 给块设备使用的块ID
    #[inline]
    pub const fn block(self) -> usize {
        self.0 as usize
    }

    /// 解码盘上的指针
    #[inline]
    pub fn decode(raw: u32) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }
}

impl Add<u32> for SectorId {
    type Output = Self;

    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl fmt::Display for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
