use std::io;

use thiserror::Error;

use crate::SectorId;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no free sectors left on the device")]
    NoSpace,
    #[error("file would grow past the maximum file size")]
    FileTooLarge,
    #[error("no cache slot could be evicted after {0} sweeps")]
    CacheExhausted(usize),
    #[error("sector {0} does not hold a valid inode")]
    Corrupted(SectorId),
    #[error("device does not hold an idxfs volume")]
    BadSuperBlock,
    #[error("failed to spawn cache worker: {0}")]
    Io(#[from] io::Error),
}
