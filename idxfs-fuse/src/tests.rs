use std::path::PathBuf;
use std::sync::Arc;
use std::{env, fs, process};

use idxfs::{Config, FileSystem, InodeKind};

use super::*;

/// 每个测试独占的镜像路径，结束时删除
struct Image(PathBuf);

impl Image {
    fn new(name: &str) -> Self {
        Self(env::temp_dir().join(format!("idxfs-{name}-{}.img", process::id())))
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.0);
    }
}

#[test]
fn block_round_trip() {
    let image = Image::new("round-trip");
    let file = BlockFile::create(&image.0, 8 * BLOCK_SIZE as u64).unwrap();
    assert_eq!(file.sectors().unwrap(), 8);

    let block = [0x5a; BLOCK_SIZE];
    file.write_block(3, &block);
    let mut buf = [0; BLOCK_SIZE];
    file.read_block(3, &mut buf);
    assert_eq!(buf, block);
    file.read_block(2, &mut buf);
    assert_eq!(buf, [0; BLOCK_SIZE]);
}

#[test]
fn volume_survives_reopen() {
    let image = Image::new("volume");
    let sectors = 1024;

    let device = Arc::new(BlockFile::create(&image.0, (sectors * BLOCK_SIZE) as u64).unwrap());
    let fs = FileSystem::format(device, sectors, Config::default()).unwrap();
    let sector = fs.create(0, InodeKind::File).unwrap();
    let inode = fs.inodes().open(sector).unwrap();
    inode.write_at(0, b"written through a host file").unwrap();
    fs.inodes().close(inode).unwrap();
    drop(fs);

    let device = Arc::new(BlockFile::open(&image.0).unwrap());
    let fs = FileSystem::mount(device, Config::default()).unwrap();
    let inode = fs.inodes().open(sector).unwrap();
    let mut buf = vec![0; inode.length()];
    inode.read_at(0, &mut buf).unwrap();
    assert_eq!(buf, b"written through a host file");
    fs.inodes().close(inode).unwrap();
}
