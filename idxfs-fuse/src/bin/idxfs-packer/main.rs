mod cli;

use std::error::Error;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use cli::{Cli, Command};
use idxfs::{Config, FileSystem, InodeKind, SECTOR_SIZE, SectorId};
use idxfs_fuse::BlockFile;
use typed_bytesize::ByteSizeIec;

type Result<T = (), E = Box<dyn Error>> = std::result::Result<T, E>;

fn main() -> Result {
    env_logger::init();
    let cli = Cli::parse();

    // 一次性的命令不需要预读
    let config = Config {
        read_ahead: false,
        ..Config::default()
    };

    match cli.command {
        Command::Format { size_mib } => format(&cli.image, size_mib, config),
        command => {
            let block_file = Arc::new(BlockFile::open(&cli.image)?);
            let fs = FileSystem::mount(block_file, config)?;
            run(&fs, command)?;
            Ok(fs.shutdown()?)
        }
    }
}

fn format(image: &Path, size_mib: u64, config: Config) -> Result {
    let disk_size = ByteSizeIec::mib(size_mib).0;
    let block_file = Arc::new(BlockFile::create(image, disk_size)?);
    let sectors = disk_size as usize / SECTOR_SIZE;

    let fs = FileSystem::format(block_file, sectors, config)?;
    println!("image={image:?} sectors={sectors} root={}", fs.root_sector());
    Ok(fs.shutdown()?)
}

fn run(fs: &FileSystem, command: Command) -> Result {
    match command {
        Command::Format { .. } => {}
        Command::Pack { files } => {
            for path in files {
                let data = std::fs::read(&path)?;
                let sector = fs.create(0, InodeKind::File)?;
                let inode = fs.inodes().open(sector)?;
                let written = inode.write_at(0, &data);
                fs.inodes().close(inode)?;
                log::info!("packed {path:?}: {} bytes", written?);
                println!("{} -> {}", path.display(), u32::from(sector));
            }
        }
        Command::Cat { sector } => {
            let inode = fs.inodes().open(SectorId::from(sector))?;
            let mut data = vec![0; inode.length()];
            let read = inode.read_at(0, &mut data);
            fs.inodes().close(inode)?;
            io::stdout().write_all(&data[..read?])?;
        }
        Command::Stat { sector } => {
            let inode = fs.inodes().open(SectorId::from(sector))?;
            let stat = inode.stat();
            let kind = if inode.is_dir() { "directory" } else { "file" };
            fs.inodes().close(inode)?;
            println!(
                "sector={} kind={kind} mode={:o} size={} sectors={}",
                u32::from(stat.sector),
                stat.kind as u32,
                stat.size,
                stat.sectors
            );
        }
        Command::Rm { sector } => {
            let inode = fs.inodes().open(SectorId::from(sector))?;
            inode.remove();
            fs.inodes().close(inode)?;
            println!("removed {sector}, {} sectors free", fs.free_map().free_count());
        }
    }
    Ok(())
}
