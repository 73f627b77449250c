use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(about = "Build and inspect idxfs images")]
pub struct Cli {
    /// Image file
    #[arg(long, short, global = true, default_value = "fs.img")]
    pub image: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create an empty volume, overwriting the image
    Format {
        /// Image size in MiB
        #[arg(long, default_value_t = 8)]
        size_mib: u64,
    },
    /// Copy host files into the volume, one inode each
    Pack {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Print the contents of an inode
    Cat {
        #[arg(long, short)]
        sector: u32,
    },
    /// Show the metadata of an inode
    Stat {
        #[arg(long, short)]
        sector: u32,
    },
    /// Delete an inode and release its sectors
    Rm {
        #[arg(long, short)]
        sector: u32,
    },
}
