use std::io::Write;
use std::path::PathBuf;
use std::fs::{OpenOptions, File};

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};

mod bitmap;
mod filesys;
mod hash;
mod logger;
mod serial;

use filesys::verfs;
use filesys::verfs::file::{self, OpenIntent, O_WRONLY, O_VERSION, O_PARENT, O_VSEARCH};
use filesys::verfs::{checker, namei, readversion, snapshot};
use logger::Logger;

#[derive(Debug, Parser)]
#[clap(version, about = "file versioning with copy-on-write block sharing on a drive image")]
struct Args {
    /// Drive path
    #[clap(short, long, parse(from_os_str), value_name = "DRIVE")]
    drive: PathBuf,

    /// Set verbosity of the output (can be used multiple times)
    #[clap(short, long, parse(from_occurrences))]
    verbose: u32,

    /// Log file
    #[clap(short, long, parse(from_os_str), value_name = "FILE")]
    log_file: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build a fresh filesystem on the drive
    Mkfs {
        /// Total size in blocks
        #[clap(long, default_value_t = 4096)]
        blocks: u32,
        /// Number of inodes
        #[clap(long, default_value_t = 512)]
        inodes: u32,
    },
    /// Create an empty regular file
    Create { path: String },
    /// Create a directory
    Mkdir { path: String },
    /// Write data to a file
    Write {
        path: String,
        /// Bytes to write
        #[clap(long)]
        data: String,
        #[clap(long, default_value_t = 0)]
        offset: u64,
        /// Freeze the current contents first (O_VERSION)
        #[clap(long)]
        version: bool,
        /// Address the parent version (O_PARENT)
        #[clap(long)]
        parent: bool,
        /// Address this version inode (O_VSEARCH)
        #[clap(long, value_name = "INO")]
        vsearch: Option<u32>,
    },
    /// Read data from a file
    Read {
        path: String,
        #[clap(long, default_value_t = 0)]
        offset: u64,
        #[clap(long, default_value_t = 4096)]
        len: usize,
        /// Address the parent version (O_PARENT)
        #[clap(long)]
        parent: bool,
        /// Address this version inode (O_VSEARCH)
        #[clap(long, value_name = "INO")]
        vsearch: Option<u32>,
    },
    /// Freeze the current contents as an immutable version
    Snapshot { path: String },
    /// List a file's neighbors in its version tree
    Versions {
        path: String,
        /// Address this version inode instead of the named one
        #[clap(long, value_name = "INO")]
        vsearch: Option<u32>,
        #[clap(long)]
        json: bool,
    },
    /// Hard-link a file, or one specific version of it
    Link {
        path: String,
        newpath: String,
        /// Link this version inode (VLINK)
        #[clap(long, value_name = "INO")]
        vsearch: Option<u32>,
    },
    /// Remove a name
    Unlink { path: String },
    /// Detach a version from its tree (DELETE_VERSION)
    DeleteVersion {
        path: String,
        /// Address this version inode
        #[clap(long, value_name = "INO")]
        vsearch: Option<u32>,
    },
    /// Verify the version-tree invariants
    Check {
        #[clap(long)]
        json: bool,
    },
    /// Show an inode and its version record
    Stat {
        path: String,
        /// Address this version inode
        #[clap(long, value_name = "INO")]
        vsearch: Option<u32>,
    },
}

fn main()
{
    let args = Args::parse();

    let mut cfg = Config::default();
    cfg.drive_path = args.drive;
    cfg.verbosity = args.verbose;
    cfg.log_file_path = args.log_file;

    let mut log_file = None;

    // Create the log file in rw mode.

    if let Some(path) = &cfg.log_file_path {
        let f = OpenOptions::new()
            .create(true)
            .read(false)
            .append(true)
            .open(&path);

        log_file = match f {
            Ok(f) => Some(f),
            Err(e) => {
                eprintln!("error: {}: {}", &path.display(), e.to_string());
                cfg.log_file_path = None;
                None
            }
        };
    }

    let create_drive = matches!(args.command, Command::Mkfs { .. });

    // Open the drive in rw mode.

    let drive = OpenOptions::new()
        .create(create_drive)
        .read(true)
        .write(true)
        .open(&cfg.drive_path);

    let drive = match drive {
        Ok(f) => f,
        Err(e) => {
            eprintln!("error: {}: {}", &cfg.drive_path.display(), e.to_string());
            std::process::exit(1);
        }
    };

    let mut context = Context {
        drive,
        logger: Logger::new(cfg.verbosity, log_file),
    };

    if let Err(e) = run(args.command, &mut context, &cfg) {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}


fn run(command: Command, ctx: &mut Context, cfg: &Config) -> anyhow::Result<()>
{
    match command {
        Command::Mkfs { blocks, inodes } => {
            verfs::mkfs(ctx, blocks, inodes)?;
            println!("{}: {} blocks, {} inodes", cfg.drive_path.display(), blocks, inodes);

            Ok(())
        }
        command => {
            filesys::detect_fs(ctx).context("unrecognised drive contents")?;
            let mut fs = verfs::mount(ctx)?;

            let res = dispatch(command, &mut fs, ctx);
            verfs::unmount(fs, ctx)?;

            res
        }
    }
}


fn dispatch(command: Command, fs: &mut verfs::Fs, ctx: &mut Context) -> anyhow::Result<()>
{
    match command {
        Command::Mkfs { .. } => unreachable!(),

        Command::Create { path } => {
            let ino = namei::create(fs, ctx, &path)?;
            println!("{} inode {}", path, ino);
        }

        Command::Mkdir { path } => {
            namei::mkdir(fs, ctx, &path)?;
        }

        Command::Write { path, data, offset, version, parent, vsearch } => {
            let mut flags = O_WRONLY;
            if version { flags |= O_VERSION; }
            if parent { flags |= O_PARENT; }
            if vsearch.is_some() { flags |= O_VSEARCH; }

            let intent = OpenIntent::from_flags(flags, vsearch.unwrap_or(0));
            let fd = file::open_path(fs, ctx, &path, intent)?;
            let n = file::file_write(fs, ctx, fd, offset, data.as_bytes())?;
            file::close(fs, ctx, fd)?;
            println!("{} bytes written", n);
        }

        Command::Read { path, offset, len, parent, vsearch } => {
            let mut flags = 0;
            if parent { flags |= O_PARENT; }
            if vsearch.is_some() { flags |= O_VSEARCH; }

            let intent = OpenIntent::from_flags(flags, vsearch.unwrap_or(0));
            let fd = file::open_path(fs, ctx, &path, intent)?;
            let data = file::file_read(fs, ctx, fd, offset, len)?;
            file::close(fs, ctx, fd)?;
            std::io::stdout().write_all(&data)?;
        }

        Command::Snapshot { path } => {
            let (dir_ino, name) = namei::resolve_parent(fs, ctx, &path)?;
            let ino = namei::find_entry(fs, ctx, None, dir_ino, &name)?
                .ok_or(verfs::FsError::NotFound)?;
            let new_ino = snapshot::create_snapshot(dir_ino, ino, &name, fs, ctx)?;
            println!("version {} frozen as inode {}", ino, new_ino);
        }

        Command::Versions { path, vsearch, json } => {
            let ino = match vsearch {
                Some(vino) => vino,
                None => namei::resolve_path(fs, ctx, &path)?,
            };
            let entries = readversion::read_version_dir(fs, ctx, ino)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in entries {
                    let mut kind = if entry.d_type & readversion::DT_PARENT != 0 {
                        "parent"
                    } else {
                        "child"
                    }.to_string();
                    if entry.d_type & readversion::DT_VROOT != 0 {
                        kind.push_str(" (root)");
                    }
                    println!("{:>8}  {}", entry.d_ino, kind);
                }
            }
        }

        Command::Link { path, newpath, vsearch } => {
            namei::link(fs, ctx, &path, &newpath, vsearch)?;
        }

        Command::Unlink { path } => {
            namei::unlink(fs, ctx, &path)?;
        }

        Command::DeleteVersion { path, vsearch } => {
            let mut flags = 0;
            if vsearch.is_some() { flags |= O_VSEARCH; }

            let intent = OpenIntent::from_flags(flags, vsearch.unwrap_or(0));
            let fd = file::open_path(fs, ctx, &path, intent)?;
            let res = file::delete_version(fs, ctx, fd);
            file::close(fs, ctx, fd)?;
            res?;
        }

        Command::Check { json } => {
            let violations = checker::check(fs, ctx)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&violations)?);
            } else {
                for v in &violations {
                    println!("inode {:>6}: {}", v.ino, v.detail);
                }
            }
            if !violations.is_empty() {
                bail!("{} invariant violation(s)", violations.len());
            }
            ctx.logger.log(1, "clean");
        }

        Command::Stat { path, vsearch } => {
            let ino = match vsearch {
                Some(vino) => vino,
                None => namei::resolve_path(fs, ctx, &path)?,
            };
            let node = verfs::inode::read_inode(fs, ctx, ino)?;
            println!("inode {}", ino);
            println!("{:#?}", node);
        }
    }

    Ok(())
}


/// Contains configuration options.
#[derive(Debug)]
pub struct Config {
    pub drive_path: PathBuf,
    pub log_file_path: Option<PathBuf>,
    pub verbosity: u32,
}

impl Default for Config {
    fn default() -> Self
    {
        Self {
            drive_path: PathBuf::default(),
            log_file_path: None,
            verbosity: 0,
        }
    }
}

/// Contains shared mutable state.
#[derive(Debug)]
pub struct Context {
    pub drive: File,
    pub logger: Logger,
}
