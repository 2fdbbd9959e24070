use std::io::{Read, Seek, SeekFrom, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use bincode::{DefaultOptions, Options};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bitmap::Bitmap;
use crate::blocks_for;
use crate::serial::Array;
use crate::Context;

pub mod alloc;
pub mod buffer;
pub mod checker;
pub mod file;
pub mod inode;
pub mod journal;
#[macro_use]
pub mod macros;
pub mod namei;
pub mod orphan;
pub mod readversion;
pub mod sibling;
pub mod snapshot;
pub mod vtree;

use inode::{Inode, Icache, IMode};


pub const VERFS_MAGIC: u16 = 0x5653;
pub const SUPERBLOCK_OFFSET: u64 = 1024;
pub const BLOCK_SIZE: u64 = 1024;
pub const PAGE_SIZE: u64 = 4096;
/// Root directory inode.
pub const ROOT_INO: u32 = 2;
/// First inode available for allocation; lower numbers are reserved.
pub const FIRST_INO: u32 = 11;
/// On-disk inode slot size.
pub const INODE_SIZE: u64 = 256;
/// Journal area length, in blocks.
pub const JOURNAL_BLOCKS: u32 = 64;


pub(crate) type Result<T> = std::result::Result<T, FsError>;

/// Engine error kinds. Callers match on these; the CLI maps them to exit
/// diagnostics through `anyhow`.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("name is empty or too long")]
    BadName,
    #[error("no such file, directory or version")]
    NotFound,
    #[error("file or link already exists")]
    Exists,
    #[error("generation mismatch on a version link")]
    StaleGen,
    #[error("version link references a missing inode")]
    BrokenLink,
    #[error("no space left on the image")]
    NoSpace,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("journal aborted: {0}")]
    JournalAbort(String),
    #[error("operation not permitted: {0}")]
    NotPermitted(&'static str),
    #[error("filesystem is corrupt: {0}")]
    Corrupt(String),
}

impl From<bincode::Error> for FsError {
    fn from(e: bincode::Error) -> Self
    {
        FsError::Corrupt(format!("metadata encoding: {}", e))
    }
}


/// The verfs superblock.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SuperBlock {
    pub s_magic: u16,              // Magic signature
    pub s_state: u16,              // File system state
    pub s_inodes_count: u32,       // Inodes count
    pub s_blocks_count: u32,       // Blocks count
    pub s_free_inodes_count: u32,  // Free inodes count
    pub s_free_blocks_count: u32,  // Free blocks count
    pub s_first_data_block: u32,   // First data block
    pub s_log_block_size: u32,     // Block size
    pub s_first_ino: u32,          // First non-reserved inode
    pub s_inode_size: u16,         // Size of an inode slot
    pub s_block_bitmap: u32,       // Block bitmap block
    pub s_inode_bitmap: u32,       // Inode bitmap block
    pub s_inode_table: u32,        // First inode table block
    pub s_journal_start: u32,      // First journal block
    pub s_journal_blocks: u32,     // Journal length in blocks
    pub s_last_orphan: u32,        // Start of list of inodes to delete
    pub s_generation_seed: u32,    // Next inode generation number
    pub s_mkfs_time: u32,          // When the filesystem was created
    pub s_wtime: u32,              // Write time
    pub s_reserved: Array<u32, 32>, // Padding
    pub s_checksum: u32,           // crc32c(superblock)
}


/// State of the file system (s_state).
#[derive(Copy, Clone)]
pub struct State(pub u16);

impl State {
    pub fn has_valid(&self) -> bool { self.0 & 0x1 != 0 }
    pub fn has_error(&self) -> bool { self.0 & 0x2 != 0 }

    pub fn get_unknown(&self) -> u16
    {
        (self.0 >> 2) << 2
    }

    pub fn has_unknown(&self) -> bool
    {
        self.get_unknown() != 0
    }
}


/// A mounted filesystem.
/// Owns the superblock, the allocation bitmaps and every in-memory cache;
/// all engine operations take `&mut Fs` plus the I/O `Context`.
pub struct Fs {
    pub sb: SuperBlock,
    pub readonly: bool,
    pub block_map: Bitmap,
    pub inode_map: Bitmap,
    pub icache: Icache,
    pub pcache: buffer::PageCache,
    pub dcache: namei::DentryCache,
    pub files: file::OpenFiles,
    pub journal: journal::Journal,
    /// Next inode generation number handed out by the allocator.
    pub generation: u32,
}


/// Builds a fresh filesystem on the drive.
pub fn mkfs(ctx: &mut Context, blocks_count: u32, inodes_count: u32) -> Result<()>
{
    let itable_blocks = blocks_for!(inodes_count as u64 * INODE_SIZE) as u32;
    let journal_start = 4 + itable_blocks;
    let first_data_block = journal_start + JOURNAL_BLOCKS;

    if blocks_count as u64 > BLOCK_SIZE * 8 {
        return Err(FsError::NotPermitted("image needs more than one block bitmap block"));
    }
    if inodes_count as u64 > BLOCK_SIZE * 8 {
        return Err(FsError::NotPermitted("image needs more than one inode bitmap block"));
    }
    if inodes_count < FIRST_INO {
        return Err(FsError::NotPermitted("too few inodes"));
    }
    if blocks_count <= first_data_block + 16 {
        return Err(FsError::NoSpace);
    }

    ctx.logger.log(1, &format!(
        "mkfs: {} blocks, {} inodes, data starts at block {}",
        blocks_count, inodes_count, first_data_block,
    ));

    ctx.drive.set_len(blocks_count as u64 * BLOCK_SIZE)?;

    // Allocation bitmaps. Everything up to the first data block is metadata,
    // plus one data block for the root directory.

    let root_dir_block = first_data_block;
    let mut block_map = Bitmap::new(BLOCK_SIZE as usize);
    for b in 0..=root_dir_block {
        block_map.set_bit(b as usize);
    }

    let mut inode_map = Bitmap::new(BLOCK_SIZE as usize);
    for ino in 1..FIRST_INO {
        inode_map.set_bit(ino as usize - 1);
    }

    ctx.drive.seek(SeekFrom::Start(2 * BLOCK_SIZE))?;
    block_map.to_writer(&mut ctx.drive)?;
    ctx.drive.seek(SeekFrom::Start(3 * BLOCK_SIZE))?;
    inode_map.to_writer(&mut ctx.drive)?;

    // Zero the inode table and the journal area.

    let zero_block = vec![u8::default(); BLOCK_SIZE as usize];
    ctx.drive.seek(SeekFrom::Start(4 * BLOCK_SIZE))?;
    for _ in 0..itable_blocks + JOURNAL_BLOCKS {
        ctx.drive.write_all(&zero_block)?;
    }

    // Root directory: inode plus one directory block.

    let generation_seed: u32 = rand::random();
    let now = now_secs();

    let mut root = Inode::default();
    root.i_mode = IMode::IFDIR | 0o755;
    root.i_links_count = 2;
    root.i_size = BLOCK_SIZE as u32;
    root.i_atime = now;
    root.i_ctime = now;
    root.i_mtime = now;
    root.i_generation = generation_seed;
    root.i_block[0] = inode::set_producer_flg(root_dir_block);

    let itable_offset = 4 * BLOCK_SIZE + (ROOT_INO as u64 - 1) * INODE_SIZE;
    let bincode_opt = DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes();
    let raw_root = bincode_opt.serialize(&root)?;
    ctx.drive.seek(SeekFrom::Start(itable_offset))?;
    ctx.drive.write_all(&raw_root)?;

    let dir_block = namei::build_empty_dir_block(ROOT_INO, ROOT_INO);
    ctx.drive.seek(SeekFrom::Start(root_dir_block as u64 * BLOCK_SIZE))?;
    ctx.drive.write_all(&dir_block)?;

    // The superblock goes last, so that an interrupted mkfs leaves an
    // undetectable image rather than a half-built one.

    let mut sb = SuperBlock::default();
    sb.s_magic = VERFS_MAGIC;
    sb.s_state = 0x1;
    sb.s_inodes_count = inodes_count;
    sb.s_blocks_count = blocks_count;
    sb.s_free_inodes_count = inodes_count - (FIRST_INO - 1);
    sb.s_free_blocks_count = blocks_count - root_dir_block - 1;
    sb.s_first_data_block = first_data_block;
    sb.s_log_block_size = 0;
    sb.s_first_ino = FIRST_INO;
    sb.s_inode_size = INODE_SIZE as u16;
    sb.s_block_bitmap = 2;
    sb.s_inode_bitmap = 3;
    sb.s_inode_table = 4;
    sb.s_journal_start = journal_start;
    sb.s_journal_blocks = JOURNAL_BLOCKS;
    sb.s_generation_seed = generation_seed.wrapping_add(1);
    sb.s_mkfs_time = now;
    sb.s_wtime = now;

    write_superblock(ctx, &mut sb)?;
    ctx.drive.flush()?;

    Ok(())
}


/// Mounts the filesystem: superblock validation, journal recovery, bitmap
/// load and orphan-list processing, in that order.
pub fn mount(ctx: &mut Context) -> Result<Fs>
{
    let bincode_opt = DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes();

    ctx.drive.seek(SeekFrom::Start(SUPERBLOCK_OFFSET))?;
    let sb: SuperBlock = bincode_opt.deserialize_from(&ctx.drive)?;

    if sb.s_magic != VERFS_MAGIC {
        return Err(FsError::Corrupt("bad magic in superblock".into()));
    }
    if sb.s_log_block_size != 0 {
        return Err(FsError::Corrupt("unsupported block size".into()));
    }

    let mut check = sb;
    check.s_checksum = 0;
    let raw = bincode_opt.serialize(&check)?;
    if crc32c_le(!0, &raw) != sb.s_checksum {
        return Err(FsError::Corrupt("superblock checksum mismatch".into()));
    }

    let state = State { 0: sb.s_state };
    if state.has_unknown() {
        return Err(FsError::Corrupt(format!("unknown state flags: {:#06x}", sb.s_state)));
    }
    let mut readonly = false;
    if !state.has_valid() || state.has_error() {
        ctx.logger.log(0, "warning: filesystem has errors, continuing read-only");
        readonly = true;
    }

    let mut fs = Fs {
        sb,
        readonly,
        block_map: Bitmap::new(BLOCK_SIZE as usize),
        inode_map: Bitmap::new(BLOCK_SIZE as usize),
        icache: Icache::new(),
        pcache: buffer::PageCache::new(),
        dcache: namei::DentryCache::new(),
        files: file::OpenFiles::new(),
        journal: journal::Journal::new(),
        generation: sb.s_generation_seed,
    };

    // A committed-but-unfinished transaction must reach its home blocks
    // before anything else reads them.
    journal::recover(&mut fs, ctx)?;

    ctx.drive.seek(SeekFrom::Start(fs.sb.s_block_bitmap as u64 * BLOCK_SIZE))?;
    fs.block_map = Bitmap::from_reader(&mut ctx.drive, BLOCK_SIZE as usize)?;
    ctx.drive.seek(SeekFrom::Start(fs.sb.s_inode_bitmap as u64 * BLOCK_SIZE))?;
    fs.inode_map = Bitmap::from_reader(&mut ctx.drive, BLOCK_SIZE as usize)?;

    if !fs.readonly {
        orphan::recover_orphans(&mut fs, ctx)?;
    }

    Ok(fs)
}


/// Unmounts: flushes dirty pages and writes the superblock back.
pub fn unmount(mut fs: Fs, ctx: &mut Context) -> Result<()>
{
    buffer::flush_all(&mut fs, ctx)?;

    if !fs.readonly {
        fs.sb.s_wtime = now_secs();
        fs.sb.s_generation_seed = fs.generation;
        let mut sb = fs.sb;
        write_superblock(ctx, &mut sb)?;
    }
    ctx.drive.flush()?;

    Ok(())
}


/// Serializes the superblock, recomputing its checksum.
pub(crate) fn write_superblock(ctx: &mut Context, sb: &mut SuperBlock) -> Result<()>
{
    let bincode_opt = DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes();

    sb.s_checksum = 0;
    let raw = bincode_opt.serialize(sb)?;
    sb.s_checksum = crc32c_le(!0, &raw);
    let raw = bincode_opt.serialize(sb)?;

    ctx.drive.seek(SeekFrom::Start(SUPERBLOCK_OFFSET))?;
    ctx.drive.write_all(&raw)?;

    Ok(())
}


/// Reads one block from the drive.
pub(crate) fn read_block(ctx: &mut Context, blocknr: u32) -> Result<Vec<u8>>
{
    let mut buf = vec![u8::default(); BLOCK_SIZE as usize];
    ctx.drive.seek(SeekFrom::Start(blocknr as u64 * BLOCK_SIZE))?;
    ctx.drive.read_exact(&mut buf)?;

    Ok(buf)
}


/// Writes one block to the drive.
pub(crate) fn write_block(ctx: &mut Context, blocknr: u32, data: &[u8]) -> Result<()>
{
    assert!(data.len() == BLOCK_SIZE as usize);

    ctx.drive.seek(SeekFrom::Start(blocknr as u64 * BLOCK_SIZE))?;
    ctx.drive.write_all(data)?;

    Ok(())
}


/// Seeded little-endian crc32c (Castagnoli).
pub(crate) fn crc32c_le(seed: u32, buf: &[u8]) -> u32
{
    crc::crc32::update(seed ^ (!0), &crc::crc32::CASTAGNOLI_TABLE, buf) ^ (!0u32)
}


pub(crate) fn now_secs() -> u32
{
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}


#[cfg(test)]
pub(crate) mod testutil {
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::logger::Logger;
    use crate::Context;
    use super::Fs;

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    /// A scratch drive image, removed again on drop.
    pub struct Scratch {
        pub path: PathBuf,
    }

    impl Drop for Scratch {
        fn drop(&mut self)
        {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    /// Builds and mounts a small scratch filesystem.
    pub fn scratch(tag: &str) -> (Fs, Context, Scratch)
    {
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        let mut path = std::env::temp_dir();
        path.push(format!("verfs-{}-{}-{}.img", std::process::id(), tag, n));
        let _ = std::fs::remove_file(&path);

        let drive = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let mut ctx = Context {
            drive,
            logger: Logger::new(0, None),
        };

        super::mkfs(&mut ctx, 4096, 512).unwrap();
        let fs = super::mount(&mut ctx).unwrap();

        (fs, ctx, Scratch { path })
    }

    /// Unmounts and mounts again, dropping every in-memory cache.
    pub fn remount(fs: Fs, ctx: &mut Context) -> Fs
    {
        super::unmount(fs, ctx).unwrap();
        super::mount(ctx).unwrap()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::file::{self, OpenIntent, O_WRONLY, O_VERSION, O_VSEARCH, O_PARENT};
    use super::inode::{self, test_producer_flg};
    use super::readversion::{self, DT_PARENT, DT_CHILD, DT_VROOT};
    use super::testutil::scratch;

    fn write_intent() -> OpenIntent
    {
        OpenIntent::from_flags(O_WRONLY, 0)
    }

    fn version_write_intent() -> OpenIntent
    {
        OpenIntent::from_flags(O_WRONLY | O_VERSION, 0)
    }

    fn vsearch_write_intent(ino: u32) -> OpenIntent
    {
        OpenIntent::from_flags(O_WRONLY | O_VSEARCH, ino)
    }

    fn vsearch_read_intent(ino: u32) -> OpenIntent
    {
        OpenIntent::from_flags(O_VSEARCH, ino)
    }

    fn write_file(fs: &mut Fs, ctx: &mut crate::Context, path: &str, intent: OpenIntent, data: &[u8]) -> u32
    {
        let fd = file::open_path(fs, ctx, path, intent).unwrap();
        file::file_write(fs, ctx, fd, 0, data).unwrap();
        let ino = fs.files.get(fd).unwrap().ino;
        file::close(fs, ctx, fd).unwrap();

        ino
    }

    fn read_version(fs: &mut Fs, ctx: &mut crate::Context, path: &str, ino: u32) -> Vec<u8>
    {
        let fd = file::open_path(fs, ctx, path, vsearch_read_intent(ino)).unwrap();
        let data = file::file_read(fs, ctx, fd, 0, 65536).unwrap();
        file::close(fs, ctx, fd).unwrap();

        data
    }

    fn assert_clean(fs: &mut Fs, ctx: &mut crate::Context)
    {
        let violations = checker::check(fs, ctx).unwrap();
        assert!(violations.is_empty(), "{:?}", violations);
    }

    mod mkfs_and_mount {
        use super::*;

        #[test]
        fn superblock_round_trip()
        {
            let (fs, mut ctx, _img) = scratch("sb");

            assert_eq!(VERFS_MAGIC, fs.sb.s_magic);
            assert_eq!(4096, fs.sb.s_blocks_count);
            assert_eq!(512, fs.sb.s_inodes_count);

            let fs = testutil::remount(fs, &mut ctx);
            assert_eq!(4096, fs.sb.s_blocks_count);
        }

        #[test]
        fn root_directory_is_listable()
        {
            let (mut fs, mut ctx, _img) = scratch("rootdir");

            let entries = namei::dir_entries(&mut fs, &mut ctx, ROOT_INO).unwrap();
            let names: Vec<String> = entries.iter().map(|e| e.0.clone()).collect();

            assert_eq!(vec![".", ".."], names);
        }

        #[test]
        fn detect_rejects_garbage()
        {
            use std::io::{Seek, SeekFrom, Write};

            let (fs, mut ctx, _img) = scratch("garbage");
            drop(fs);

            ctx.drive.seek(SeekFrom::Start(SUPERBLOCK_OFFSET)).unwrap();
            ctx.drive.write_all(&[0xff; 64]).unwrap();

            assert!(crate::filesys::detect_fs(&mut ctx).is_err());
        }
    }

    mod scenarios {
        use super::*;

        // A fresh file is the root of a tree of one: self-linked ring, no
        // parent, every pointer produced by itself.
        #[test]
        fn solo_file()
        {
            let (mut fs, mut ctx, _img) = scratch("solo");

            let ino = namei::create(&mut fs, &mut ctx, "/x").unwrap();
            write_file(&mut fs, &mut ctx, "/x", write_intent(), b"hello");

            let node = inode::read_inode(&mut fs, &mut ctx, ino).unwrap();
            assert_eq!(0, node.i_parent_ino);
            assert_eq!(0, node.i_child_ino);
            assert_eq!(ino, node.i_sibling_next_ino);
            assert_eq!(ino, node.i_sibling_prev_ino);
            assert_eq!(1, node.i_vtree_nlink);
            assert_eq!(5, node.i_size);
            for ptr in node.i_block {
                assert!(ptr == 0 || test_producer_flg(ptr));
            }

            assert_eq!(b"hello".to_vec(), read_version(&mut fs, &mut ctx, "/x", ino));
            assert_clean(&mut fs, &mut ctx);
        }

        // A version-intent write freezes the old contents in a fresh
        // inode that takes the writer's place as tree root.
        #[test]
        fn first_snapshot()
        {
            let (mut fs, mut ctx, _img) = scratch("snap1");

            let leaf = namei::create(&mut fs, &mut ctx, "/x").unwrap();
            write_file(&mut fs, &mut ctx, "/x", write_intent(), b"hello");
            write_file(&mut fs, &mut ctx, "/x", version_write_intent(), b"HELP!");

            let node = inode::read_inode(&mut fs, &mut ctx, leaf).unwrap();
            let frozen = node.i_parent_ino;
            assert_ne!(0, frozen);

            let frozen_node = inode::read_inode(&mut fs, &mut ctx, frozen).unwrap();
            assert_eq!(0, frozen_node.i_parent_ino);
            assert_eq!(leaf, frozen_node.i_child_ino);
            assert_eq!(0, node.i_child_ino);
            assert_eq!(1, frozen_node.i_vtree_nlink);
            assert_eq!(0, node.i_vtree_nlink);

            // The name still resolves to the writable leaf.
            assert_eq!(leaf, namei::resolve_path(&mut fs, &mut ctx, "/x").unwrap());

            assert_eq!(b"HELP!".to_vec(), read_version(&mut fs, &mut ctx, "/x", leaf));
            assert_eq!(b"hello".to_vec(), read_version(&mut fs, &mut ctx, "/x", frozen));
            assert_clean(&mut fs, &mut ctx);
        }

        // Contents survive a remount: the copy-on-write divergence is
        // durable, not a page-cache artifact.
        #[test]
        fn snapshot_contents_survive_remount()
        {
            let (mut fs, mut ctx, _img) = scratch("snapdur");

            let leaf = namei::create(&mut fs, &mut ctx, "/x").unwrap();
            write_file(&mut fs, &mut ctx, "/x", write_intent(), b"hello");
            write_file(&mut fs, &mut ctx, "/x", version_write_intent(), b"HELP!");
            let frozen = inode::read_inode(&mut fs, &mut ctx, leaf).unwrap().i_parent_ino;

            let mut fs = testutil::remount(fs, &mut ctx);

            assert_eq!(b"HELP!".to_vec(), read_version(&mut fs, &mut ctx, "/x", leaf));
            assert_eq!(b"hello".to_vec(), read_version(&mut fs, &mut ctx, "/x", frozen));
            assert_clean(&mut fs, &mut ctx);
        }

        // Writing a frozen interior version forks a sibling branch: a new
        // root freezes its contents and the two lines of history sit side
        // by side in one ring.
        #[test]
        fn sibling_snapshot()
        {
            let (mut fs, mut ctx, _img) = scratch("sibling");

            let leaf = namei::create(&mut fs, &mut ctx, "/x").unwrap();
            write_file(&mut fs, &mut ctx, "/x", write_intent(), b"hello");
            write_file(&mut fs, &mut ctx, "/x", version_write_intent(), b"HELP!");
            let frozen = inode::read_inode(&mut fs, &mut ctx, leaf).unwrap().i_parent_ino;

            write_file(&mut fs, &mut ctx, "/x", vsearch_write_intent(frozen), b"hi!");

            let frozen_node = inode::read_inode(&mut fs, &mut ctx, frozen).unwrap();
            let root = frozen_node.i_parent_ino;
            assert_ne!(0, root);
            let root_node = inode::read_inode(&mut fs, &mut ctx, root).unwrap();
            assert_eq!(0, root_node.i_parent_ino);
            assert_eq!(1, root_node.i_vtree_nlink);

            // {leaf, frozen} form a closed two-member ring under the root.
            let ring = sibling::walk(&mut fs, &mut ctx, leaf).unwrap();
            assert_eq!(2, ring.len());
            assert!(ring.contains(&frozen));
            let leaf_node = inode::read_inode(&mut fs, &mut ctx, leaf).unwrap();
            assert_eq!(root, leaf_node.i_parent_ino);
            assert_eq!(frozen, leaf_node.i_sibling_next_ino);
            assert_eq!(frozen, leaf_node.i_sibling_prev_ino);

            assert_eq!(b"hello".to_vec(), read_version(&mut fs, &mut ctx, "/x", root));
            assert_eq!(b"HELP!".to_vec(), read_version(&mut fs, &mut ctx, "/x", leaf));
            assert_eq!(b"hi!".to_vec(), read_version(&mut fs, &mut ctx, "/x", frozen));
            assert_clean(&mut fs, &mut ctx);
        }

        // Reading a versioned file as a directory lists its tree
        // neighbors: children for a root, parent plus root marker for a
        // leaf.
        #[test]
        fn version_listing()
        {
            let (mut fs, mut ctx, _img) = scratch("listing");

            let leaf = namei::create(&mut fs, &mut ctx, "/x").unwrap();
            write_file(&mut fs, &mut ctx, "/x", write_intent(), b"hello");
            write_file(&mut fs, &mut ctx, "/x", version_write_intent(), b"HELP!");
            let frozen = inode::read_inode(&mut fs, &mut ctx, leaf).unwrap().i_parent_ino;
            write_file(&mut fs, &mut ctx, "/x", vsearch_write_intent(frozen), b"hi!");
            let root = inode::read_inode(&mut fs, &mut ctx, frozen).unwrap().i_parent_ino;

            let entries = readversion::read_version_dir(&mut fs, &mut ctx, root).unwrap();
            assert_eq!(2, entries.len());
            assert!(entries.iter().all(|e| e.d_type == DT_CHILD));
            assert!(entries.iter().all(|e| e.name.is_empty()));
            let inos: Vec<u32> = entries.iter().map(|e| e.d_ino).collect();
            assert!(inos.contains(&leaf));
            assert!(inos.contains(&frozen));

            let entries = readversion::read_version_dir(&mut fs, &mut ctx, leaf).unwrap();
            assert_eq!(1, entries.len());
            assert_eq!(root, entries[0].d_ino);
            assert_eq!(DT_PARENT | DT_VROOT, entries[0].d_type);
        }

        // Deleting an interior version splices its children up one level;
        // the tree keeps its shape and link counts.
        #[test]
        fn detach_middle()
        {
            let (mut fs, mut ctx, _img) = scratch("middle");

            let leaf = namei::create(&mut fs, &mut ctx, "/x").unwrap();
            write_file(&mut fs, &mut ctx, "/x", write_intent(), b"one");
            write_file(&mut fs, &mut ctx, "/x", version_write_intent(), b"two");
            write_file(&mut fs, &mut ctx, "/x", version_write_intent(), b"three");

            let node = inode::read_inode(&mut fs, &mut ctx, leaf).unwrap();
            let middle = node.i_parent_ino;
            let root = inode::read_inode(&mut fs, &mut ctx, middle).unwrap().i_parent_ino;
            assert_ne!(0, root);

            let fd = file::open_path(&mut fs, &mut ctx, "/x", vsearch_read_intent(middle)).unwrap();
            file::delete_version(&mut fs, &mut ctx, fd).unwrap();
            file::close(&mut fs, &mut ctx, fd).unwrap();

            let node = inode::read_inode(&mut fs, &mut ctx, leaf).unwrap();
            assert_eq!(root, node.i_parent_ino);
            let root_node = inode::read_inode(&mut fs, &mut ctx, root).unwrap();
            assert_eq!(leaf, root_node.i_child_ino);
            assert_eq!(1, root_node.i_vtree_nlink);

            // Nothing shared the middle version's blocks, so it is gone.
            assert!(matches!(
                inode::read_inode(&mut fs, &mut ctx, middle),
                Err(FsError::BrokenLink),
            ));

            assert_eq!(b"one".to_vec(), read_version(&mut fs, &mut ctx, "/x", root));
            assert_eq!(b"three".to_vec(), read_version(&mut fs, &mut ctx, "/x", leaf));
            assert_clean(&mut fs, &mut ctx);
        }

        #[test]
        fn delete_version_rejects_root()
        {
            let (mut fs, mut ctx, _img) = scratch("delroot");

            namei::create(&mut fs, &mut ctx, "/x").unwrap();
            write_file(&mut fs, &mut ctx, "/x", write_intent(), b"hello");

            let fd = file::open_path(&mut fs, &mut ctx, "/x", OpenIntent::default()).unwrap();
            let res = file::delete_version(&mut fs, &mut ctx, fd);
            file::close(&mut fs, &mut ctx, fd).unwrap();

            assert!(matches!(res, Err(FsError::NotPermitted(_))));
        }

        // Hard links pin the tree through the root's tree-wide count; the
        // last unlink reclaims every version.
        #[test]
        fn link_and_reclaim()
        {
            let (mut fs, mut ctx, _img) = scratch("links");

            let leaf = namei::create(&mut fs, &mut ctx, "/x").unwrap();
            write_file(&mut fs, &mut ctx, "/x", write_intent(), b"hello");
            write_file(&mut fs, &mut ctx, "/x", version_write_intent(), b"HELP!");
            let frozen = inode::read_inode(&mut fs, &mut ctx, leaf).unwrap().i_parent_ino;

            let free_before = fs.sb.s_free_blocks_count;

            namei::link(&mut fs, &mut ctx, "/x", "/y", None).unwrap();
            let root_node = inode::read_inode(&mut fs, &mut ctx, frozen).unwrap();
            assert_eq!(2, root_node.i_vtree_nlink);
            assert_clean(&mut fs, &mut ctx);

            namei::unlink(&mut fs, &mut ctx, "/x").unwrap();
            let root_node = inode::read_inode(&mut fs, &mut ctx, frozen).unwrap();
            assert_eq!(1, root_node.i_vtree_nlink);
            let leaf_node = inode::read_inode(&mut fs, &mut ctx, leaf).unwrap();
            assert!(!inode::IFlags { 0: leaf_node.i_flags }.has_phantom());
            assert_clean(&mut fs, &mut ctx);

            namei::unlink(&mut fs, &mut ctx, "/y").unwrap();
            assert!(matches!(
                inode::read_inode(&mut fs, &mut ctx, leaf),
                Err(FsError::BrokenLink),
            ));
            assert!(matches!(
                inode::read_inode(&mut fs, &mut ctx, frozen),
                Err(FsError::BrokenLink),
            ));
            assert_eq!(0, fs.sb.s_last_orphan);

            // Both versions' blocks returned to the pool, plus nothing
            // leaked from the link/unlink cycle itself.
            assert!(fs.sb.s_free_blocks_count > free_before);
            assert_clean(&mut fs, &mut ctx);
        }

        // Unlinking a tree that is still open defers reclamation: every
        // version turns phantom on the orphan list until the last close.
        #[test]
        fn reclaim_waits_for_close()
        {
            let (mut fs, mut ctx, _img) = scratch("phantoms");

            let leaf = namei::create(&mut fs, &mut ctx, "/x").unwrap();
            write_file(&mut fs, &mut ctx, "/x", write_intent(), b"hello");
            write_file(&mut fs, &mut ctx, "/x", version_write_intent(), b"HELP!");
            let frozen = inode::read_inode(&mut fs, &mut ctx, leaf).unwrap().i_parent_ino;

            let fd = file::open_path(&mut fs, &mut ctx, "/x", OpenIntent::default()).unwrap();
            namei::unlink(&mut fs, &mut ctx, "/x").unwrap();

            let leaf_node = inode::read_inode(&mut fs, &mut ctx, leaf).unwrap();
            assert!(inode::IFlags { 0: leaf_node.i_flags }.has_phantom());
            let frozen_node = inode::read_inode(&mut fs, &mut ctx, frozen).unwrap();
            assert!(inode::IFlags { 0: frozen_node.i_flags }.has_phantom());
            assert_ne!(0, fs.sb.s_last_orphan);

            // The open descriptor still reads the unlinked version.
            assert_eq!(b"HELP!".to_vec(), file::file_read(&mut fs, &mut ctx, fd, 0, 16).unwrap());

            file::close(&mut fs, &mut ctx, fd).unwrap();
            assert!(matches!(
                inode::read_inode(&mut fs, &mut ctx, leaf),
                Err(FsError::BrokenLink),
            ));
            assert_eq!(0, fs.sb.s_last_orphan);
            assert_clean(&mut fs, &mut ctx);
        }

        // A version-specific hard link (VLINK) pins one frozen version
        // under its own name.
        #[test]
        fn vlink_names_a_version()
        {
            let (mut fs, mut ctx, _img) = scratch("vlink");

            let leaf = namei::create(&mut fs, &mut ctx, "/x").unwrap();
            write_file(&mut fs, &mut ctx, "/x", write_intent(), b"hello");
            write_file(&mut fs, &mut ctx, "/x", version_write_intent(), b"HELP!");
            let frozen = inode::read_inode(&mut fs, &mut ctx, leaf).unwrap().i_parent_ino;

            namei::link(&mut fs, &mut ctx, "/x", "/old", Some(frozen)).unwrap();

            assert_eq!(frozen, namei::resolve_path(&mut fs, &mut ctx, "/old").unwrap());
            let root_node = inode::read_inode(&mut fs, &mut ctx, frozen).unwrap();
            assert_eq!(2, root_node.i_vtree_nlink);
            assert_eq!(b"hello".to_vec(), read_version(&mut fs, &mut ctx, "/old", frozen));
            assert_clean(&mut fs, &mut ctx);
        }

        // Writing through O_PARENT addresses the parent version, which
        // itself branches first.
        #[test]
        fn parent_open_branches()
        {
            let (mut fs, mut ctx, _img) = scratch("parent");

            let leaf = namei::create(&mut fs, &mut ctx, "/x").unwrap();
            write_file(&mut fs, &mut ctx, "/x", write_intent(), b"hello");
            write_file(&mut fs, &mut ctx, "/x", version_write_intent(), b"HELP!");
            let frozen = inode::read_inode(&mut fs, &mut ctx, leaf).unwrap().i_parent_ino;

            let intent = OpenIntent::from_flags(O_WRONLY | O_PARENT, 0);
            let written = write_file(&mut fs, &mut ctx, "/x", intent, b"again");
            assert_eq!(frozen, written);

            assert_eq!(b"again".to_vec(), read_version(&mut fs, &mut ctx, "/x", frozen));
            let frozen_node = inode::read_inode(&mut fs, &mut ctx, frozen).unwrap();
            let new_root = frozen_node.i_parent_ino;
            assert_ne!(0, new_root);
            assert_eq!(b"hello".to_vec(), read_version(&mut fs, &mut ctx, "/x", new_root));
            assert_clean(&mut fs, &mut ctx);
        }

        // A plain write to a version that already has a child branches
        // implicitly: frozen history is never overwritten in place.
        #[test]
        fn implicit_branch_on_write()
        {
            let (mut fs, mut ctx, _img) = scratch("implicit");

            let leaf = namei::create(&mut fs, &mut ctx, "/x").unwrap();
            write_file(&mut fs, &mut ctx, "/x", write_intent(), b"hello");
            write_file(&mut fs, &mut ctx, "/x", version_write_intent(), b"HELP!");
            let frozen = inode::read_inode(&mut fs, &mut ctx, leaf).unwrap().i_parent_ino;

            // The frozen version has a child, so even a plain write intent
            // must snapshot it first.
            write_file(&mut fs, &mut ctx, "/x", vsearch_write_intent(frozen), b"fork");

            assert_eq!(b"fork".to_vec(), read_version(&mut fs, &mut ctx, "/x", frozen));
            let frozen_node = inode::read_inode(&mut fs, &mut ctx, frozen).unwrap();
            let new_root = frozen_node.i_parent_ino;
            assert_eq!(b"hello".to_vec(), read_version(&mut fs, &mut ctx, "/x", new_root));
            assert_clean(&mut fs, &mut ctx);
        }

        // Partial page writes only diverge the touched blocks; untouched
        // bytes keep reading through the shared blocks of the parent.
        #[test]
        fn partial_write_preserves_shared_bytes()
        {
            let (mut fs, mut ctx, _img) = scratch("partial");

            let leaf = namei::create(&mut fs, &mut ctx, "/x").unwrap();
            let mut payload = vec![b'a'; 3 * BLOCK_SIZE as usize];
            payload[BLOCK_SIZE as usize..2 * BLOCK_SIZE as usize].fill(b'b');
            write_file(&mut fs, &mut ctx, "/x", write_intent(), &payload);
            write_file(&mut fs, &mut ctx, "/x", version_write_intent(), b"");

            // Overwrite a few bytes in the middle block only.
            let fd = file::open_path(&mut fs, &mut ctx, "/x", write_intent()).unwrap();
            file::file_write(&mut fs, &mut ctx, fd, BLOCK_SIZE + 10, b"XYZ").unwrap();
            file::close(&mut fs, &mut ctx, fd).unwrap();

            let frozen = inode::read_inode(&mut fs, &mut ctx, leaf).unwrap().i_parent_ino;
            let old = read_version(&mut fs, &mut ctx, "/x", frozen);
            assert_eq!(payload, old);

            let new = read_version(&mut fs, &mut ctx, "/x", leaf);
            assert_eq!(payload.len(), new.len());
            assert_eq!(&new[..BLOCK_SIZE as usize], &payload[..BLOCK_SIZE as usize]);
            assert_eq!(b"XYZ", &new[BLOCK_SIZE as usize + 10..BLOCK_SIZE as usize + 13]);
            assert_eq!(&new[2 * BLOCK_SIZE as usize..], &payload[2 * BLOCK_SIZE as usize..]);

            // The leaf produced a fresh middle block and still shares the
            // other two with the frozen parent.
            let leaf_node = inode::read_inode(&mut fs, &mut ctx, leaf).unwrap();
            assert!(!test_producer_flg(leaf_node.i_block[0]));
            assert!(test_producer_flg(leaf_node.i_block[1]));
            assert!(!test_producer_flg(leaf_node.i_block[2]));
            assert_clean(&mut fs, &mut ctx);
        }
    }
}
