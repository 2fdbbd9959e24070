use std::collections::BTreeMap;
use std::io::{Seek, SeekFrom, Write};

use bincode::{DefaultOptions, Options};
use serde::{Deserialize, Serialize};

use crate::bitmap::Bitmap;
use crate::serial::Array;
use crate::Context;
use super::{Fs, FsError, Result, BLOCK_SIZE, SUPERBLOCK_OFFSET, crc32c_le};


const JOURNAL_DESC_MAGIC: u32 = 0x564a_4e4c;
const JOURNAL_COMMIT_MAGIC: u32 = 0x564a_434d;

/// One descriptor block indexes at most this many staged blocks; together
/// with the descriptor and commit blocks it must fit the journal area.
pub const MAX_TRANS_BLOCKS: usize = 61;


/// Journal descriptor block: the home addresses of the staged images that
/// follow it in the journal area.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
struct Descriptor {
    j_magic: u32,
    j_sequence: u32,
    j_count: u32,
    j_home: Array<u32, 61>,
}


/// Journal commit block. A transaction without one is discarded on recovery.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
struct Commit {
    j_magic: u32,
    j_sequence: u32,
    j_checksum: u32,
}


/// Journal state of a mounted filesystem.
#[derive(Debug)]
pub struct Journal {
    pub running: bool,
    pub sequence: u32,
}

impl Journal {
    pub fn new() -> Self
    {
        Self {
            running: false,
            sequence: 1,
        }
    }
}


/// An open transaction. Metadata writers stage whole-block images here;
/// nothing reaches the drive until `stop` commits the lot.
#[derive(Debug)]
pub struct Handle {
    staged: BTreeMap<u32, Vec<u8>>,
}

impl Handle {
    pub fn stage(&mut self, blocknr: u32, image: Vec<u8>)
    {
        assert!(image.len() == BLOCK_SIZE as usize);
        self.staged.insert(blocknr, image);
    }

    pub fn staged(&self, blocknr: u32) -> Option<&Vec<u8>>
    {
        self.staged.get(&blocknr)
    }

    pub fn len(&self) -> usize
    {
        self.staged.len()
    }
}


/// Opens a transaction.
pub fn start(fs: &mut Fs) -> Result<Handle>
{
    if fs.readonly {
        return Err(FsError::JournalAbort("filesystem is read-only".into()));
    }
    if fs.journal.running {
        return Err(FsError::JournalAbort("nested transaction".into()));
    }

    fs.journal.running = true;

    Ok(Handle { staged: BTreeMap::new() })
}


/// Commits a transaction: descriptor, staged images and commit record go to
/// the journal area first; only then are the home blocks rewritten and the
/// descriptor invalidated.
pub fn stop(fs: &mut Fs, ctx: &mut Context, handle: Handle) -> Result<()>
{
    fs.journal.running = false;

    if handle.staged.is_empty() {
        return Ok(());
    }
    if handle.staged.len() > MAX_TRANS_BLOCKS {
        abort(fs, ctx, handle)?;
        return Err(FsError::JournalAbort("transaction too large".into()));
    }

    let bincode_opt = DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes();

    let sequence = fs.journal.sequence;
    let mut desc = Descriptor::default();
    desc.j_magic = JOURNAL_DESC_MAGIC;
    desc.j_sequence = sequence;
    desc.j_count = handle.staged.len() as u32;
    for (i, blocknr) in handle.staged.keys().enumerate() {
        desc.j_home.0[i] = *blocknr;
    }

    let raw_desc = bincode_opt.serialize(&desc)?;
    let mut checksum = crc32c_le(!0, &raw_desc);
    for image in handle.staged.values() {
        checksum = crc32c_le(checksum, image);
    }

    let journal_start = fs.sb.s_journal_start;
    let mut desc_block = vec![u8::default(); BLOCK_SIZE as usize];
    desc_block[..raw_desc.len()].copy_from_slice(&raw_desc);
    super::write_block(ctx, journal_start, &desc_block)?;

    for (i, image) in handle.staged.values().enumerate() {
        super::write_block(ctx, journal_start + 1 + i as u32, image)?;
    }

    let commit = Commit {
        j_magic: JOURNAL_COMMIT_MAGIC,
        j_sequence: sequence,
        j_checksum: checksum,
    };
    let raw_commit = bincode_opt.serialize(&commit)?;
    let mut commit_block = vec![u8::default(); BLOCK_SIZE as usize];
    commit_block[..raw_commit.len()].copy_from_slice(&raw_commit);
    super::write_block(ctx, journal_start + 1 + desc.j_count, &commit_block)?;
    ctx.drive.flush()?;

    // The transaction is durable; checkpoint to the home locations.

    for (blocknr, image) in &handle.staged {
        super::write_block(ctx, *blocknr, image)?;
    }
    ctx.drive.flush()?;

    clear_descriptor(ctx, journal_start)?;
    fs.journal.sequence = fs.journal.sequence.wrapping_add(1);

    Ok(())
}


/// Abandons a transaction. Nothing was written home, but the in-memory
/// caches may already contain the transaction's mutations, so they are
/// dropped and the superblock and bitmaps re-read from the drive.
pub fn abort(fs: &mut Fs, ctx: &mut Context, handle: Handle) -> Result<()>
{
    drop(handle);
    fs.journal.running = false;

    fs.icache.clear();
    fs.pcache.clear();
    fs.dcache.clear();

    let bincode_opt = DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes();

    ctx.drive.seek(SeekFrom::Start(SUPERBLOCK_OFFSET))?;
    fs.sb = bincode_opt.deserialize_from(&ctx.drive)?;

    ctx.drive.seek(SeekFrom::Start(fs.sb.s_block_bitmap as u64 * BLOCK_SIZE))?;
    fs.block_map = Bitmap::from_reader(&mut ctx.drive, BLOCK_SIZE as usize)?;
    ctx.drive.seek(SeekFrom::Start(fs.sb.s_inode_bitmap as u64 * BLOCK_SIZE))?;
    fs.inode_map = Bitmap::from_reader(&mut ctx.drive, BLOCK_SIZE as usize)?;

    Ok(())
}


/// Mount-time recovery: replays a committed transaction left in the
/// journal area, discards an uncommitted one.
pub fn recover(fs: &mut Fs, ctx: &mut Context) -> Result<()>
{
    let bincode_opt = DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes();

    let journal_start = fs.sb.s_journal_start;
    let raw = super::read_block(ctx, journal_start)?;
    let desc: Descriptor = bincode_opt.deserialize(&raw)?;

    if desc.j_magic != JOURNAL_DESC_MAGIC {
        return Ok(());
    }
    if desc.j_count == 0 || desc.j_count as usize > MAX_TRANS_BLOCKS {
        clear_descriptor(ctx, journal_start)?;
        return Ok(());
    }

    let raw_commit = super::read_block(ctx, journal_start + 1 + desc.j_count)?;
    let commit: Commit = bincode_opt.deserialize(&raw_commit)?;
    if commit.j_magic != JOURNAL_COMMIT_MAGIC || commit.j_sequence != desc.j_sequence {
        ctx.logger.log(1, "journal: discarding uncommitted transaction");
        clear_descriptor(ctx, journal_start)?;
        return Ok(());
    }

    let mut images = Vec::with_capacity(desc.j_count as usize);
    for i in 0..desc.j_count {
        images.push(super::read_block(ctx, journal_start + 1 + i)?);
    }

    let raw_desc = bincode_opt.serialize(&desc)?;
    let mut checksum = crc32c_le(!0, &raw_desc);
    for image in &images {
        checksum = crc32c_le(checksum, image);
    }
    if checksum != commit.j_checksum {
        ctx.logger.log(0, "journal: commit checksum mismatch, discarding transaction");
        clear_descriptor(ctx, journal_start)?;
        return Ok(());
    }

    ctx.logger.log(1, &format!(
        "journal: replaying transaction {} ({} blocks)",
        desc.j_sequence, desc.j_count,
    ));
    for (i, image) in images.iter().enumerate() {
        super::write_block(ctx, desc.j_home.0[i], image)?;
    }
    ctx.drive.flush()?;

    clear_descriptor(ctx, journal_start)?;
    fs.journal.sequence = desc.j_sequence.wrapping_add(1);

    // The replay may have rewritten the superblock image.
    ctx.drive.seek(SeekFrom::Start(SUPERBLOCK_OFFSET))?;
    fs.sb = bincode_opt.deserialize_from(&ctx.drive)?;

    Ok(())
}


fn clear_descriptor(ctx: &mut Context, journal_start: u32) -> Result<()>
{
    let zero = vec![u8::default(); BLOCK_SIZE as usize];
    super::write_block(ctx, journal_start, &zero)?;
    ctx.drive.flush()?;

    Ok(())
}


/// Reads a block as the open transaction sees it: the staged image if this
/// transaction already touched the block, the on-drive state otherwise.
pub fn read_staged(ctx: &mut Context, handle: &Handle, blocknr: u32) -> Result<Vec<u8>>
{
    if let Some(image) = handle.staged(blocknr) {
        return Ok(image.clone());
    }

    super::read_block(ctx, blocknr)
}


/// Stages the current in-memory superblock.
pub fn mark_sb_dirty(handle: &mut Handle, fs: &mut Fs) -> Result<()>
{
    let bincode_opt = DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes();

    fs.sb.s_checksum = 0;
    let raw = bincode_opt.serialize(&fs.sb)?;
    fs.sb.s_checksum = crc32c_le(!0, &raw);
    let raw = bincode_opt.serialize(&fs.sb)?;

    let mut image = vec![u8::default(); BLOCK_SIZE as usize];
    image[..raw.len()].copy_from_slice(&raw);
    handle.stage((SUPERBLOCK_OFFSET / BLOCK_SIZE) as u32, image);

    Ok(())
}


/// Stages the current in-memory allocation bitmaps.
pub fn mark_bitmaps_dirty(handle: &mut Handle, fs: &mut Fs) -> Result<()>
{
    handle.stage(fs.sb.s_block_bitmap, fs.block_map.as_bytes().to_vec());
    handle.stage(fs.sb.s_inode_bitmap, fs.inode_map.as_bytes().to_vec());

    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::super::{read_block, write_block, testutil};

    #[test]
    fn commit_reaches_home_blocks()
    {
        let (mut fs, mut ctx, _img) = testutil::scratch("jcommit");

        let target = fs.sb.s_first_data_block + 5;
        let image = vec![0xab_u8; BLOCK_SIZE as usize];

        let mut handle = start(&mut fs).unwrap();
        handle.stage(target, image.clone());
        stop(&mut fs, &mut ctx, handle).unwrap();

        assert_eq!(image, read_block(&mut ctx, target).unwrap());

        // The descriptor is invalidated after the checkpoint.
        let desc_block = read_block(&mut ctx, fs.sb.s_journal_start).unwrap();
        assert!(desc_block.iter().all(|b| *b == 0));
    }

    #[test]
    fn abort_reaches_nothing()
    {
        let (mut fs, mut ctx, _img) = testutil::scratch("jabort");

        let target = fs.sb.s_first_data_block + 5;
        let before = read_block(&mut ctx, target).unwrap();

        let mut handle = start(&mut fs).unwrap();
        handle.stage(target, vec![0xcd_u8; BLOCK_SIZE as usize]);
        abort(&mut fs, &mut ctx, handle).unwrap();

        assert_eq!(before, read_block(&mut ctx, target).unwrap());
        assert!(!fs.journal.running);
    }

    #[test]
    fn nested_transactions_are_refused()
    {
        let (mut fs, mut ctx, _img) = testutil::scratch("jnested");

        let first = start(&mut fs).unwrap();
        assert!(matches!(start(&mut fs), Err(FsError::JournalAbort(_))));
        abort(&mut fs, &mut ctx, first).unwrap();
    }

    #[test]
    fn committed_transaction_replays_on_mount()
    {
        let (mut fs, mut ctx, _img) = testutil::scratch("jreplay");

        let bincode_opt = DefaultOptions::new()
            .with_fixint_encoding()
            .allow_trailing_bytes();

        let journal_start = fs.sb.s_journal_start;
        let target = fs.sb.s_first_data_block + 6;
        let image = vec![0x5a_u8; BLOCK_SIZE as usize];

        // Forge a committed transaction, as a crash between the commit
        // record and the checkpoint would leave it.
        let mut desc = Descriptor::default();
        desc.j_magic = JOURNAL_DESC_MAGIC;
        desc.j_sequence = 9;
        desc.j_count = 1;
        desc.j_home.0[0] = target;
        let raw_desc = bincode_opt.serialize(&desc).unwrap();
        let mut checksum = crc32c_le(!0, &raw_desc);
        checksum = crc32c_le(checksum, &image);

        let mut desc_block = vec![0_u8; BLOCK_SIZE as usize];
        desc_block[..raw_desc.len()].copy_from_slice(&raw_desc);
        write_block(&mut ctx, journal_start, &desc_block).unwrap();
        write_block(&mut ctx, journal_start + 1, &image).unwrap();

        let commit = Commit {
            j_magic: JOURNAL_COMMIT_MAGIC,
            j_sequence: 9,
            j_checksum: checksum,
        };
        let raw_commit = bincode_opt.serialize(&commit).unwrap();
        let mut commit_block = vec![0_u8; BLOCK_SIZE as usize];
        commit_block[..raw_commit.len()].copy_from_slice(&raw_commit);
        write_block(&mut ctx, journal_start + 2, &commit_block).unwrap();

        recover(&mut fs, &mut ctx).unwrap();

        assert_eq!(image, read_block(&mut ctx, target).unwrap());
        assert_eq!(10, fs.journal.sequence);
        let desc_block = read_block(&mut ctx, journal_start).unwrap();
        assert!(desc_block.iter().all(|b| *b == 0));
    }

    #[test]
    fn uncommitted_transaction_is_discarded()
    {
        let (mut fs, mut ctx, _img) = testutil::scratch("jpartial");

        let bincode_opt = DefaultOptions::new()
            .with_fixint_encoding()
            .allow_trailing_bytes();

        let journal_start = fs.sb.s_journal_start;
        let target = fs.sb.s_first_data_block + 6;
        let before = read_block(&mut ctx, target).unwrap();

        let mut desc = Descriptor::default();
        desc.j_magic = JOURNAL_DESC_MAGIC;
        desc.j_sequence = 4;
        desc.j_count = 1;
        desc.j_home.0[0] = target;
        let raw_desc = bincode_opt.serialize(&desc).unwrap();
        let mut desc_block = vec![0_u8; BLOCK_SIZE as usize];
        desc_block[..raw_desc.len()].copy_from_slice(&raw_desc);
        write_block(&mut ctx, journal_start, &desc_block).unwrap();
        write_block(&mut ctx, journal_start + 1, &vec![0x77_u8; BLOCK_SIZE as usize]).unwrap();
        // No commit record.

        recover(&mut fs, &mut ctx).unwrap();

        assert_eq!(before, read_block(&mut ctx, target).unwrap());
        let desc_block = read_block(&mut ctx, journal_start).unwrap();
        assert!(desc_block.iter().all(|b| *b == 0));
    }
}
