use std::collections::HashMap;

use bincode::{DefaultOptions, Options};
use serde::{Deserialize, Serialize};

use crate::Context;
use super::{Fs, FsError, Result, BLOCK_SIZE, now_secs};
use super::journal::{self, Handle};
use super::alloc;


pub const N_BLOCKS: usize = 15;

/// Serialized size of the inode structure; the on-disk slot
/// (`sb.s_inode_size`) is larger and zero-padded.
pub const INODE_STRUCT_SIZE: usize = 136;

/// Bit 31 of a block pointer marks the version that allocated the block.
pub const PRODUCER_BITS: u32 = 31;


/// The on-disk inode.
/// The version record follows the base fields: links into the version tree
/// (parent, first child, sibling ring), the version creation time, and the
/// tree-wide link count that is meaningful on tree roots only.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Inode {
    pub i_mode: u16,                 // File mode
    pub i_links_count: u16,          // Links count
    pub i_flags: u32,                // File flags
    pub i_size: u32,                 // Size in bytes
    pub i_atime: u32,                // Access time
    pub i_ctime: u32,                // Inode change time
    pub i_mtime: u32,                // Modification time
    pub i_dtime: u32,                // Deletion time; orphan list link while orphaned
    pub i_generation: u32,           // Inode generation
    pub i_block: [u32; N_BLOCKS],    // Pointers to blocks; bit 31 = producer
    // --- version record ---
    pub i_parent_ino: u32,           // Parent version (0 = tree root)
    pub i_parent_generation: u32,
    pub i_child_ino: u32,            // First child version, 0 if none
    pub i_child_generation: u32,
    pub i_sibling_prev_ino: u32,     // Sibling ring, reverse direction
    pub i_sibling_prev_generation: u32,
    pub i_sibling_next_ino: u32,     // Sibling ring, forward direction
    pub i_sibling_next_generation: u32,
    pub i_vtime_sec: u32,            // Version creation time
    pub i_vtime_nsec: u32,
    pub i_vtree_nlink: u32,          // Directory links into the whole tree (root only)
}


/// Inode mode (i_mode).
#[derive(Copy, Clone, Debug)]
pub struct IMode(pub u16);

impl IMode {
    pub const IFREG: u16 = 0x8000;
    pub const IFDIR: u16 = 0x4000;

    pub fn has_ifreg(&self) -> bool { self.0 & Self::IFREG != 0 }
    pub fn has_ifdir(&self) -> bool { self.0 & Self::IFDIR != 0 && !self.has_ifreg() }
}


/// Inode flags (i_flags).
#[derive(Copy, Clone, Debug)]
pub struct IFlags(pub u32);

impl IFlags {
    /// Unlinked from its directory but still reachable through the version tree.
    pub const PHANTOM: u32 = 0x1;
    /// Linked on the on-disk orphan list.
    pub const ORPHAN: u32 = 0x2;

    pub fn has_phantom(&self) -> bool { self.0 & Self::PHANTOM != 0 }
    pub fn has_orphan(&self)  -> bool { self.0 & Self::ORPHAN != 0 }

    pub fn get_unknown(&self) -> u32
    {
        (self.0 >> 2) << 2
    }

    pub fn has_unknown(&self) -> bool
    {
        self.get_unknown() != 0
    }
}


// Block pointer encoding: bit 31 is the producer flag, bits 30..0 the
// physical block number. The allocator only ever sees masked numbers.

pub fn test_producer_flg(datablock_number: u32) -> bool
{
    datablock_number & (1 << PRODUCER_BITS) != 0
}

pub fn set_producer_flg(datablock_number: u32) -> u32
{
    datablock_number | 1 << PRODUCER_BITS
}

pub fn clear_producer_flg(datablock_number: u32) -> u32
{
    datablock_number & !(1 << PRODUCER_BITS)
}


/// An in-memory inode table entry.
#[derive(Debug)]
pub struct IcacheEntry {
    pub inode: Inode,
    /// In-core references: open files and cached parent handles.
    pub count: u32,
    /// Parent version held in memory while the file is open.
    pub parent_handle: Option<u32>,
}


/// The in-memory inode table, keyed by inode number.
/// The engine is sequential and never evicts, so a cached copy is always
/// the newest state of the inode.
#[derive(Debug)]
pub struct Icache(HashMap<u32, IcacheEntry>);

impl Icache {
    pub fn new() -> Self
    {
        Self { 0: HashMap::new() }
    }

    pub fn get(&self, ino: u32) -> Option<&IcacheEntry>
    {
        self.0.get(&ino)
    }

    pub fn get_mut(&mut self, ino: u32) -> Option<&mut IcacheEntry>
    {
        self.0.get_mut(&ino)
    }

    pub fn insert(&mut self, ino: u32, entry: IcacheEntry)
    {
        self.0.insert(ino, entry);
    }

    pub fn remove(&mut self, ino: u32)
    {
        self.0.remove(&ino);
    }

    pub fn clear(&mut self)
    {
        self.0.clear();
    }
}


/// Locates an inode's slot: (inode table block, byte offset inside it).
fn itable_slot(fs: &Fs, ino: u32) -> (u32, usize)
{
    let slot_size = fs.sb.s_inode_size as u64;
    let per_block = BLOCK_SIZE / slot_size;
    let idx = ino as u64 - 1;

    let block = fs.sb.s_inode_table as u64 + idx / per_block;
    let offset = (idx % per_block) * slot_size;

    (block as u32, offset as usize)
}


/// Reads an inode through the cache.
pub fn read_inode(fs: &mut Fs, ctx: &mut Context, ino: u32) -> Result<Inode>
{
    if let Some(entry) = fs.icache.get(ino) {
        return Ok(entry.inode);
    }

    if ino == 0 || ino > fs.sb.s_inodes_count {
        return Err(FsError::BrokenLink);
    }
    if !fs.inode_map.check_bit(ino as usize - 1) {
        return Err(FsError::BrokenLink);
    }

    let (block, offset) = itable_slot(fs, ino);
    let raw = super::read_block(ctx, block)?;

    let bincode_opt = DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes();
    let inode: Inode = bincode_opt.deserialize(&raw[offset..])?;

    if inode.i_mode == 0 {
        return Err(FsError::BrokenLink);
    }

    fs.icache.insert(ino, IcacheEntry {
        inode,
        count: 0,
        parent_handle: None,
    });

    Ok(inode)
}


/// Reads an inode through the cache, verifying the link generation.
pub fn read_inode_checked(fs: &mut Fs, ctx: &mut Context, ino: u32, generation: u32) -> Result<Inode>
{
    let inode = read_inode(fs, ctx, ino)?;

    if inode.i_generation != generation {
        return Err(FsError::StaleGen);
    }

    Ok(inode)
}


/// Replaces the cached copy of an inode.
pub fn write_inode(fs: &mut Fs, ino: u32, inode: Inode)
{
    match fs.icache.get_mut(ino) {
        Some(entry) => entry.inode = inode,
        None => fs.icache.insert(ino, IcacheEntry {
            inode,
            count: 0,
            parent_handle: None,
        }),
    }
}


/// Applies a mutation to an inode and journals the result.
pub fn update_inode<F>(handle: &mut Handle, ino: u32, fs: &mut Fs, ctx: &mut Context, f: F) -> Result<()>
where
    F: FnOnce(&mut Inode)
{
    let mut inode = read_inode(fs, ctx, ino)?;
    f(&mut inode);
    write_inode(fs, ino, inode);

    mark_inode_dirty(handle, ino, fs, ctx)
}


/// Stages the cached inode into its inode table block.
pub fn mark_inode_dirty(handle: &mut Handle, ino: u32, fs: &mut Fs, ctx: &mut Context) -> Result<()>
{
    let inode = match fs.icache.get(ino) {
        Some(entry) => entry.inode,
        None => return Err(FsError::Corrupt(format!("dirty mark on uncached inode {}", ino))),
    };

    let bincode_opt = DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes();
    let raw = bincode_opt.serialize(&inode)?;

    let (block, offset) = itable_slot(fs, ino);
    let mut image = journal::read_staged(ctx, handle, block)?;
    image[offset..offset + raw.len()].copy_from_slice(&raw);
    handle.stage(block, image);

    Ok(())
}


/// Bumps the in-core reference count.
pub fn igrab(fs: &mut Fs, ino: u32)
{
    if let Some(entry) = fs.icache.get_mut(ino) {
        entry.count += 1;
    }
}

/// Drops one in-core reference.
pub fn iput(fs: &mut Fs, ino: u32)
{
    if let Some(entry) = fs.icache.get_mut(ino) {
        entry.count = entry.count.saturating_sub(1);
    }
}


/// Returns the cached parent version handle, resolving and caching it on
/// first use. `None` for tree roots.
pub fn get_parent_handle(fs: &mut Fs, ctx: &mut Context, ino: u32) -> Result<Option<u32>>
{
    let inode = read_inode(fs, ctx, ino)?;

    if let Some(entry) = fs.icache.get(ino) {
        if entry.parent_handle.is_some() {
            return Ok(entry.parent_handle);
        }
    }

    if inode.i_parent_ino == 0 {
        return Ok(None);
    }

    read_inode_checked(fs, ctx, inode.i_parent_ino, inode.i_parent_generation)
        .map_err(|e| match e {
            FsError::StaleGen => FsError::StaleGen,
            _ => FsError::BrokenLink,
        })?;
    igrab(fs, inode.i_parent_ino);

    let entry = fs.icache.get_mut(ino).unwrap();
    entry.parent_handle = Some(inode.i_parent_ino);

    Ok(entry.parent_handle)
}


/// Drops the cached parent handle, if any. Called on last close.
pub fn release_parent_handle(fs: &mut Fs, ino: u32) -> Option<u32>
{
    let parent = match fs.icache.get_mut(ino) {
        Some(entry) => entry.parent_handle.take(),
        None => None,
    };

    if let Some(parent_ino) = parent {
        iput(fs, parent_ino);
    }

    parent
}


/// Allocates and initialises a fresh inode.
pub fn new_inode(handle: &mut Handle, mode: u16, fs: &mut Fs, ctx: &mut Context) -> Result<u32>
{
    let ino = alloc::alloc_inode(handle, fs)?;

    let generation = fs.generation;
    fs.generation = fs.generation.wrapping_add(1);

    let now = now_secs();
    let mut inode = Inode::default();
    inode.i_mode = mode;
    inode.i_atime = now;
    inode.i_ctime = now;
    inode.i_mtime = now;
    inode.i_generation = generation;

    fs.icache.insert(ino, IcacheEntry {
        inode,
        count: 0,
        parent_handle: None,
    });
    mark_inode_dirty(handle, ino, fs, ctx)?;

    Ok(ino)
}


/// Frees every data block this version produced. Consumer pointers are
/// left to their producing ancestor.
pub fn free_inode_blocks(handle: &mut Handle, ino: u32, fs: &mut Fs, ctx: &mut Context) -> Result<()>
{
    let inode = read_inode(fs, ctx, ino)?;

    for ptr in inode.i_block {
        if ptr != 0 && test_producer_flg(ptr) {
            alloc::free_block(handle, clear_producer_flg(ptr), fs)?;
        }
    }
    update_inode(handle, ino, fs, ctx, |i| i.i_block = [0; N_BLOCKS])?;

    Ok(())
}


/// Releases the inode itself: wipes the slot and clears the bitmap bit.
pub fn free_inode(handle: &mut Handle, ino: u32, fs: &mut Fs, ctx: &mut Context) -> Result<()>
{
    update_inode(handle, ino, fs, ctx, |i| {
        *i = Inode::default();
        i.i_dtime = now_secs();
    })?;

    alloc::free_inode_bit(handle, ino, fs)?;
    fs.icache.remove(ino);
    fs.pcache.remove_inode(ino);

    Ok(())
}


/// Maps a logical block to its physical block, if allocated.
/// The producer flag is masked off.
pub fn map_block(fs: &mut Fs, ctx: &mut Context, ino: u32, lblock: u32) -> Result<Option<u32>>
{
    if lblock as usize >= N_BLOCKS {
        return Ok(None);
    }

    let inode = read_inode(fs, ctx, ino)?;
    let ptr = inode.i_block[lblock as usize];
    if ptr == 0 {
        return Ok(None);
    }

    Ok(Some(clear_producer_flg(ptr)))
}


/// The block-mapping callback of the write path (`create` semantics).
///
/// A pointer this version produced maps in place. A shared (consumer)
/// pointer, or a hole, gets a freshly allocated block with the producer
/// flag set; the shared block stays with its producing ancestor.
///
/// Returns the physical block and whether it was newly allocated.
pub fn get_block(handle: &mut Handle, ino: u32, lblock: u32, fs: &mut Fs, ctx: &mut Context) -> Result<(u32, bool)>
{
    if lblock as usize >= N_BLOCKS {
        return Err(FsError::NoSpace);
    }

    let inode = read_inode(fs, ctx, ino)?;
    let ptr = inode.i_block[lblock as usize];

    if ptr != 0 && test_producer_flg(ptr) {
        return Ok((clear_producer_flg(ptr), false));
    }

    let blocknr = alloc::alloc_block(handle, fs)?;
    update_inode(handle, ino, fs, ctx, |i| {
        i.i_block[lblock as usize] = set_producer_flg(blocknr);
    })?;

    Ok((blocknr, true))
}
