use std::collections::HashSet;

use crate::Context;
use super::{Fs, FsError, Result};
use super::inode::{self, IFlags, IMode, clear_producer_flg, test_producer_flg};
use super::journal::{self, Handle};
use super::vtree;


/// Puts an inode on the on-disk orphan list.
/// The list is chained through `i_dtime`, head in the superblock.
pub fn orphan_add(handle: &mut Handle, ino: u32, fs: &mut Fs, ctx: &mut Context) -> Result<()>
{
    let node = inode::read_inode(fs, ctx, ino)?;
    let flags = IFlags { 0: node.i_flags };
    if flags.has_orphan() {
        return Ok(());
    }

    let old_head = fs.sb.s_last_orphan;
    inode::update_inode(handle, ino, fs, ctx, |i| {
        i.i_dtime = old_head;
        i.i_flags |= IFlags::ORPHAN;
    })?;

    fs.sb.s_last_orphan = ino;
    journal::mark_sb_dirty(handle, fs)?;

    Ok(())
}


/// Takes an inode off the orphan list.
pub fn orphan_del(handle: &mut Handle, ino: u32, fs: &mut Fs, ctx: &mut Context) -> Result<()>
{
    let node = inode::read_inode(fs, ctx, ino)?;
    let flags = IFlags { 0: node.i_flags };
    if !flags.has_orphan() {
        return Ok(());
    }
    let next = node.i_dtime;

    if fs.sb.s_last_orphan == ino {
        fs.sb.s_last_orphan = next;
        journal::mark_sb_dirty(handle, fs)?;
    } else {
        // Find the predecessor in the chain.
        let mut cur = fs.sb.s_last_orphan;
        let mut hops = 0;
        loop {
            if cur == 0 {
                return Err(FsError::Corrupt(format!("inode {} not on the orphan list", ino)));
            }
            let cur_node = inode::read_inode(fs, ctx, cur)?;
            if cur_node.i_dtime == ino {
                inode::update_inode(handle, cur, fs, ctx, |i| i.i_dtime = next)?;
                break;
            }
            cur = cur_node.i_dtime;

            hops += 1;
            if hops > fs.sb.s_inodes_count {
                return Err(FsError::Corrupt("orphan list does not terminate".into()));
            }
        }
    }

    inode::update_inode(handle, ino, fs, ctx, |i| {
        i.i_dtime = 0;
        i.i_flags &= !IFlags::ORPHAN;
    })?;

    Ok(())
}


/// Collects the orphan list without modifying it.
pub fn orphan_list(fs: &mut Fs, ctx: &mut Context) -> Result<Vec<u32>>
{
    let mut list = Vec::new();
    let mut cur = fs.sb.s_last_orphan;

    while cur != 0 {
        list.push(cur);
        if list.len() > fs.sb.s_inodes_count as usize {
            return Err(FsError::Corrupt("orphan list does not terminate".into()));
        }

        cur = match inode::read_inode(fs, ctx, cur) {
            Ok(node) => node.i_dtime,
            Err(FsError::BrokenLink) => 0,
            Err(e) => return Err(e),
        };
    }

    Ok(list)
}


/// Marks every version of a tree phantom and enqueues it on the orphan
/// list; the namespace no longer reaches the tree but open files or a
/// crash window still might.
pub fn mark_tree_orphan(handle: &mut Handle, root: u32, fs: &mut Fs, ctx: &mut Context) -> Result<()>
{
    for member in vtree::tree_members(fs, ctx, root)? {
        orphan_add(handle, member, fs, ctx)?;
        inode::update_inode(handle, member, fs, ctx, |i| {
            i.i_flags |= IFlags::PHANTOM;
        })?;
    }

    Ok(())
}


/// Frees a whole version tree: every member's produced blocks and inode.
/// Runs in its own transactions (chunked to respect the journal size);
/// the members sit on the orphan list, so an interrupted reclaim is
/// finished by the next mount.
///
/// A block still consumed by a version outside the dying tree (one that
/// was version-deleted out of it earlier) is not freed; its ownership
/// transfers to that consumer instead.
pub fn reclaim_tree(fs: &mut Fs, ctx: &mut Context, root: u32) -> Result<()>
{
    let members = vtree::tree_members(fs, ctx, root)?;
    let dying: HashSet<u32> = members.iter().copied().collect();
    ctx.logger.log(1, &format!("reclaiming version tree of {} ({} versions)", root, members.len()));

    for chunk in members.chunks(8) {
        let mut handle = journal::start(fs)?;
        let res = (|| -> Result<()> {
            for member in chunk {
                free_or_transfer_blocks(&mut handle, *member, &dying, fs, ctx)?;
                orphan_del(&mut handle, *member, fs, ctx)?;
                inode::free_inode(&mut handle, *member, fs, ctx)?;
                fs.dcache.remove_ino(*member);
            }

            Ok(())
        })();

        match res {
            Ok(()) => journal::stop(fs, ctx, handle)?,
            Err(e) => {
                journal::abort(fs, ctx, handle)?;
                return Err(e);
            }
        }
    }

    Ok(())
}


/// Frees a dying version's produced blocks, except those still consumed
/// outside `dying`; each such block is handed over to its first outside
/// consumer (the consumer's pointer gains the producer flag).
fn free_or_transfer_blocks(handle: &mut Handle, ino: u32, dying: &HashSet<u32>, fs: &mut Fs, ctx: &mut Context) -> Result<()>
{
    let node = inode::read_inode(fs, ctx, ino)?;

    for ptr in node.i_block {
        if ptr == 0 || !test_producer_flg(ptr) {
            continue;
        }
        let blocknr = clear_producer_flg(ptr);

        match outside_consumer(fs, ctx, blocknr, dying)? {
            Some((consumer, slot)) => {
                inode::update_inode(handle, consumer, fs, ctx, |i| {
                    i.i_block[slot] = inode::set_producer_flg(blocknr);
                })?;
            }
            None => super::alloc::free_block(handle, blocknr, fs)?,
        }
    }

    inode::update_inode(handle, ino, fs, ctx, |i| i.i_block = [0; inode::N_BLOCKS])?;

    Ok(())
}


/// Finds a consumer of `blocknr` outside the given set, if any.
fn outside_consumer(fs: &mut Fs, ctx: &mut Context, blocknr: u32, excluded: &HashSet<u32>) -> Result<Option<(u32, usize)>>
{
    for other in 1..=fs.sb.s_inodes_count {
        if excluded.contains(&other) || !fs.inode_map.check_bit(other as usize - 1) {
            continue;
        }
        let other_node = match inode::read_inode(fs, ctx, other) {
            Ok(n) => n,
            Err(FsError::BrokenLink) => continue,
            Err(e) => return Err(e),
        };
        let mode = IMode { 0: other_node.i_mode };
        if !mode.has_ifreg() {
            continue;
        }

        for (slot, ptr) in other_node.i_block.iter().enumerate() {
            if *ptr != 0 && !test_producer_flg(*ptr) && clear_producer_flg(*ptr) == blocknr {
                return Ok(Some((other, slot)));
            }
        }
    }

    Ok(None)
}


/// Whether any other version still consumes a block this version produced.
pub fn blocks_shared_from(fs: &mut Fs, ctx: &mut Context, ino: u32) -> Result<bool>
{
    let node = inode::read_inode(fs, ctx, ino)?;
    let produced: HashSet<u32> = node.i_block.iter()
        .filter(|p| **p != 0 && test_producer_flg(**p))
        .map(|p| clear_producer_flg(*p))
        .collect();
    if produced.is_empty() {
        return Ok(false);
    }

    for other in 1..=fs.sb.s_inodes_count {
        if other == ino || !fs.inode_map.check_bit(other as usize - 1) {
            continue;
        }
        let other_node = match inode::read_inode(fs, ctx, other) {
            Ok(n) => n,
            Err(FsError::BrokenLink) => continue,
            Err(e) => return Err(e),
        };
        let mode = IMode { 0: other_node.i_mode };
        if !mode.has_ifreg() {
            continue;
        }

        for ptr in other_node.i_block {
            if ptr != 0 && !test_producer_flg(ptr) && produced.contains(&clear_producer_flg(ptr)) {
                return Ok(true);
            }
        }
    }

    Ok(false)
}


/// Frees one orphaned version once nothing needs it any more: no name of
/// its own, no open file, and no other version still consuming a block it
/// produced. A link count of one is just the tree-membership reference.
///
/// A phantom that still sits in a tree is detached first, so its
/// neighbors keep a well-formed tree; a lone inode whose tree count is
/// non-zero is still named and stays.
pub fn reclaim_if_released(fs: &mut Fs, ctx: &mut Context, ino: u32) -> Result<()>
{
    let node = match inode::read_inode(fs, ctx, ino) {
        Ok(node) => node,
        Err(FsError::BrokenLink) => return Ok(()),
        Err(e) => return Err(e),
    };

    let flags = IFlags { 0: node.i_flags };
    if !flags.has_orphan() || node.i_links_count > 1 {
        return Ok(());
    }
    if fs.files.count_open(ino) > 0 {
        return Ok(());
    }

    let in_tree = node.i_parent_ino != 0 || node.i_child_ino != 0
        || node.i_sibling_next_ino != ino;
    if !in_tree && node.i_vtree_nlink != 0 {
        return Ok(());
    }
    if blocks_shared_from(fs, ctx, ino)? {
        return Ok(());
    }

    let mut handle = journal::start(fs)?;
    let res = (|| -> Result<()> {
        if in_tree {
            vtree::drop_child_parent_handles(fs, ctx, ino)?;
            vtree::detach_version(&mut handle, ino, fs, ctx)?;
        }
        inode::free_inode_blocks(&mut handle, ino, fs, ctx)?;
        orphan_del(&mut handle, ino, fs, ctx)?;
        inode::free_inode(&mut handle, ino, fs, ctx)?;

        Ok(())
    })();

    match res {
        Ok(()) => journal::stop(fs, ctx, handle)?,
        Err(e) => {
            journal::abort(fs, ctx, handle)?;
            return Err(e);
        }
    }

    fs.dcache.remove_ino(ino);

    Ok(())
}


/// Mount-time pass over the orphan list: finishes the reclamation of any
/// tree that lost its last name, frees released loners, and leaves true
/// phantoms in place.
pub fn recover_orphans(fs: &mut Fs, ctx: &mut Context) -> Result<()>
{
    let list = orphan_list(fs, ctx)?;
    if list.is_empty() {
        return Ok(());
    }

    ctx.logger.log(1, &format!("processing {} orphaned inode(s)", list.len()));

    for ino in list {
        let node = match inode::read_inode(fs, ctx, ino) {
            Ok(node) => node,
            // A previous chunk of this pass already freed it.
            Err(FsError::BrokenLink) => continue,
            Err(e) => return Err(e),
        };

        if node.i_parent_ino != 0 || node.i_child_ino != 0 || node.i_sibling_next_ino != ino {
            let root = vtree::trace_root(fs, ctx, ino)?;
            let root_node = inode::read_inode(fs, ctx, root)?;
            if root_node.i_vtree_nlink == 0 {
                reclaim_tree(fs, ctx, root)?;
            } else {
                // The tree is alive; this phantom may still have become
                // individually releasable.
                reclaim_if_released(fs, ctx, ino)?;
            }
        } else if node.i_vtree_nlink == 0 {
            reclaim_if_released(fs, ctx, ino)?;
        }
    }

    Ok(())
}
