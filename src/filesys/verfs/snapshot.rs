use std::time::{SystemTime, UNIX_EPOCH};

use crate::hash::version_name_hash;
use crate::Context;
use super::{Fs, FsError, Result};
use super::buffer;
use super::inode::{self, Inode, IMode, IFlags, clear_producer_flg};
use super::journal::{self, Handle};
use super::vtree;


/// Freezes the current contents of `target_ino` as a new immutable
/// version.
///
/// The new inode clones the target's metadata and block pointers and takes
/// the target's place in the version tree; the target stays the writable
/// version underneath it, with every cached page armed for copy-on-write
/// and every block pointer demoted to a consumer reference.
///
/// Runs as one transaction; an allocator failure is retried once.
pub fn create_snapshot(dir_ino: u32, target_ino: u32, name: &str, fs: &mut Fs, ctx: &mut Context) -> Result<u32>
{
    let mut retried = false;
    loop {
        let mut handle = journal::start(fs)?;
        match do_create_snapshot(&mut handle, dir_ino, target_ino, name, fs, ctx) {
            Ok(new_ino) => {
                journal::stop(fs, ctx, handle)?;

                // The opened file now sees the fresh version as its parent.
                let old = match fs.icache.get_mut(target_ino) {
                    Some(entry) => entry.parent_handle.replace(new_ino),
                    None => None,
                };
                if let Some(old_ino) = old {
                    inode::iput(fs, old_ino);
                }
                inode::igrab(fs, new_ino);

                ctx.logger.log(2, &format!(
                    "snapshot: version {} frozen as {}", target_ino, new_ino,
                ));
                return Ok(new_ino);
            }
            Err(FsError::NoSpace) if !retried => {
                journal::abort(fs, ctx, handle)?;
                retried = true;
            }
            Err(e) => {
                journal::abort(fs, ctx, handle)?;
                return Err(e);
            }
        }
    }
}


fn do_create_snapshot(handle: &mut Handle, dir_ino: u32, target_ino: u32, name: &str, fs: &mut Fs, ctx: &mut Context) -> Result<u32>
{
    let target = inode::read_inode(fs, ctx, target_ino)?;
    let mode = IMode { 0: target.i_mode };
    if !mode.has_ifreg() {
        return Err(FsError::NotPermitted("only regular files have versions"));
    }

    let new_ino = inode::new_inode(handle, target.i_mode, fs, ctx)?;

    inode::update_inode(handle, new_ino, fs, ctx, |i| {
        copy_inode_info(i, &target);
        i.i_links_count = 1;
    })?;

    vtree::add_version_to_tree(handle, new_ino, target_ino, fs, ctx)?;

    // Arm copy-on-write: cached pages of the target must not be written
    // in place any more, and its pointers turn into consumer references.
    buffer::share_cached_pages(fs, ctx, target_ino)?;
    clear_producer_flgs(handle, target_ino, fs, ctx)?;

    inode::mark_inode_dirty(handle, target_ino, fs, ctx)?;
    inode::mark_inode_dirty(handle, new_ino, fs, ctx)?;

    let new = inode::read_inode(fs, ctx, new_ino)?;
    fs.dcache.insert(dir_ino, version_name_hash(name, new.i_generation, new_ino), new_ino);

    Ok(new_ino)
}


/// Clones the target's metadata into a fresh version inode.
/// Block pointers keep their producer flags: the clone owns whatever the
/// target owned. Orphan-state flags stay behind.
fn copy_inode_info(dst: &mut Inode, src: &Inode)
{
    let (vtime_sec, vtime_nsec) = now_parts();

    dst.i_mode = src.i_mode;
    dst.i_flags = src.i_flags & !(IFlags::PHANTOM | IFlags::ORPHAN);
    dst.i_size = src.i_size;
    dst.i_atime = src.i_atime;
    dst.i_ctime = src.i_ctime;
    dst.i_mtime = src.i_mtime;
    dst.i_block = src.i_block;
    dst.i_vtree_nlink = src.i_vtree_nlink;
    dst.i_vtime_sec = vtime_sec;
    dst.i_vtime_nsec = vtime_nsec;
}


/// Demotes every block pointer of a version to a consumer reference.
fn clear_producer_flgs(handle: &mut Handle, ino: u32, fs: &mut Fs, ctx: &mut Context) -> Result<()>
{
    inode::update_inode(handle, ino, fs, ctx, |i| {
        for ptr in i.i_block.iter_mut() {
            *ptr = clear_producer_flg(*ptr);
        }
    })
}


fn now_parts() -> (u32, u32)
{
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as u32, d.subsec_nanos()),
        Err(_) => (0, 0),
    }
}
