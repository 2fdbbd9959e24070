use serde::Serialize;

use crate::Context;
use super::{Fs, FsError, Result};
use super::inode;
use super::sibling;


// Entry types for reading a versioned file as a directory.
pub const DT_PARENT: u8 = 0o20;
pub const DT_CHILD: u8 = 0o40;
/// Or'd in when the entry is the root of its version tree.
pub const DT_VROOT: u8 = 0o100;


/// A pseudo directory entry describing one neighbor in the version tree.
/// Names are empty; clients open the inode number through a
/// version-search open.
#[derive(Clone, Debug, Serialize)]
pub struct VersionEntry {
    pub d_ino: u32,
    pub d_type: u8,
    pub name: String,
}


/// Emits the next entry of the version listing and advances the cursor.
///
/// The cursor starts at 0: the first call emits the parent version (if
/// any), after which the cursor walks the child sibling ring until it
/// comes back around.
pub fn read_version_entry(fs: &mut Fs, ctx: &mut Context, ino: u32, cursor: &mut u32) -> Result<Option<VersionEntry>>
{
    let node = inode::read_inode(fs, ctx, ino)?;

    if *cursor == 0 {
        *cursor = if node.i_child_ino != 0 { node.i_child_ino } else { u32::MAX };

        if node.i_parent_ino != 0 {
            let parent = inode::read_inode_checked(fs, ctx, node.i_parent_ino, node.i_parent_generation)?;
            let mut d_type = DT_PARENT;
            if parent.i_parent_ino == 0 {
                d_type |= DT_VROOT;
            }

            return Ok(Some(VersionEntry {
                d_ino: node.i_parent_ino,
                d_type,
                name: String::new(),
            }));
        }
    }

    if *cursor == u32::MAX {
        return Ok(None);
    }
    if node.i_child_ino == 0 {
        // The tree changed underneath a stale cursor.
        *cursor = u32::MAX;
        return Ok(None);
    }

    // The cursor is only an inode number; re-resolve it through the
    // generation-checked ring walk rather than trusting a raw index that
    // a reclaimed-and-reallocated inode could satisfy.
    let pos = *cursor;
    inode::read_inode_checked(fs, ctx, node.i_child_ino, node.i_child_generation)?;
    let ring = sibling::walk(fs, ctx, node.i_child_ino)?;
    let at = match ring.iter().position(|m| *m == pos) {
        Some(at) => at,
        None => return Err(FsError::NotFound),
    };

    *cursor = if at + 1 == ring.len() { u32::MAX } else { ring[at + 1] };

    Ok(Some(VersionEntry {
        d_ino: pos,
        d_type: DT_CHILD,
        name: String::new(),
    }))
}


/// Drains the whole version listing of a file.
pub fn read_version_dir(fs: &mut Fs, ctx: &mut Context, ino: u32) -> Result<Vec<VersionEntry>>
{
    let mut entries = Vec::new();
    let mut cursor = 0;
    let limit = fs.sb.s_inodes_count as usize + 2;

    while let Some(entry) = read_version_entry(fs, ctx, ino, &mut cursor)? {
        entries.push(entry);
        if entries.len() > limit {
            break;
        }
    }

    Ok(entries)
}


/// Verifies the listing against the raw sibling ring.
pub fn child_count(fs: &mut Fs, ctx: &mut Context, ino: u32) -> Result<usize>
{
    let node = inode::read_inode(fs, ctx, ino)?;
    if node.i_child_ino == 0 {
        return Ok(0);
    }

    Ok(sibling::walk(fs, ctx, node.i_child_ino)?.len())
}
