use std::collections::{HashMap, HashSet};

use crate::rec_len_align;
use crate::hash::version_name_hash;
use crate::Context;
use super::{Fs, FsError, Result, BLOCK_SIZE, ROOT_INO, now_secs};
use super::inode::{self, IMode};
use super::journal::{self, Handle};
use super::orphan;
use super::sibling;
use super::vtree;


pub const NAME_MAX: usize = 255;
pub const DIRENT_BASE: usize = 8;

/// Directory entry file types.
pub const FT_REG: u8 = 1;
pub const FT_DIR: u8 = 2;


/// The in-memory dentry cache: (directory, versioned name hash) → inode.
/// Distinct versions of one name occupy distinct slots because the hash
/// mixes in the target's generation and inode number.
#[derive(Debug)]
pub struct DentryCache(HashMap<(u32, u32), u32>);

impl DentryCache {
    pub fn new() -> Self
    {
        Self { 0: HashMap::new() }
    }

    pub fn lookup(&self, dir_ino: u32, hash: u32) -> Option<u32>
    {
        self.0.get(&(dir_ino, hash)).copied()
    }

    pub fn insert(&mut self, dir_ino: u32, hash: u32, ino: u32)
    {
        self.0.insert((dir_ino, hash), ino);
    }

    pub fn remove_ino(&mut self, ino: u32)
    {
        self.0.retain(|_, v| *v != ino);
    }

    pub fn clear(&mut self)
    {
        self.0.clear();
    }
}


// Directory entries are ext2-style linear records: inode (4), rec_len (2),
// name_len (1), file_type (1), then the name. Records are 4-byte aligned
// and cover their block completely.

fn get_dirent(block: &[u8], off: usize) -> (u32, usize, usize, u8)
{
    let ino = u32::from_le_bytes([block[off], block[off + 1], block[off + 2], block[off + 3]]);
    let rec_len = u16::from_le_bytes([block[off + 4], block[off + 5]]) as usize;
    let name_len = block[off + 6] as usize;
    let file_type = block[off + 7];

    (ino, rec_len, name_len, file_type)
}

fn put_dirent(block: &mut [u8], off: usize, ino: u32, rec_len: usize, name: &str, file_type: u8)
{
    block[off..off + 4].copy_from_slice(&ino.to_le_bytes());
    block[off + 4..off + 6].copy_from_slice(&(rec_len as u16).to_le_bytes());
    block[off + 6] = name.len() as u8;
    block[off + 7] = file_type;
    block[off + 8..off + 8 + name.len()].copy_from_slice(name.as_bytes());
}

fn dirent_name(block: &[u8], off: usize, name_len: usize) -> String
{
    String::from_utf8_lossy(&block[off + 8..off + 8 + name_len]).into_owned()
}


/// Builds a directory block holding "." and "..".
pub(crate) fn build_empty_dir_block(ino: u32, parent_ino: u32) -> Vec<u8>
{
    let mut block = vec![u8::default(); BLOCK_SIZE as usize];
    let first = rec_len_align!(DIRENT_BASE + 1);

    put_dirent(&mut block, 0, ino, first, ".", FT_DIR);
    put_dirent(&mut block, first, parent_ino, BLOCK_SIZE as usize - first, "..", FT_DIR);

    block
}


fn check_name(name: &str) -> Result<()>
{
    if name.is_empty() || name.len() > NAME_MAX || name.contains('/') {
        return Err(FsError::BadName);
    }
    if name == "." || name == ".." {
        return Err(FsError::BadName);
    }

    Ok(())
}


/// Reads one directory block as the open transaction (if any) sees it.
fn dir_read_block(ctx: &mut Context, handle: Option<&Handle>, blocknr: u32) -> Result<Vec<u8>>
{
    match handle {
        Some(handle) => journal::read_staged(ctx, handle, blocknr),
        None => super::read_block(ctx, blocknr),
    }
}


/// Searches a directory for `name`.
pub fn find_entry(fs: &mut Fs, ctx: &mut Context, handle: Option<&Handle>, dir_ino: u32, name: &str) -> Result<Option<u32>>
{
    let dir = inode::read_inode(fs, ctx, dir_ino)?;
    let nblocks = (dir.i_size as u64 + BLOCK_SIZE - 1) / BLOCK_SIZE;

    for lblock in 0..nblocks {
        let blocknr = match inode::map_block(fs, ctx, dir_ino, lblock as u32)? {
            Some(b) => b,
            None => continue,
        };
        let block = dir_read_block(ctx, handle, blocknr)?;

        let mut off = 0;
        while off + DIRENT_BASE <= BLOCK_SIZE as usize {
            let (ino, rec_len, name_len, _) = get_dirent(&block, off);
            if rec_len == 0 {
                return Err(FsError::Corrupt(format!("zero-length entry in directory {}", dir_ino)));
            }
            if ino != 0 && name_len == name.len()
                && dirent_name(&block, off, name_len) == name
            {
                return Ok(Some(ino));
            }
            off += rec_len;
        }
    }

    Ok(None)
}


/// Lists a directory: (name, inode, file type).
pub fn dir_entries(fs: &mut Fs, ctx: &mut Context, dir_ino: u32) -> Result<Vec<(String, u32, u8)>>
{
    let dir = inode::read_inode(fs, ctx, dir_ino)?;
    let mode = IMode { 0: dir.i_mode };
    if !mode.has_ifdir() {
        return Err(FsError::NotPermitted("not a directory"));
    }
    let nblocks = (dir.i_size as u64 + BLOCK_SIZE - 1) / BLOCK_SIZE;
    let mut entries = Vec::new();

    for lblock in 0..nblocks {
        let blocknr = match inode::map_block(fs, ctx, dir_ino, lblock as u32)? {
            Some(b) => b,
            None => continue,
        };
        let block = super::read_block(ctx, blocknr)?;

        let mut off = 0;
        while off + DIRENT_BASE <= BLOCK_SIZE as usize {
            let (ino, rec_len, name_len, file_type) = get_dirent(&block, off);
            if rec_len == 0 {
                return Err(FsError::Corrupt(format!("zero-length entry in directory {}", dir_ino)));
            }
            if ino != 0 {
                entries.push((dirent_name(&block, off, name_len), ino, file_type));
            }
            off += rec_len;
        }
    }

    Ok(entries)
}


/// Adds a name to a directory, growing it by one block when no record has
/// enough slack.
fn add_entry(handle: &mut Handle, dir_ino: u32, name: &str, ino: u32, file_type: u8, fs: &mut Fs, ctx: &mut Context) -> Result<()>
{
    check_name(name)?;
    let needed = rec_len_align!(DIRENT_BASE + name.len());

    let dir = inode::read_inode(fs, ctx, dir_ino)?;
    let nblocks = (dir.i_size as u64 + BLOCK_SIZE - 1) / BLOCK_SIZE;

    for lblock in 0..nblocks {
        let blocknr = match inode::map_block(fs, ctx, dir_ino, lblock as u32)? {
            Some(b) => b,
            None => continue,
        };
        let mut block = dir_read_block(ctx, Some(handle), blocknr)?;

        let mut off = 0;
        while off + DIRENT_BASE <= BLOCK_SIZE as usize {
            let (e_ino, rec_len, name_len, _) = get_dirent(&block, off);
            if rec_len == 0 {
                return Err(FsError::Corrupt(format!("zero-length entry in directory {}", dir_ino)));
            }

            if e_ino == 0 && rec_len >= needed {
                put_dirent(&mut block, off, ino, rec_len, name, file_type);
                handle.stage(blocknr, block);
                return Ok(());
            }

            let used = rec_len_align!(DIRENT_BASE + name_len);
            if e_ino != 0 && rec_len >= used + needed {
                let (e_ino, _, _, e_type) = get_dirent(&block, off);
                let e_name = dirent_name(&block, off, name_len);
                put_dirent(&mut block, off, e_ino, used, &e_name, e_type);
                put_dirent(&mut block, off + used, ino, rec_len - used, name, file_type);
                handle.stage(blocknr, block);
                return Ok(());
            }

            off += rec_len;
        }
    }

    // No slack anywhere: append a directory block.

    let (blocknr, _) = inode::get_block(handle, dir_ino, nblocks as u32, fs, ctx)?;
    let mut block = vec![u8::default(); BLOCK_SIZE as usize];
    put_dirent(&mut block, 0, ino, BLOCK_SIZE as usize, name, file_type);
    handle.stage(blocknr, block);

    inode::update_inode(handle, dir_ino, fs, ctx, |i| {
        i.i_size += BLOCK_SIZE as u32;
    })?;

    Ok(())
}


/// Removes a name from a directory. Returns the inode it named.
pub(crate) fn delete_entry(handle: &mut Handle, dir_ino: u32, name: &str, fs: &mut Fs, ctx: &mut Context) -> Result<u32>
{
    let dir = inode::read_inode(fs, ctx, dir_ino)?;
    let nblocks = (dir.i_size as u64 + BLOCK_SIZE - 1) / BLOCK_SIZE;

    for lblock in 0..nblocks {
        let blocknr = match inode::map_block(fs, ctx, dir_ino, lblock as u32)? {
            Some(b) => b,
            None => continue,
        };
        let mut block = dir_read_block(ctx, Some(handle), blocknr)?;

        let mut off = 0;
        let mut prev_off: Option<usize> = None;
        while off + DIRENT_BASE <= BLOCK_SIZE as usize {
            let (e_ino, rec_len, name_len, _) = get_dirent(&block, off);
            if rec_len == 0 {
                return Err(FsError::Corrupt(format!("zero-length entry in directory {}", dir_ino)));
            }

            if e_ino != 0 && name_len == name.len()
                && dirent_name(&block, off, name_len) == name
            {
                match prev_off {
                    Some(prev) => {
                        // Fold the record into its predecessor.
                        let (p_ino, p_rec_len, p_name_len, p_type) = get_dirent(&block, prev);
                        let p_name = dirent_name(&block, prev, p_name_len);
                        put_dirent(&mut block, prev, p_ino, p_rec_len + rec_len, &p_name, p_type);
                    }
                    None => {
                        // First record of the block: just drop the inode.
                        let e_name = dirent_name(&block, off, name_len);
                        put_dirent(&mut block, off, 0, rec_len, &e_name, 0);
                    }
                }
                handle.stage(blocknr, block);
                return Ok(e_ino);
            }

            prev_off = Some(off);
            off += rec_len;
        }
    }

    Err(FsError::NotFound)
}


/// Resolves the parent directory of a path. Returns it and the final
/// component.
pub fn resolve_parent(fs: &mut Fs, ctx: &mut Context, path: &str) -> Result<(u32, String)>
{
    let mut components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    let last = match components.pop() {
        Some(last) => last.to_string(),
        None => return Err(FsError::BadName),
    };

    let mut dir_ino = ROOT_INO;
    for comp in components {
        if comp.len() > NAME_MAX {
            return Err(FsError::BadName);
        }
        let next = match find_entry(fs, ctx, None, dir_ino, comp)? {
            Some(ino) => ino,
            None => return Err(FsError::NotFound),
        };
        let node = inode::read_inode(fs, ctx, next)?;
        let mode = IMode { 0: node.i_mode };
        if !mode.has_ifdir() {
            return Err(FsError::NotFound);
        }
        dir_ino = next;
    }

    Ok((dir_ino, last))
}


/// Resolves a full path to an inode.
pub fn resolve_path(fs: &mut Fs, ctx: &mut Context, path: &str) -> Result<u32>
{
    if path.split('/').all(|c| c.is_empty()) {
        return Ok(ROOT_INO);
    }

    let (dir_ino, name) = resolve_parent(fs, ctx, path)?;
    match find_entry(fs, ctx, None, dir_ino, &name)? {
        Some(ino) => Ok(ino),
        None => Err(FsError::NotFound),
    }
}


/// Creates an empty regular file: a version tree of one self-linked root.
pub fn create(fs: &mut Fs, ctx: &mut Context, path: &str) -> Result<u32>
{
    let (dir_ino, name) = resolve_parent(fs, ctx, path)?;
    check_name(&name)?;
    if find_entry(fs, ctx, None, dir_ino, &name)?.is_some() {
        return Err(FsError::Exists);
    }

    let mut retried = false;
    loop {
        let mut handle = journal::start(fs)?;
        match do_create(&mut handle, dir_ino, &name, fs, ctx) {
            Ok(ino) => {
                journal::stop(fs, ctx, handle)?;
                return Ok(ino);
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

fn do_create(handle: &mut Handle, dir_ino: u32, name: &str, fs: &mut Fs, ctx: &mut Context) -> Result<u32>
{
    let ino = inode::new_inode(handle, IMode::IFREG | 0o644, fs, ctx)?;
    let now = now_secs();

    // One link for the name, one for the version-tree membership.
    inode::update_inode(handle, ino, fs, ctx, |i| {
        i.i_links_count = 2;
        i.i_vtree_nlink = 1;
        i.i_vtime_sec = now;
    })?;
    sibling::link_self(handle, ino, fs, ctx)?;

    add_entry(handle, dir_ino, name, ino, FT_REG, fs, ctx)?;
    inode::update_inode(handle, dir_ino, fs, ctx, |i| {
        i.i_mtime = now;
        i.i_ctime = now;
    })?;

    let node = inode::read_inode(fs, ctx, ino)?;
    fs.dcache.insert(dir_ino, version_name_hash(name, node.i_generation, ino), ino);

    Ok(ino)
}


/// Creates a directory.
pub fn mkdir(fs: &mut Fs, ctx: &mut Context, path: &str) -> Result<u32>
{
    let (dir_ino, name) = resolve_parent(fs, ctx, path)?;
    check_name(&name)?;
    if find_entry(fs, ctx, None, dir_ino, &name)?.is_some() {
        return Err(FsError::Exists);
    }

    let mut retried = false;
    loop {
        let mut handle = journal::start(fs)?;
        match do_mkdir(&mut handle, dir_ino, &name, fs, ctx) {
            Ok(ino) => {
                journal::stop(fs, ctx, handle)?;
                return Ok(ino);
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

fn do_mkdir(handle: &mut Handle, dir_ino: u32, name: &str, fs: &mut Fs, ctx: &mut Context) -> Result<u32>
{
    let ino = inode::new_inode(handle, IMode::IFDIR | 0o755, fs, ctx)?;
    let now = now_secs();

    let (blocknr, _) = inode::get_block(handle, ino, 0, fs, ctx)?;
    handle.stage(blocknr, build_empty_dir_block(ino, dir_ino));

    inode::update_inode(handle, ino, fs, ctx, |i| {
        i.i_links_count = 2;
        i.i_size = BLOCK_SIZE as u32;
    })?;

    add_entry(handle, dir_ino, name, ino, FT_DIR, fs, ctx)?;
    inode::update_inode(handle, dir_ino, fs, ctx, |i| {
        i.i_links_count += 1;
        i.i_mtime = now;
        i.i_ctime = now;
    })?;

    Ok(ino)
}


/// Hard-links a file (or, through `vsearch`, one specific version of it)
/// under a new name. The new name goes into the dentry cache under its
/// versioned hash, and the link pins the whole tree through the root's
/// tree-wide count.
pub fn link(fs: &mut Fs, ctx: &mut Context, oldpath: &str, newpath: &str, vsearch: Option<u32>) -> Result<()>
{
    let ino = match vsearch {
        Some(vino) => vino,
        None => resolve_path(fs, ctx, oldpath)?,
    };
    let node = inode::read_inode(fs, ctx, ino).map_err(|e| match e {
        FsError::BrokenLink => FsError::NotFound,
        e => e,
    })?;
    let mode = IMode { 0: node.i_mode };
    if !mode.has_ifreg() {
        return Err(FsError::NotPermitted("only regular files can be linked"));
    }
    if node.i_links_count == 0 {
        // Raced with an unlink; a fresh link would corrupt the orphan list.
        return Err(FsError::NotFound);
    }

    let (new_dir, new_name) = resolve_parent(fs, ctx, newpath)?;
    check_name(&new_name)?;
    if find_entry(fs, ctx, None, new_dir, &new_name)?.is_some() {
        return Err(FsError::Exists);
    }

    let mut retried = false;
    loop {
        let mut handle = journal::start(fs)?;
        match do_link(&mut handle, ino, new_dir, &new_name, fs, ctx) {
            Ok(()) => {
                journal::stop(fs, ctx, handle)?;
                return Ok(());
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

fn do_link(handle: &mut Handle, ino: u32, new_dir: u32, new_name: &str, fs: &mut Fs, ctx: &mut Context) -> Result<()>
{
    let now = now_secs();

    add_entry(handle, new_dir, new_name, ino, FT_REG, fs, ctx)?;
    inode::update_inode(handle, ino, fs, ctx, |i| {
        i.i_links_count += 1;
        i.i_ctime = now;
    })?;
    inode::update_inode(handle, new_dir, fs, ctx, |i| {
        i.i_mtime = now;
        i.i_ctime = now;
    })?;

    let root = vtree::trace_root(fs, ctx, ino)?;
    vtree::inc_vtree_nlink(handle, root, fs, ctx)?;

    let node = inode::read_inode(fs, ctx, ino)?;
    fs.dcache.insert(new_dir, version_name_hash(new_name, node.i_generation, ino), ino);

    Ok(())
}


/// Removes a name. When the last name into a version tree goes away the
/// tree is reclaimed (deferred while any of its versions is open); a
/// version that loses its last name but stays reachable through the tree
/// becomes a phantom on the orphan list.
pub fn unlink(fs: &mut Fs, ctx: &mut Context, path: &str) -> Result<()>
{
    let (dir_ino, name) = resolve_parent(fs, ctx, path)?;
    let ino = match find_entry(fs, ctx, None, dir_ino, &name)? {
        Some(ino) => ino,
        None => return Err(FsError::NotFound),
    };
    let node = inode::read_inode(fs, ctx, ino)?;
    let mode = IMode { 0: node.i_mode };
    if mode.has_ifdir() {
        return Err(FsError::NotPermitted("cannot unlink a directory"));
    }

    let mut reclaim_root = None;

    let mut handle = journal::start(fs)?;
    let res = (|| -> Result<()> {
        let now = now_secs();

        delete_entry(&mut handle, dir_ino, &name, fs, ctx)?;
        inode::update_inode(&mut handle, dir_ino, fs, ctx, |i| {
            i.i_mtime = now;
            i.i_ctime = now;
        })?;
        inode::update_inode(&mut handle, ino, fs, ctx, |i| {
            i.i_links_count = i.i_links_count.saturating_sub(1);
            i.i_ctime = now;
        })?;

        let root = vtree::trace_root(fs, ctx, ino)?;
        let remaining = vtree::drop_vtree_nlink(&mut handle, root, fs, ctx)?;

        if remaining == 0 {
            // No name reaches any version of this tree any more.
            orphan::mark_tree_orphan(&mut handle, root, fs, ctx)?;
            reclaim_root = Some(root);
        } else {
            let node = inode::read_inode(fs, ctx, ino)?;
            if node.i_links_count <= 1 {
                // Only the tree-membership reference remains: the version
                // lost its last name but other versions still pin the tree.
                orphan::orphan_add(&mut handle, ino, fs, ctx)?;
                inode::update_inode(&mut handle, ino, fs, ctx, |i| {
                    i.i_flags |= inode::IFlags::PHANTOM;
                })?;
            }
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

    fs.dcache.remove_ino(ino);

    if let Some(root) = reclaim_root {
        if !files_open_in_tree(fs, ctx, root)? {
            orphan::reclaim_tree(fs, ctx, root)?;
        }
    }

    Ok(())
}


/// Whether any version of the tree is held open.
pub fn files_open_in_tree(fs: &mut Fs, ctx: &mut Context, root: u32) -> Result<bool>
{
    let members = vtree::tree_members(fs, ctx, root)?;

    Ok(members.iter().any(|m| fs.files.count_open(*m) > 0))
}


/// Counts the directory entries that resolve into the given set of inodes.
pub fn count_links_into(fs: &mut Fs, ctx: &mut Context, members: &[u32]) -> Result<u32>
{
    let set: HashSet<u32> = members.iter().copied().collect();
    let mut count = 0;

    for ino in 1..=fs.sb.s_inodes_count {
        if !fs.inode_map.check_bit(ino as usize - 1) {
            continue;
        }
        let node = match inode::read_inode(fs, ctx, ino) {
            Ok(node) => node,
            Err(FsError::BrokenLink) => continue,
            Err(e) => return Err(e),
        };
        let mode = IMode { 0: node.i_mode };
        if !mode.has_ifdir() {
            continue;
        }

        for (name, entry_ino, _) in dir_entries(fs, ctx, ino)? {
            if name == "." || name == ".." {
                continue;
            }
            if set.contains(&entry_ino) {
                count += 1;
            }
        }
    }

    Ok(count)
}


#[cfg(test)]
mod tests {
    use super::*;

    mod dirent_block {
        use super::*;

        #[test]
        fn empty_dir_block_has_dot_and_dotdot()
        {
            let block = build_empty_dir_block(2, 2);

            let (ino, rec_len, name_len, file_type) = get_dirent(&block, 0);
            assert_eq!(2, ino);
            assert_eq!(12, rec_len);
            assert_eq!(1, name_len);
            assert_eq!(FT_DIR, file_type);
            assert_eq!(".", dirent_name(&block, 0, name_len));

            let (ino, rec_len, name_len, _) = get_dirent(&block, 12);
            assert_eq!(2, ino);
            assert_eq!(BLOCK_SIZE as usize - 12, rec_len);
            assert_eq!("..", dirent_name(&block, 12, name_len));
        }

        #[test]
        fn records_cover_the_block()
        {
            let block = build_empty_dir_block(2, 2);

            let mut off = 0;
            let mut total = 0;
            while off + DIRENT_BASE <= BLOCK_SIZE as usize {
                let (_, rec_len, _, _) = get_dirent(&block, off);
                total += rec_len;
                off += rec_len;
            }

            assert_eq!(BLOCK_SIZE as usize, total);
        }
    }

    mod names {
        use super::*;

        #[test]
        fn bad_names_are_rejected()
        {
            assert!(matches!(check_name(""), Err(FsError::BadName)));
            assert!(matches!(check_name("."), Err(FsError::BadName)));
            assert!(matches!(check_name(".."), Err(FsError::BadName)));
            assert!(matches!(check_name("a/b"), Err(FsError::BadName)));
            assert!(matches!(check_name(&"x".repeat(256)), Err(FsError::BadName)));
        }

        #[test]
        fn ordinary_names_pass()
        {
            assert!(check_name("x").is_ok());
            assert!(check_name(&"x".repeat(255)).is_ok());
        }
    }
}
