use std::collections::HashMap;

use crate::hash::version_name_hash;
use crate::Context;
use super::{Fs, FsError, Result, BLOCK_SIZE, PAGE_SIZE, now_secs};
use super::buffer;
use super::inode::{self, IMode, IFlags};
use super::journal;
use super::namei;
use super::orphan;
use super::snapshot;
use super::vtree;


// Open-intent flags. When O_VSEARCH is set, the create-mode field of the
// open intent is repurposed as a version inode number.
pub const O_ACCMODE: u32 = 0o3;
pub const O_WRONLY: u32 = 0o1;
pub const O_RDWR: u32 = 0o2;
pub const O_VERSION: u32 = 0o20000000;
pub const O_PARENT: u32 = 0o40000000;
pub const O_VSEARCH: u32 = 0o200000000;


/// Decoded open intent.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenIntent {
    pub write: bool,
    /// Snapshot the current contents before writing.
    pub version: bool,
    /// Open the parent version of the named file.
    pub parent: bool,
    /// Open this specific version instead of the named one.
    pub vsearch: Option<u32>,
}

impl OpenIntent {
    pub fn from_flags(flags: u32, create_mode: u32) -> Self
    {
        Self {
            write: flags & O_ACCMODE != 0,
            version: flags & O_VERSION != 0,
            parent: flags & O_PARENT != 0,
            vsearch: if flags & O_VSEARCH != 0 { Some(create_mode) } else { None },
        }
    }
}


/// An open file description.
#[derive(Clone, Debug)]
pub struct OpenFile {
    pub ino: u32,
    pub write: bool,
    /// Where the name was resolved; used by the version-delete operation.
    pub dir_ino: u32,
    pub name: String,
}


/// The open file table.
#[derive(Debug)]
pub struct OpenFiles {
    map: HashMap<u32, OpenFile>,
    next_fd: u32,
}

impl OpenFiles {
    pub fn new() -> Self
    {
        Self {
            map: HashMap::new(),
            next_fd: 3,
        }
    }

    pub fn insert(&mut self, file: OpenFile) -> u32
    {
        let fd = self.next_fd;
        self.next_fd += 1;
        self.map.insert(fd, file);

        fd
    }

    pub fn get(&self, fd: u32) -> Option<&OpenFile>
    {
        self.map.get(&fd)
    }

    pub fn remove(&mut self, fd: u32) -> Option<OpenFile>
    {
        self.map.remove(&fd)
    }

    pub fn count_open(&self, ino: u32) -> usize
    {
        self.map.values().filter(|f| f.ino == ino).count()
    }
}


/// Opens a path with a version intent; the open-path state machine.
///
/// `O_VSEARCH` substitutes the requested version for the named inode,
/// `O_PARENT` then steps to its parent; any write access to a version
/// that is snapshot-flagged, explicitly addressed, or already has a child
/// freezes the contents first. The chosen version lands in the dentry
/// cache under its versioned hash.
pub fn open_path(fs: &mut Fs, ctx: &mut Context, path: &str, intent: OpenIntent) -> Result<u32>
{
    let (dir_ino, name) = namei::resolve_parent(fs, ctx, path)?;
    let named_ino = match namei::find_entry(fs, ctx, None, dir_ino, &name)? {
        Some(ino) => ino,
        None => return Err(FsError::NotFound),
    };

    let node = inode::read_inode(fs, ctx, named_ino)?;
    let mode = IMode { 0: node.i_mode };
    if !mode.has_ifreg() {
        return Err(FsError::NotPermitted("not a regular file"));
    }

    let mut ino = named_ino;

    if let Some(search_ino) = intent.vsearch {
        let search = inode::read_inode(fs, ctx, search_ino).map_err(|e| match e {
            FsError::BrokenLink => FsError::NotFound,
            e => e,
        })?;
        let mode = IMode { 0: search.i_mode };
        if !mode.has_ifreg() {
            return Err(FsError::NotFound);
        }
        ino = search_ino;
    }

    if intent.parent {
        let node = inode::read_inode(fs, ctx, ino)?;
        if node.i_parent_ino == 0 {
            return Err(FsError::NotFound);
        }
        inode::read_inode_checked(fs, ctx, node.i_parent_ino, node.i_parent_generation)?;
        ino = node.i_parent_ino;
    }

    let node = inode::read_inode(fs, ctx, ino)?;
    let addressed = intent.vsearch.is_some() || intent.parent;
    if intent.write && (intent.version || addressed || node.i_child_ino != 0) {
        snapshot::create_snapshot(dir_ino, ino, &name, fs, ctx)?;
    }

    // Resolve and pin the parent version for the write path.
    inode::get_parent_handle(fs, ctx, ino)?;

    let node = inode::read_inode(fs, ctx, ino)?;
    let hash = version_name_hash(&name, node.i_generation, ino);
    if fs.dcache.lookup(dir_ino, hash).is_none() {
        fs.dcache.insert(dir_ino, hash, ino);
    }

    inode::igrab(fs, ino);
    let fd = fs.files.insert(OpenFile {
        ino,
        write: intent.write,
        dir_ino,
        name,
    });

    Ok(fd)
}


/// Reads from an open file at `offset`.
pub fn file_read(fs: &mut Fs, ctx: &mut Context, fd: u32, offset: u64, len: usize) -> Result<Vec<u8>>
{
    let ino = match fs.files.get(fd) {
        Some(of) => of.ino,
        None => return Err(FsError::NotFound),
    };

    let node = inode::read_inode(fs, ctx, ino)?;
    let size = node.i_size as u64;
    if offset >= size {
        return Ok(Vec::new());
    }
    let len = len.min((size - offset) as usize);

    let mut out = Vec::with_capacity(len);
    let mut pos = offset;

    while out.len() < len {
        let index = (pos / PAGE_SIZE) as u32;
        let start = (pos % PAGE_SIZE) as usize;
        let n = (PAGE_SIZE as usize - start).min(len - out.len());

        buffer::load_page(fs, ctx, ino, index)?;
        let page = match fs.pcache.get(ino, index) {
            Some(page) => page,
            None => return Err(FsError::Corrupt(format!("page {} of inode {} vanished", index, ino))),
        };

        let mut copied = 0;
        while copied < n {
            let off = start + copied;
            let b = off / BLOCK_SIZE as usize;
            let boff = off % BLOCK_SIZE as usize;
            let chunk = (BLOCK_SIZE as usize - boff).min(n - copied);
            out.extend_from_slice(&page.buffers[b].data[boff..boff + chunk]);
            copied += chunk;
        }

        pos += n as u64;
    }

    Ok(out)
}


/// Writes to an open file at `offset`, copy-on-write against the parent
/// version where pages are shared.
pub fn file_write(fs: &mut Fs, ctx: &mut Context, fd: u32, offset: u64, data: &[u8]) -> Result<usize>
{
    let of = match fs.files.get(fd) {
        Some(of) => of.clone(),
        None => return Err(FsError::NotFound),
    };
    if !of.write {
        return Err(FsError::NotPermitted("file is open read-only"));
    }
    if data.is_empty() {
        return Ok(0);
    }

    let ino = of.ino;
    let end = offset + data.len() as u64;
    if end > (inode::N_BLOCKS as u64) * BLOCK_SIZE {
        return Err(FsError::NoSpace);
    }

    let size = inode::read_inode(fs, ctx, ino)?.i_size as u64;

    let mut handle = journal::start(fs)?;
    let res = (|| -> Result<()> {
        let mut pos = offset;
        let mut done = 0;

        while done < data.len() {
            let index = (pos / PAGE_SIZE) as u32;
            let start = (pos % PAGE_SIZE) as usize;
            let n = (PAGE_SIZE as usize - start).min(data.len() - done);
            let end_in_page = start + n;

            // Bring the current contents in first; an evicted shared page
            // must re-arm its copy-on-write state before being written.
            if (index as u64) * PAGE_SIZE < size {
                buffer::load_page(fs, ctx, ino, index)?;
            }

            let mut page = buffer::block_write_begin(&mut handle, ino, index, start, end_in_page, fs, ctx)?;
            copy_into_page(&mut page, start, &data[done..done + n]);
            buffer::write_end(fs, ino, index, page, start, end_in_page);

            pos += n as u64;
            done += n;
        }

        let now = now_secs();
        inode::update_inode(&mut handle, ino, fs, ctx, |i| {
            if end > i.i_size as u64 {
                i.i_size = end as u32;
            }
            i.i_mtime = now;
            i.i_ctime = now;
        })?;

        Ok(())
    })();

    match res {
        Ok(()) => journal::stop(fs, ctx, handle)?,
        Err(e) => {
            journal::abort(fs, ctx, handle)?;
            return Err(e);
        }
    }

    // Materializing the last shared block may release a phantom parent.
    if let Some(parent_ino) = fs.icache.get(ino).and_then(|e| e.parent_handle) {
        orphan::reclaim_if_released(fs, ctx, parent_ino)?;
    }

    Ok(data.len())
}


fn copy_into_page(page: &mut buffer::Page, start: usize, data: &[u8])
{
    let mut copied = 0;

    while copied < data.len() {
        let off = start + copied;
        let b = off / BLOCK_SIZE as usize;
        let boff = off % BLOCK_SIZE as usize;
        let chunk = (BLOCK_SIZE as usize - boff).min(data.len() - copied);
        page.buffers[b].data[boff..boff + chunk].copy_from_slice(&data[copied..copied + chunk]);
        copied += chunk;
    }
}


/// Closes an open file: flushes its pages, releases the cached parent
/// handle on last close, and finishes any reclamation the close unblocks.
pub fn close(fs: &mut Fs, ctx: &mut Context, fd: u32) -> Result<()>
{
    let of = match fs.files.remove(fd) {
        Some(of) => of,
        None => return Err(FsError::NotFound),
    };
    let ino = of.ino;

    buffer::flush_inode(fs, ctx, ino)?;
    inode::iput(fs, ino);

    let mut released_parent = None;
    if fs.files.count_open(ino) == 0 {
        released_parent = inode::release_parent_handle(fs, ino);
    }

    let node = match inode::read_inode(fs, ctx, ino) {
        Ok(node) => node,
        // Already reclaimed through another descriptor.
        Err(FsError::BrokenLink) => return Ok(()),
        Err(e) => return Err(e),
    };
    let flags = IFlags { 0: node.i_flags };
    if flags.has_orphan() && fs.files.count_open(ino) == 0 {
        let in_tree = node.i_parent_ino != 0 || node.i_child_ino != 0
            || node.i_sibling_next_ino != ino;
        if in_tree {
            let root = vtree::trace_root(fs, ctx, ino)?;
            let root_node = inode::read_inode(fs, ctx, root)?;
            if root_node.i_vtree_nlink == 0 && !namei::files_open_in_tree(fs, ctx, root)? {
                orphan::reclaim_tree(fs, ctx, root)?;
            }
        } else {
            orphan::reclaim_if_released(fs, ctx, ino)?;
        }
    }

    if let Some(parent_ino) = released_parent {
        orphan::reclaim_if_released(fs, ctx, parent_ino)?;
    }

    Ok(())
}


/// Detaches the version underlying an open file from its tree
/// (the DELETE_VERSION control operation).
///
/// Not permitted on a tree root. The version loses its tree membership
/// reference; if the open file's name still points at it, the name goes
/// too. Reclamation of the data blocks is deferred while descendants
/// still consume them or the file is still open.
pub fn delete_version(fs: &mut Fs, ctx: &mut Context, fd: u32) -> Result<()>
{
    let of = match fs.files.get(fd) {
        Some(of) => of.clone(),
        None => return Err(FsError::NotFound),
    };
    let ino = of.ino;

    let node = inode::read_inode(fs, ctx, ino)?;
    if node.i_parent_ino == 0 {
        return Err(FsError::NotPermitted("cannot delete the root version"));
    }

    let entry_ino = match namei::find_entry(fs, ctx, None, of.dir_ino, &of.name)? {
        Some(entry_ino) => entry_ino,
        None => return Err(FsError::NotFound),
    };

    let root = vtree::trace_root(fs, ctx, ino)?;
    let entries_of_ino = node.i_links_count.saturating_sub(1);

    let mut reclaim_root = None;

    let mut handle = journal::start(fs)?;
    let res = (|| -> Result<()> {
        let now = now_secs();

        // Children lose their in-memory handle to this version.
        vtree::drop_child_parent_handles(fs, ctx, ino)?;

        vtree::detach_version(&mut handle, ino, fs, ctx)?;

        // The tree-membership reference goes away.
        inode::update_inode(&mut handle, ino, fs, ctx, |i| {
            i.i_links_count = i.i_links_count.saturating_sub(1);
            i.i_ctime = now;
        })?;

        let mut removed: u16 = 0;
        if entry_ino == ino {
            namei::delete_entry(&mut handle, of.dir_ino, &of.name, fs, ctx)?;
            inode::update_inode(&mut handle, ino, fs, ctx, |i| {
                i.i_links_count = i.i_links_count.saturating_sub(1);
            })?;
            inode::update_inode(&mut handle, of.dir_ino, fs, ctx, |i| {
                i.i_mtime = now;
                i.i_ctime = now;
            })?;
            removed = 1;
        }

        // Names that used to reach the old tree through this version now
        // pin the detached version's own (single-node) tree.
        for _ in 0..entries_of_ino {
            vtree::drop_vtree_nlink(&mut handle, root, fs, ctx)?;
        }
        inode::update_inode(&mut handle, ino, fs, ctx, |i| {
            i.i_vtree_nlink = (entries_of_ino - removed) as u32;
        })?;

        let node = inode::read_inode(fs, ctx, ino)?;
        if node.i_links_count == 0 {
            orphan::orphan_add(&mut handle, ino, fs, ctx)?;
            if orphan::blocks_shared_from(fs, ctx, ino)? {
                inode::update_inode(&mut handle, ino, fs, ctx, |i| {
                    i.i_flags |= IFlags::PHANTOM;
                })?;
            }
        }

        let remaining = inode::read_inode(fs, ctx, root)?.i_vtree_nlink;
        if remaining == 0 {
            orphan::mark_tree_orphan(&mut handle, root, fs, ctx)?;
            reclaim_root = Some(root);
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
        if !namei::files_open_in_tree(fs, ctx, root)? {
            orphan::reclaim_tree(fs, ctx, root)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    mod open_intent {
        use super::*;

        #[test]
        fn from_flags_decodes_every_bit()
        {
            let intent = OpenIntent::from_flags(O_WRONLY | O_VERSION, 0);
            assert!(intent.write);
            assert!(intent.version);
            assert!(!intent.parent);
            assert_eq!(None, intent.vsearch);

            let intent = OpenIntent::from_flags(O_PARENT, 0);
            assert!(!intent.write);
            assert!(intent.parent);

            // With O_VSEARCH the create-mode field carries the version
            // inode number.
            let intent = OpenIntent::from_flags(O_RDWR | O_VSEARCH, 42);
            assert!(intent.write);
            assert_eq!(Some(42), intent.vsearch);

            let intent = OpenIntent::from_flags(0, 42);
            assert_eq!(None, intent.vsearch);
        }

        #[test]
        fn flag_values_are_distinct()
        {
            assert_eq!(0, O_VERSION & O_PARENT);
            assert_eq!(0, O_VERSION & O_VSEARCH);
            assert_eq!(0, O_PARENT & O_VSEARCH);
            assert_eq!(0, O_ACCMODE & (O_VERSION | O_PARENT | O_VSEARCH));
        }
    }

    mod open_files {
        use super::*;

        #[test]
        fn descriptors_are_unique_and_counted()
        {
            let mut files = OpenFiles::new();

            let fd1 = files.insert(OpenFile {
                ino: 12, write: false, dir_ino: 2, name: "x".into(),
            });
            let fd2 = files.insert(OpenFile {
                ino: 12, write: true, dir_ino: 2, name: "x".into(),
            });
            assert_ne!(fd1, fd2);
            assert_eq!(2, files.count_open(12));

            files.remove(fd1).unwrap();
            assert_eq!(1, files.count_open(12));
            assert!(files.get(fd1).is_none());
            assert_eq!(12, files.get(fd2).unwrap().ino);
        }
    }
}
