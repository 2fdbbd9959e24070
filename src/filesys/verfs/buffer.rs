use std::collections::HashMap;

use crate::Context;
use super::{Fs, Result, BLOCK_SIZE, PAGE_SIZE};
use super::inode::{self, test_producer_flg};
use super::journal::Handle;


pub const BUFFERS_PER_PAGE: usize = (PAGE_SIZE / BLOCK_SIZE) as usize;


/// Buffer state bits (b_state).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BhState(pub u32);

impl BhState {
    pub fn has_mapped(&self)   -> bool { self.0 & 0x01 != 0 }
    pub fn has_uptodate(&self) -> bool { self.0 & 0x02 != 0 }
    pub fn has_dirty(&self)    -> bool { self.0 & 0x04 != 0 }
    pub fn has_new(&self)      -> bool { self.0 & 0x08 != 0 }
    /// Mapped to a block owned by an ancestor version; never written in place.
    pub fn has_shared(&self)   -> bool { self.0 & 0x10 != 0 }

    pub fn set_mapped(&mut self)     { self.0 |= 0x01 }
    pub fn set_uptodate(&mut self)   { self.0 |= 0x02 }
    pub fn set_dirty(&mut self)      { self.0 |= 0x04 }
    pub fn set_new(&mut self)        { self.0 |= 0x08 }
    pub fn set_shared(&mut self)     { self.0 |= 0x10 }

    pub fn clear_uptodate(&mut self) { self.0 &= !0x02 }
    pub fn clear_dirty(&mut self)    { self.0 &= !0x04 }
    pub fn clear_new(&mut self)      { self.0 &= !0x08 }
    pub fn clear_shared(&mut self)   { self.0 &= !0x10 }
}


/// Page state bits.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PgState(pub u32);

impl PgState {
    pub fn has_uptodate(&self) -> bool { self.0 & 0x1 != 0 }
    pub fn has_dirty(&self)    -> bool { self.0 & 0x2 != 0 }
    pub fn has_shared(&self)   -> bool { self.0 & 0x4 != 0 }

    pub fn set_uptodate(&mut self)   { self.0 |= 0x1 }
    pub fn set_dirty(&mut self)      { self.0 |= 0x2 }
    pub fn set_shared(&mut self)     { self.0 |= 0x4 }

    pub fn clear_uptodate(&mut self) { self.0 &= !0x1 }
    pub fn clear_dirty(&mut self)    { self.0 &= !0x2 }
    pub fn clear_shared(&mut self)   { self.0 &= !0x4 }
}


/// A page-cache buffer covering one block of a page.
#[derive(Clone, Debug)]
pub struct BufferHead {
    pub state: BhState,
    pub blocknr: u32,
    pub data: Vec<u8>,
}

impl BufferHead {
    fn new() -> Self
    {
        Self {
            state: BhState::default(),
            blocknr: 0,
            data: vec![u8::default(); BLOCK_SIZE as usize],
        }
    }
}


/// A cached page: four buffers of file data.
#[derive(Clone, Debug)]
pub struct Page {
    pub state: PgState,
    pub buffers: Vec<BufferHead>,
}

impl Page {
    fn new() -> Self
    {
        Self {
            state: PgState::default(),
            buffers: (0..BUFFERS_PER_PAGE).map(|_| BufferHead::new()).collect(),
        }
    }

    pub fn any_shared(&self) -> bool
    {
        self.buffers.iter().any(|b| b.state.has_shared())
    }
}


/// The page cache, keyed by (inode, page index).
#[derive(Debug)]
pub struct PageCache(HashMap<(u32, u32), Page>);

impl PageCache {
    pub fn new() -> Self
    {
        Self { 0: HashMap::new() }
    }

    pub fn get(&self, ino: u32, index: u32) -> Option<&Page>
    {
        self.0.get(&(ino, index))
    }

    /// Takes the page out of the cache. Pairing with `put` keeps a page
    /// mutation from aliasing the rest of the filesystem state.
    pub fn take(&mut self, ino: u32, index: u32) -> Option<Page>
    {
        self.0.remove(&(ino, index))
    }

    pub fn put(&mut self, ino: u32, index: u32, page: Page)
    {
        self.0.insert((ino, index), page);
    }

    pub fn indexes_of(&self, ino: u32) -> Vec<u32>
    {
        let mut v: Vec<u32> = self.0.keys()
            .filter(|(i, _)| *i == ino)
            .map(|(_, idx)| *idx)
            .collect();
        v.sort_unstable();

        v
    }

    pub fn keys(&self) -> Vec<(u32, u32)>
    {
        self.0.keys().copied().collect()
    }

    pub fn remove_inode(&mut self, ino: u32)
    {
        self.0.retain(|(i, _), _| *i != ino);
    }

    pub fn clear(&mut self)
    {
        self.0.clear();
    }
}


/// Takes the page at `index`, creating an empty one if it is not cached.
pub fn grab_page(fs: &mut Fs, ino: u32, index: u32) -> Page
{
    fs.pcache.take(ino, index).unwrap_or_else(Page::new)
}


/// Loads a page for reading: every buffer inside the file is mapped and
/// read, holes and the area past the end read as zeroes.
///
/// A buffer whose pointer carries no producer flag maps a block owned by
/// an ancestor; it is marked shared again even after an eviction, so a
/// later write cannot touch the ancestor's block in place.
pub fn load_page(fs: &mut Fs, ctx: &mut Context, ino: u32, index: u32) -> Result<()>
{
    let node = inode::read_inode(fs, ctx, ino)?;
    let has_parent = node.i_parent_ino != 0;

    let mut page = grab_page(fs, ino, index);

    for i in 0..BUFFERS_PER_PAGE {
        let lblock = index as usize * BUFFERS_PER_PAGE + i;

        if page.buffers[i].state.has_uptodate() {
            continue;
        }

        let ptr = if lblock < inode::N_BLOCKS { node.i_block[lblock] } else { 0 };
        if ptr != 0 {
            let blocknr = inode::clear_producer_flg(ptr);
            let raw = super::read_block(ctx, blocknr)?;
            page.buffers[i].data.copy_from_slice(&raw);
            page.buffers[i].blocknr = blocknr;
            page.buffers[i].state.set_mapped();
            page.buffers[i].state.set_uptodate();
            if has_parent && !test_producer_flg(ptr) {
                page.buffers[i].state.set_shared();
            }
        } else {
            // Hole: reads as zeroes, stays unmapped.
            page.buffers[i].data.fill(0);
            page.buffers[i].state.set_uptodate();
        }
    }

    page.state.set_uptodate();
    if page.any_shared() {
        page.state.set_shared();
    }
    fs.pcache.put(ino, index, page);

    Ok(())
}


/// Prepares a page for a write of `[start, end)` (page-relative bytes).
///
/// This is the copy-on-write gate. If the writer has a cached parent
/// version and the page holds dirty shared data, the old contents are
/// first pushed up into the parent's page cache (and written to the
/// parent-owned blocks), so the parent stays immutable while the writer
/// diverges onto freshly allocated blocks.
///
/// The returned page is out of the cache; the caller copies the new bytes
/// in and hands it to `write_end`.
pub fn block_write_begin(
    handle: &mut Handle,
    ino: u32,
    index: u32,
    start: usize,
    end: usize,
    fs: &mut Fs,
    ctx: &mut Context,
) -> Result<Page>
{
    assert!(start <= end);
    assert!(end <= PAGE_SIZE as usize);

    let mut page = grab_page(fs, ino, index);
    let parent_ino = fs.icache.get(ino).and_then(|e| e.parent_handle);

    // Copy the buffer contents up to the parent version's cache before
    // any buffer of this page is remapped. The parent must own the old
    // state before the writer's pointer moves off the shared block.
    if let Some(parent_ino) = parent_ino {
        if page.state.has_dirty() && page.state.has_shared() {
            let mut parent_page = grab_page(fs, parent_ino, index);

            for (bh, parent_bh) in page.buffers.iter().zip(parent_page.buffers.iter_mut()) {
                if bh.state.has_shared() && bh.state.has_mapped() {
                    parent_bh.blocknr = bh.blocknr;
                    parent_bh.data.copy_from_slice(&bh.data);
                    parent_bh.state.clear_new();
                    parent_bh.state.set_uptodate();
                    parent_bh.state.set_mapped();
                    parent_bh.state.set_dirty();

                    super::write_block(ctx, parent_bh.blocknr, &parent_bh.data)?;
                    parent_bh.state.clear_dirty();
                }
            }

            if parent_page.buffers.iter().all(|b| b.state.has_uptodate()) {
                parent_page.state.set_uptodate();
            }
            fs.pcache.put(parent_ino, index, parent_page);
        }
    }

    if let Err(e) = prepare_buffers(handle, ino, index, &mut page, start, end, fs, ctx) {
        // A failed allocation leaves half-prepared buffers; drop the page
        // so reads fall back to the on-drive state.
        page.state.clear_uptodate();
        return Err(e);
    }

    if !page.any_shared() {
        page.state.clear_shared();
    }

    Ok(page)
}


fn prepare_buffers(
    handle: &mut Handle,
    ino: u32,
    index: u32,
    page: &mut Page,
    start: usize,
    end: usize,
    fs: &mut Fs,
    ctx: &mut Context,
) -> Result<()>
{
    let blocksize = BLOCK_SIZE as usize;

    for i in 0..BUFFERS_PER_PAGE {
        let block_start = i * blocksize;
        let block_end = block_start + blocksize;
        let lblock = index * BUFFERS_PER_PAGE as u32 + i as u32;

        if block_end <= start || block_start >= end {
            if page.state.has_uptodate() && !page.buffers[i].state.has_uptodate() {
                page.buffers[i].state.set_uptodate();
            }
            continue;
        }

        if page.buffers[i].state.has_new() {
            page.buffers[i].state.clear_new();
        }

        if !page.buffers[i].state.has_mapped() || page.buffers[i].state.has_shared() {
            let (blocknr, is_new) = inode::get_block(handle, ino, lblock, fs, ctx)?;
            page.buffers[i].blocknr = blocknr;
            page.buffers[i].state.set_mapped();

            if page.buffers[i].state.has_shared() {
                page.buffers[i].state.set_uptodate();
                page.buffers[i].state.clear_shared();
            }

            if is_new {
                page.buffers[i].state.set_new();
                if page.state.has_uptodate() {
                    page.buffers[i].state.clear_new();
                    page.buffers[i].state.set_uptodate();
                    page.buffers[i].state.set_dirty();
                    continue;
                }
                // A fresh block under a partial write: zero what the write
                // will not cover.
                if block_start < start {
                    let upto = (start - block_start).min(blocksize);
                    page.buffers[i].data[..upto].fill(0);
                }
                if block_end > end {
                    let from = end.saturating_sub(block_start);
                    page.buffers[i].data[from..].fill(0);
                }
                continue;
            }
        }

        if page.state.has_uptodate() {
            if !page.buffers[i].state.has_uptodate() {
                page.buffers[i].state.set_uptodate();
            }
            continue;
        }

        if !page.buffers[i].state.has_uptodate()
            && (block_start < start || block_end > end)
        {
            // Partial write into an existing block: bring it up to date.
            let raw = super::read_block(ctx, page.buffers[i].blocknr)?;
            page.buffers[i].data.copy_from_slice(&raw);
            page.buffers[i].state.set_uptodate();
        }
    }

    Ok(())
}


/// Completes a write into `[start, end)` of a prepared page.
pub fn write_end(fs: &mut Fs, ino: u32, index: u32, mut page: Page, start: usize, end: usize)
{
    let blocksize = BLOCK_SIZE as usize;

    for i in 0..BUFFERS_PER_PAGE {
        let block_start = i * blocksize;
        let block_end = block_start + blocksize;

        if block_end <= start || block_start >= end {
            continue;
        }

        page.buffers[i].state.set_uptodate();
        page.buffers[i].state.set_dirty();
        page.buffers[i].state.clear_new();
    }

    page.state.set_dirty();
    if page.buffers.iter().all(|b| b.state.has_uptodate()) {
        page.state.set_uptodate();
    }

    fs.pcache.put(ino, index, page);
}


/// Arms copy-on-write on every cached page of an inode: each mapped buffer
/// is marked shared, unmapped ones inside the file are mapped and read
/// first so that a shared buffer always carries valid contents.
pub fn share_cached_pages(fs: &mut Fs, ctx: &mut Context, ino: u32) -> Result<()>
{
    let node = inode::read_inode(fs, ctx, ino)?;
    let size = node.i_size as u64;
    if size == 0 {
        return Ok(());
    }
    let last_index = ((size - 1) / PAGE_SIZE) as u32;

    for index in fs.pcache.indexes_of(ino) {
        if index > last_index {
            continue;
        }

        let mut page = match fs.pcache.take(ino, index) {
            Some(page) => page,
            None => continue,
        };

        for i in 0..BUFFERS_PER_PAGE {
            let offset = index as u64 * PAGE_SIZE + (i as u64) * BLOCK_SIZE;
            if offset >= size {
                continue;
            }

            if !page.buffers[i].state.has_mapped() {
                let lblock = index * BUFFERS_PER_PAGE as u32 + i as u32;
                match inode::map_block(fs, ctx, ino, lblock)? {
                    Some(blocknr) => {
                        if !page.buffers[i].state.has_uptodate() {
                            let raw = super::read_block(ctx, blocknr)?;
                            page.buffers[i].data.copy_from_slice(&raw);
                            page.buffers[i].state.set_uptodate();
                        }
                        page.buffers[i].blocknr = blocknr;
                        page.buffers[i].state.set_mapped();
                    }
                    // A hole has nothing to share.
                    None => continue,
                }
            }

            page.buffers[i].state.set_shared();
        }

        if page.any_shared() {
            page.state.set_shared();
        }
        fs.pcache.put(ino, index, page);
    }

    Ok(())
}


/// Writes an inode's dirty buffers back to their blocks.
pub fn flush_inode(fs: &mut Fs, ctx: &mut Context, ino: u32) -> Result<()>
{
    for index in fs.pcache.indexes_of(ino) {
        let mut page = match fs.pcache.take(ino, index) {
            Some(page) => page,
            None => continue,
        };

        for bh in page.buffers.iter_mut() {
            if bh.state.has_dirty() && bh.state.has_mapped() {
                super::write_block(ctx, bh.blocknr, &bh.data)?;
                bh.state.clear_dirty();
            }
        }

        page.state.clear_dirty();
        fs.pcache.put(ino, index, page);
    }

    Ok(())
}


/// Writes every dirty buffer in the cache back to the drive.
pub fn flush_all(fs: &mut Fs, ctx: &mut Context) -> Result<()>
{
    let mut inos: Vec<u32> = fs.pcache.keys().iter().map(|(ino, _)| *ino).collect();
    inos.sort_unstable();
    inos.dedup();

    for ino in inos {
        flush_inode(fs, ctx, ino)?;
    }

    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    mod bh_state {
        use super::*;

        #[test]
        fn set_and_clear()
        {
            let mut state = BhState::default();

            state.set_mapped();
            state.set_shared();
            assert_eq!(true, state.has_mapped());
            assert_eq!(true, state.has_shared());
            assert_eq!(false, state.has_dirty());

            state.clear_shared();
            assert_eq!(false, state.has_shared());
            assert_eq!(true, state.has_mapped());
        }
    }

    mod page {
        use super::*;

        #[test]
        fn fresh_page_is_empty()
        {
            let page = Page::new();

            assert_eq!(BUFFERS_PER_PAGE, page.buffers.len());
            assert_eq!(false, page.state.has_uptodate());
            assert_eq!(false, page.any_shared());
        }

        #[test]
        fn any_shared_sees_single_buffer()
        {
            let mut page = Page::new();
            page.buffers[2].state.set_shared();

            assert_eq!(true, page.any_shared());
        }
    }

    mod page_cache {
        use super::*;

        #[test]
        fn take_and_put()
        {
            let mut cache = PageCache::new();
            cache.put(5, 0, Page::new());
            cache.put(5, 3, Page::new());
            cache.put(9, 0, Page::new());

            assert_eq!(vec![0, 3], cache.indexes_of(5));

            let page = cache.take(5, 0);
            assert!(page.is_some());
            assert_eq!(vec![3], cache.indexes_of(5));

            cache.remove_inode(5);
            assert!(cache.indexes_of(5).is_empty());
            assert!(cache.get(9, 0).is_some());
        }
    }
}
