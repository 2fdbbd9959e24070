use crate::Context;
use super::{Fs, FsError, Result};
use super::inode;
use super::journal::Handle;
use super::namei;
use super::sibling;


// Link mutators. Each one touches a single inode and journals the result;
// the composite operations below are sequences of these plus ring splices.

fn link_parent(handle: &mut Handle, from_ino: u32, to_ino: u32, fs: &mut Fs, ctx: &mut Context) -> Result<()>
{
    let to = inode::read_inode(fs, ctx, to_ino)?;

    inode::update_inode(handle, from_ino, fs, ctx, |i| {
        i.i_parent_ino = to_ino;
        i.i_parent_generation = to.i_generation;
    })
}

fn set_parent(handle: &mut Handle, dest_ino: u32, src_ino: u32, fs: &mut Fs, ctx: &mut Context) -> Result<()>
{
    let src = inode::read_inode(fs, ctx, src_ino)?;

    inode::update_inode(handle, dest_ino, fs, ctx, |i| {
        i.i_parent_ino = src.i_parent_ino;
        i.i_parent_generation = src.i_parent_generation;
    })
}

fn link_child(handle: &mut Handle, from_ino: u32, to_ino: u32, fs: &mut Fs, ctx: &mut Context) -> Result<()>
{
    let to = inode::read_inode(fs, ctx, to_ino)?;

    inode::update_inode(handle, from_ino, fs, ctx, |i| {
        i.i_child_ino = to_ino;
        i.i_child_generation = to.i_generation;
    })
}

fn set_child(handle: &mut Handle, dest_ino: u32, src_ino: u32, fs: &mut Fs, ctx: &mut Context) -> Result<()>
{
    let src = inode::read_inode(fs, ctx, src_ino)?;

    inode::update_inode(handle, dest_ino, fs, ctx, |i| {
        i.i_child_ino = src.i_child_ino;
        i.i_child_generation = src.i_child_generation;
    })
}

fn child_set_zero(handle: &mut Handle, ino: u32, fs: &mut Fs, ctx: &mut Context) -> Result<()>
{
    inode::update_inode(handle, ino, fs, ctx, |i| {
        i.i_child_ino = 0;
        i.i_child_generation = 0;
    })
}

fn parent_set_zero(handle: &mut Handle, ino: u32, fs: &mut Fs, ctx: &mut Context) -> Result<()>
{
    inode::update_inode(handle, ino, fs, ctx, |i| {
        i.i_parent_ino = 0;
        i.i_parent_generation = 0;
    })
}


/// Inserts a freshly allocated version into the tree.
///
/// The new version takes the target's position: it inherits the target's
/// parent link and ring slot, while the target (and any children it had)
/// drop one level to become the new version's children, all in one ring.
/// The target stays the writable version; the new inode is the frozen copy
/// above it.
pub fn add_version_to_tree(handle: &mut Handle, new_ino: u32, target_ino: u32, fs: &mut Fs, ctx: &mut Context) -> Result<()>
{
    let target = inode::read_inode(fs, ctx, target_ino)?;
    let parent_ino = target.i_parent_ino;
    if parent_ino != 0 {
        inode::read_inode_checked(fs, ctx, parent_ino, target.i_parent_generation)?;
    }

    if target.i_child_ino == 0 {
        // No child yet: the target becomes the sole child of the new
        // version.
        link_child(handle, new_ino, target_ino, fs, ctx)?;
        set_parent(handle, new_ino, target_ino, fs, ctx)?;

        if sibling::is_link_self(fs, ctx, target_ino)? {
            sibling::link_self(handle, new_ino, fs, ctx)?;
        } else {
            let prev_ino = target.i_sibling_prev_ino;
            sibling::remove(handle, target_ino, fs, ctx)?;
            sibling::insert_after(handle, prev_ino, new_ino, fs, ctx)?;
        }

        link_parent(handle, target_ino, new_ino, fs, ctx)?;
        child_set_zero(handle, target_ino, fs, ctx)?;
        sibling::link_self(handle, target_ino, fs, ctx)?;
    } else {
        // The target already has children: its whole child ring moves up
        // to the new version, and the target joins that ring.
        let child_ino = target.i_child_ino;
        inode::read_inode_checked(fs, ctx, child_ino, target.i_child_generation)?;

        set_parent(handle, new_ino, target_ino, fs, ctx)?;
        set_child(handle, new_ino, target_ino, fs, ctx)?;

        if sibling::is_link_self(fs, ctx, target_ino)? {
            sibling::link_self(handle, new_ino, fs, ctx)?;
        } else {
            let prev_ino = target.i_sibling_prev_ino;
            sibling::remove(handle, target_ino, fs, ctx)?;
            sibling::insert_after(handle, prev_ino, new_ino, fs, ctx)?;
        }

        sibling::insert_after(handle, child_ino, target_ino, fs, ctx)?;
        child_set_zero(handle, target_ino, fs, ctx)?;
        // The target sits in the child ring now, so this re-parents it
        // together with its former children.
        walk_change_parent(handle, child_ino, new_ino, fs, ctx)?;
    }

    if parent_ino != 0 {
        let parent = inode::read_inode(fs, ctx, parent_ino)?;
        if parent.i_child_ino == target_ino {
            link_child(handle, parent_ino, new_ino, fs, ctx)?;
        }
    }

    // Only the root of a tree carries the tree-wide link count; the new
    // version inherited it from the target when it was cloned.
    inode::update_inode(handle, target_ino, fs, ctx, |i| i.i_vtree_nlink = 0)?;

    Ok(())
}


/// Rewrites the parent link of every member of a sibling ring.
pub fn walk_change_parent(handle: &mut Handle, head_ino: u32, parent_ino: u32, fs: &mut Fs, ctx: &mut Context) -> Result<()>
{
    let parent_generation = inode::read_inode(fs, ctx, parent_ino)?.i_generation;
    let members = sibling::walk(fs, ctx, head_ino)?;

    for member in members {
        inode::update_inode(handle, member, fs, ctx, |i| {
            i.i_parent_ino = parent_ino;
            i.i_parent_generation = parent_generation;
        })?;
    }

    Ok(())
}


/// Follows parent links to the root of the version tree.
/// Every intermediate inode is released before the next link is followed.
pub fn trace_root(fs: &mut Fs, ctx: &mut Context, ino: u32) -> Result<u32>
{
    let mut cur_ino = ino;
    let mut node = inode::read_inode(fs, ctx, cur_ino)?;
    let mut hops = 0;

    while node.i_parent_ino != 0 {
        let parent_ino = node.i_parent_ino;
        node = inode::read_inode_checked(fs, ctx, parent_ino, node.i_parent_generation)?;
        cur_ino = parent_ino;

        hops += 1;
        if hops > fs.sb.s_inodes_count {
            return Err(FsError::Corrupt(format!("version tree above {} does not terminate", ino)));
        }
    }

    Ok(cur_ino)
}


/// Bumps the tree-wide link count on a root. Returns the new value.
pub fn inc_vtree_nlink(handle: &mut Handle, root_ino: u32, fs: &mut Fs, ctx: &mut Context) -> Result<u32>
{
    inode::update_inode(handle, root_ino, fs, ctx, |i| {
        i.i_vtree_nlink += 1;
    })?;

    Ok(inode::read_inode(fs, ctx, root_ino)?.i_vtree_nlink)
}

/// Drops the tree-wide link count on a root. Returns the new value.
pub fn drop_vtree_nlink(handle: &mut Handle, root_ino: u32, fs: &mut Fs, ctx: &mut Context) -> Result<u32>
{
    inode::update_inode(handle, root_ino, fs, ctx, |i| {
        i.i_vtree_nlink = i.i_vtree_nlink.saturating_sub(1);
    })?;

    Ok(inode::read_inode(fs, ctx, root_ino)?.i_vtree_nlink)
}


/// Collects every inode of the tree rooted at `root_ino`.
pub fn tree_members(fs: &mut Fs, ctx: &mut Context, root_ino: u32) -> Result<Vec<u32>>
{
    let mut members = Vec::new();
    let mut queue = vec![root_ino];

    while let Some(ino) = queue.pop() {
        members.push(ino);
        if members.len() > fs.sb.s_inodes_count as usize {
            return Err(FsError::Corrupt(format!("version tree at {} does not terminate", root_ino)));
        }

        let node = inode::read_inode(fs, ctx, ino)?;
        if node.i_child_ino != 0 {
            for child in sibling::walk(fs, ctx, node.i_child_ino)? {
                queue.push(child);
            }
        }
    }

    Ok(members)
}


/// Unlinks a version from the tree, preserving the ancestor relation for
/// everything else.
///
/// A detached root hands each member of its child ring a tree of its own;
/// the directory link count is re-counted per new tree. An interior
/// version's children are spliced into its old ring position and
/// re-parented one level up.
pub fn detach_version(handle: &mut Handle, ino: u32, fs: &mut Fs, ctx: &mut Context) -> Result<()>
{
    let node = inode::read_inode(fs, ctx, ino)?;
    let parent_ino = node.i_parent_ino;
    let child_ino = node.i_child_ino;

    if parent_ino != 0 {
        inode::read_inode_checked(fs, ctx, parent_ino, node.i_parent_generation)?;
    }
    if child_ino != 0 {
        inode::read_inode_checked(fs, ctx, child_ino, node.i_child_generation)?;
    }

    if sibling::is_link_self(fs, ctx, ino)? {
        if parent_ino == 0 {
            if child_ino != 0 {
                split_children_to_roots(handle, child_ino, fs, ctx)?;
            }
        } else {
            // Only child of its parent: the parent adopts the child ring,
            // or loses its child link entirely.
            set_child(handle, parent_ino, ino, fs, ctx)?;
            if child_ino != 0 {
                walk_change_parent(handle, child_ino, parent_ino, fs, ctx)?;
            }
        }
    } else {
        if parent_ino == 0 {
            return Err(FsError::Corrupt(format!("root {} has siblings", ino)));
        }

        let parent = inode::read_inode(fs, ctx, parent_ino)?;
        if parent.i_child_ino == ino {
            inode::update_inode(handle, parent_ino, fs, ctx, |i| {
                i.i_child_ino = node.i_sibling_next_ino;
                i.i_child_generation = node.i_sibling_next_generation;
            })?;
        }

        let prev_ino = node.i_sibling_prev_ino;
        let next_ino = node.i_sibling_next_ino;
        sibling::remove(handle, ino, fs, ctx)?;

        if child_ino != 0 {
            walk_change_parent(handle, child_ino, parent_ino, fs, ctx)?;
            splice_ring(handle, prev_ino, next_ino, child_ino, fs, ctx)?;
        }
    }

    parent_set_zero(handle, ino, fs, ctx)?;
    child_set_zero(handle, ino, fs, ctx)?;
    inode::update_inode(handle, ino, fs, ctx, |i| i.i_vtree_nlink = 0)?;

    Ok(())
}


/// Splices the whole ring containing `head_ino` between `prev_ino` and
/// `next_ino` (which may be the same single survivor).
fn splice_ring(handle: &mut Handle, prev_ino: u32, next_ino: u32, head_ino: u32, fs: &mut Fs, ctx: &mut Context) -> Result<()>
{
    let head = inode::read_inode(fs, ctx, head_ino)?;
    let last_ino = head.i_sibling_prev_ino;
    let last = inode::read_inode_checked(fs, ctx, last_ino, head.i_sibling_prev_generation)?;
    let prev = inode::read_inode(fs, ctx, prev_ino)?;
    let next = inode::read_inode(fs, ctx, next_ino)?;

    inode::update_inode(handle, prev_ino, fs, ctx, |i| {
        i.i_sibling_next_ino = head_ino;
        i.i_sibling_next_generation = head.i_generation;
    })?;
    inode::update_inode(handle, head_ino, fs, ctx, |i| {
        i.i_sibling_prev_ino = prev_ino;
        i.i_sibling_prev_generation = prev.i_generation;
    })?;
    inode::update_inode(handle, last_ino, fs, ctx, |i| {
        i.i_sibling_next_ino = next_ino;
        i.i_sibling_next_generation = next.i_generation;
    })?;
    inode::update_inode(handle, next_ino, fs, ctx, |i| {
        i.i_sibling_prev_ino = last_ino;
        i.i_sibling_prev_generation = last.i_generation;
    })?;

    Ok(())
}


/// Clears the cached parent handle of every child of `ino`, ahead of a
/// detach that would leave the handles dangling.
pub(crate) fn drop_child_parent_handles(fs: &mut Fs, ctx: &mut Context, ino: u32) -> Result<()>
{
    let node = inode::read_inode(fs, ctx, ino)?;
    if node.i_child_ino == 0 {
        return Ok(());
    }

    for child in sibling::walk(fs, ctx, node.i_child_ino)? {
        let held = match fs.icache.get_mut(child) {
            Some(entry) if entry.parent_handle == Some(ino) => entry.parent_handle.take(),
            _ => None,
        };
        if held.is_some() {
            inode::iput(fs, ino);
        }
    }

    Ok(())
}


/// Turns every member of a detached root's child ring into the root of an
/// independent tree and re-counts the directory links per new tree.
fn split_children_to_roots(handle: &mut Handle, child_ino: u32, fs: &mut Fs, ctx: &mut Context) -> Result<()>
{
    let members = sibling::walk(fs, ctx, child_ino)?;

    for member in &members {
        sibling::link_self(handle, *member, fs, ctx)?;
        parent_set_zero(handle, *member, fs, ctx)?;
    }

    for member in &members {
        let subtree = tree_members(fs, ctx, *member)?;
        let links = namei::count_links_into(fs, ctx, &subtree)?;
        inode::update_inode(handle, *member, fs, ctx, |i| i.i_vtree_nlink = links)?;
    }

    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::super::{file, journal, namei, testutil};
    use super::super::file::{OpenIntent, O_WRONLY, O_VERSION};

    fn versioned_chain(fs: &mut Fs, ctx: &mut crate::Context) -> (u32, u32, u32)
    {
        let leaf = namei::create(fs, ctx, "/x").unwrap();

        for (i, data) in [b"one".as_slice(), b"two", b"three"].iter().enumerate() {
            let intent = if i == 0 {
                OpenIntent::from_flags(O_WRONLY, 0)
            } else {
                OpenIntent::from_flags(O_WRONLY | O_VERSION, 0)
            };
            let fd = file::open_path(fs, ctx, "/x", intent).unwrap();
            file::file_write(fs, ctx, fd, 0, data).unwrap();
            file::close(fs, ctx, fd).unwrap();
        }

        let node = inode::read_inode(fs, ctx, leaf).unwrap();
        let middle = node.i_parent_ino;
        let root = inode::read_inode(fs, ctx, middle).unwrap().i_parent_ino;

        (root, middle, leaf)
    }

    #[test]
    fn trace_root_follows_the_chain()
    {
        let (mut fs, mut ctx, _img) = testutil::scratch("trace");
        let (root, middle, leaf) = versioned_chain(&mut fs, &mut ctx);

        assert_eq!(root, trace_root(&mut fs, &mut ctx, leaf).unwrap());
        assert_eq!(root, trace_root(&mut fs, &mut ctx, middle).unwrap());
        assert_eq!(root, trace_root(&mut fs, &mut ctx, root).unwrap());
    }

    #[test]
    fn tree_members_collects_every_version()
    {
        let (mut fs, mut ctx, _img) = testutil::scratch("members");
        let (root, middle, leaf) = versioned_chain(&mut fs, &mut ctx);

        let mut members = tree_members(&mut fs, &mut ctx, root).unwrap();
        members.sort_unstable();
        let mut expected = vec![root, middle, leaf];
        expected.sort_unstable();

        assert_eq!(expected, members);
    }

    #[test]
    fn insert_keeps_parent_child_consistent()
    {
        let (mut fs, mut ctx, _img) = testutil::scratch("insert");
        let (root, middle, leaf) = versioned_chain(&mut fs, &mut ctx);

        let root_node = inode::read_inode(&mut fs, &mut ctx, root).unwrap();
        assert_eq!(middle, root_node.i_child_ino);
        let middle_node = inode::read_inode(&mut fs, &mut ctx, middle).unwrap();
        assert_eq!(root, middle_node.i_parent_ino);
        assert_eq!(leaf, middle_node.i_child_ino);
        let leaf_node = inode::read_inode(&mut fs, &mut ctx, leaf).unwrap();
        assert_eq!(middle, leaf_node.i_parent_ino);
        assert_eq!(0, leaf_node.i_child_ino);
    }

    #[test]
    fn detach_interior_splices_children_up()
    {
        let (mut fs, mut ctx, _img) = testutil::scratch("detach-mid");
        let (root, middle, leaf) = versioned_chain(&mut fs, &mut ctx);

        let mut handle = journal::start(&mut fs).unwrap();
        detach_version(&mut handle, middle, &mut fs, &mut ctx).unwrap();
        journal::stop(&mut fs, &mut ctx, handle).unwrap();

        let leaf_node = inode::read_inode(&mut fs, &mut ctx, leaf).unwrap();
        assert_eq!(root, leaf_node.i_parent_ino);
        let root_node = inode::read_inode(&mut fs, &mut ctx, root).unwrap();
        assert_eq!(leaf, root_node.i_child_ino);

        let middle_node = inode::read_inode(&mut fs, &mut ctx, middle).unwrap();
        assert_eq!(0, middle_node.i_parent_ino);
        assert_eq!(0, middle_node.i_child_ino);
        assert_eq!(middle, middle_node.i_sibling_next_ino);
    }

    #[test]
    fn detach_root_splits_children_into_trees()
    {
        let (mut fs, mut ctx, _img) = testutil::scratch("detach-root");
        let (root, middle, leaf) = versioned_chain(&mut fs, &mut ctx);

        // Delete the interior first so the root has one child, then grow
        // a second branch under the root to get a two-member child ring.
        let mut handle = journal::start(&mut fs).unwrap();
        detach_version(&mut handle, middle, &mut fs, &mut ctx).unwrap();
        journal::stop(&mut fs, &mut ctx, handle).unwrap();

        let intent = OpenIntent::from_flags(O_WRONLY | file::O_VSEARCH, root);
        let fd = file::open_path(&mut fs, &mut ctx, "/x", intent).unwrap();
        file::file_write(&mut fs, &mut ctx, fd, 0, b"branch").unwrap();
        file::close(&mut fs, &mut ctx, fd).unwrap();
        let new_root = inode::read_inode(&mut fs, &mut ctx, root).unwrap().i_parent_ino;
        assert_ne!(0, new_root);

        let mut handle = journal::start(&mut fs).unwrap();
        drop_child_parent_handles(&mut fs, &mut ctx, new_root).unwrap();
        detach_version(&mut handle, new_root, &mut fs, &mut ctx).unwrap();
        journal::stop(&mut fs, &mut ctx, handle).unwrap();

        // Both former children are roots of their own trees now.
        for ino in [root, leaf] {
            let node = inode::read_inode(&mut fs, &mut ctx, ino).unwrap();
            assert_eq!(0, node.i_parent_ino);
            assert_eq!(ino, node.i_sibling_next_ino);
        }

        // The single directory entry (/x -> leaf) moved with the leaf's
        // tree; the other tree carries no names.
        let leaf_root = trace_root(&mut fs, &mut ctx, leaf).unwrap();
        let leaf_root_node = inode::read_inode(&mut fs, &mut ctx, leaf_root).unwrap();
        assert_eq!(1, leaf_root_node.i_vtree_nlink);
        let other_node = inode::read_inode(&mut fs, &mut ctx, root).unwrap();
        assert_eq!(0, other_node.i_vtree_nlink);
    }

    #[test]
    fn vtree_nlink_moves_with_the_root()
    {
        let (mut fs, mut ctx, _img) = testutil::scratch("nlink");
        let (root, middle, leaf) = versioned_chain(&mut fs, &mut ctx);

        let root_node = inode::read_inode(&mut fs, &mut ctx, root).unwrap();
        assert_eq!(1, root_node.i_vtree_nlink);
        for ino in [middle, leaf] {
            let node = inode::read_inode(&mut fs, &mut ctx, ino).unwrap();
            assert_eq!(0, node.i_vtree_nlink);
        }
    }
}
