use crate::Context;
use super::{Fs, FsError, Result};
use super::inode;
use super::journal::Handle;


/// Makes an inode its own sibling ring (both directions point at itself).
pub fn link_self(handle: &mut Handle, ino: u32, fs: &mut Fs, ctx: &mut Context) -> Result<()>
{
    let generation = inode::read_inode(fs, ctx, ino)?.i_generation;

    inode::update_inode(handle, ino, fs, ctx, |i| {
        i.i_sibling_prev_ino = ino;
        i.i_sibling_prev_generation = generation;
        i.i_sibling_next_ino = ino;
        i.i_sibling_next_generation = generation;
    })
}


/// Whether the inode is alone in its ring.
pub fn is_link_self(fs: &mut Fs, ctx: &mut Context, ino: u32) -> Result<bool>
{
    let node = inode::read_inode(fs, ctx, ino)?;

    Ok(node.i_sibling_next_ino == ino)
}


/// Whether the ring holds exactly two members (next and prev coincide
/// without being the inode itself).
pub fn is_link_same(fs: &mut Fs, ctx: &mut Context, ino: u32) -> Result<bool>
{
    let node = inode::read_inode(fs, ctx, ino)?;

    if node.i_sibling_next_ino == ino {
        return Ok(false);
    }

    Ok(node.i_sibling_next_ino == node.i_sibling_prev_ino)
}


/// Splices `new` into the ring directly after `head`.
pub fn insert_after(handle: &mut Handle, head_ino: u32, new_ino: u32, fs: &mut Fs, ctx: &mut Context) -> Result<()>
{
    let head = inode::read_inode(fs, ctx, head_ino)?;
    let new = inode::read_inode(fs, ctx, new_ino)?;
    let next_ino = head.i_sibling_next_ino;
    let next = inode::read_inode_checked(fs, ctx, next_ino, head.i_sibling_next_generation)?;

    inode::update_inode(handle, new_ino, fs, ctx, |i| {
        i.i_sibling_prev_ino = head_ino;
        i.i_sibling_prev_generation = head.i_generation;
        i.i_sibling_next_ino = next_ino;
        i.i_sibling_next_generation = next.i_generation;
    })?;

    if next_ino == head_ino {
        // Ring of one: head's both directions now name the new member.
        inode::update_inode(handle, head_ino, fs, ctx, |i| {
            i.i_sibling_next_ino = new_ino;
            i.i_sibling_next_generation = new.i_generation;
            i.i_sibling_prev_ino = new_ino;
            i.i_sibling_prev_generation = new.i_generation;
        })?;
    } else {
        inode::update_inode(handle, head_ino, fs, ctx, |i| {
            i.i_sibling_next_ino = new_ino;
            i.i_sibling_next_generation = new.i_generation;
        })?;
        inode::update_inode(handle, next_ino, fs, ctx, |i| {
            i.i_sibling_prev_ino = new_ino;
            i.i_sibling_prev_generation = new.i_generation;
        })?;
    }

    Ok(())
}


/// Splices an inode out of its ring and self-links it.
/// A lone inode is left untouched.
pub fn remove(handle: &mut Handle, removal_ino: u32, fs: &mut Fs, ctx: &mut Context) -> Result<()>
{
    if is_link_self(fs, ctx, removal_ino)? {
        return Ok(());
    }

    let removal = inode::read_inode(fs, ctx, removal_ino)?;
    let prev_ino = removal.i_sibling_prev_ino;
    let next_ino = removal.i_sibling_next_ino;
    inode::read_inode_checked(fs, ctx, prev_ino, removal.i_sibling_prev_generation)?;
    inode::read_inode_checked(fs, ctx, next_ino, removal.i_sibling_next_generation)?;

    if prev_ino == next_ino {
        // Ring of two collapses to a single self-linked survivor.
        let survivor = prev_ino;
        let generation = inode::read_inode(fs, ctx, survivor)?.i_generation;
        inode::update_inode(handle, survivor, fs, ctx, |i| {
            i.i_sibling_prev_ino = survivor;
            i.i_sibling_prev_generation = generation;
            i.i_sibling_next_ino = survivor;
            i.i_sibling_next_generation = generation;
        })?;
    } else {
        inode::update_inode(handle, prev_ino, fs, ctx, |i| {
            i.i_sibling_next_ino = removal.i_sibling_next_ino;
            i.i_sibling_next_generation = removal.i_sibling_next_generation;
        })?;
        inode::update_inode(handle, next_ino, fs, ctx, |i| {
            i.i_sibling_prev_ino = removal.i_sibling_prev_ino;
            i.i_sibling_prev_generation = removal.i_sibling_prev_generation;
        })?;
    }

    link_self(handle, removal_ino, fs, ctx)
}


/// Collects the ring members starting at `head`, in next-direction order.
pub fn walk(fs: &mut Fs, ctx: &mut Context, head_ino: u32) -> Result<Vec<u32>>
{
    let mut members = vec![head_ino];
    let mut node = inode::read_inode(fs, ctx, head_ino)?;

    while node.i_sibling_next_ino != head_ino {
        let next_ino = node.i_sibling_next_ino;
        node = inode::read_inode_checked(fs, ctx, next_ino, node.i_sibling_next_generation)?;
        members.push(next_ino);

        if members.len() > fs.sb.s_inodes_count as usize {
            return Err(FsError::Corrupt(format!("sibling ring at {} does not close", head_ino)));
        }
    }

    Ok(members)
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::super::{journal, namei, testutil};

    fn three_files(fs: &mut Fs, ctx: &mut crate::Context) -> (u32, u32, u32)
    {
        let a = namei::create(fs, ctx, "/a").unwrap();
        let b = namei::create(fs, ctx, "/b").unwrap();
        let c = namei::create(fs, ctx, "/c").unwrap();

        (a, b, c)
    }

    #[test]
    fn fresh_inode_is_self_linked()
    {
        let (mut fs, mut ctx, _img) = testutil::scratch("ring-self");
        let (a, _, _) = three_files(&mut fs, &mut ctx);

        assert!(is_link_self(&mut fs, &mut ctx, a).unwrap());
        assert!(!is_link_same(&mut fs, &mut ctx, a).unwrap());
        assert_eq!(vec![a], walk(&mut fs, &mut ctx, a).unwrap());
    }

    #[test]
    fn insert_builds_a_closed_ring()
    {
        let (mut fs, mut ctx, _img) = testutil::scratch("ring-insert");
        let (a, b, c) = three_files(&mut fs, &mut ctx);

        let mut handle = journal::start(&mut fs).unwrap();
        insert_after(&mut handle, a, b, &mut fs, &mut ctx).unwrap();
        insert_after(&mut handle, b, c, &mut fs, &mut ctx).unwrap();
        journal::stop(&mut fs, &mut ctx, handle).unwrap();

        assert_eq!(vec![a, b, c], walk(&mut fs, &mut ctx, a).unwrap());
        assert_eq!(vec![b, c, a], walk(&mut fs, &mut ctx, b).unwrap());
        assert!(!is_link_same(&mut fs, &mut ctx, a).unwrap());

        // The reverse direction mirrors the forward one.
        let node = inode::read_inode(&mut fs, &mut ctx, a).unwrap();
        assert_eq!(c, node.i_sibling_prev_ino);
        assert_eq!(b, node.i_sibling_next_ino);
    }

    #[test]
    fn two_member_ring_tests_as_same()
    {
        let (mut fs, mut ctx, _img) = testutil::scratch("ring-same");
        let (a, b, _) = three_files(&mut fs, &mut ctx);

        let mut handle = journal::start(&mut fs).unwrap();
        insert_after(&mut handle, a, b, &mut fs, &mut ctx).unwrap();
        journal::stop(&mut fs, &mut ctx, handle).unwrap();

        assert!(is_link_same(&mut fs, &mut ctx, a).unwrap());
        assert!(is_link_same(&mut fs, &mut ctx, b).unwrap());
        assert_eq!(vec![a, b], walk(&mut fs, &mut ctx, a).unwrap());
    }

    #[test]
    fn remove_splices_and_self_links()
    {
        let (mut fs, mut ctx, _img) = testutil::scratch("ring-remove");
        let (a, b, c) = three_files(&mut fs, &mut ctx);

        let mut handle = journal::start(&mut fs).unwrap();
        insert_after(&mut handle, a, b, &mut fs, &mut ctx).unwrap();
        insert_after(&mut handle, b, c, &mut fs, &mut ctx).unwrap();
        remove(&mut handle, b, &mut fs, &mut ctx).unwrap();
        journal::stop(&mut fs, &mut ctx, handle).unwrap();

        assert_eq!(vec![a, c], walk(&mut fs, &mut ctx, a).unwrap());
        assert!(is_link_self(&mut fs, &mut ctx, b).unwrap());

        // Removing the last sibling collapses to two self-rings.
        let mut handle = journal::start(&mut fs).unwrap();
        remove(&mut handle, c, &mut fs, &mut ctx).unwrap();
        journal::stop(&mut fs, &mut ctx, handle).unwrap();

        assert!(is_link_self(&mut fs, &mut ctx, a).unwrap());
        assert!(is_link_self(&mut fs, &mut ctx, c).unwrap());
    }

    #[test]
    fn remove_of_lone_inode_is_a_no_op()
    {
        let (mut fs, mut ctx, _img) = testutil::scratch("ring-noop");
        let (a, _, _) = three_files(&mut fs, &mut ctx);

        let mut handle = journal::start(&mut fs).unwrap();
        remove(&mut handle, a, &mut fs, &mut ctx).unwrap();
        journal::stop(&mut fs, &mut ctx, handle).unwrap();

        assert!(is_link_self(&mut fs, &mut ctx, a).unwrap());
    }
}
