use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::Context;
use super::{Fs, FsError, Result};
use super::inode::{self, Inode, IMode, IFlags, test_producer_flg, clear_producer_flg};
use super::namei;
use super::orphan;
use super::sibling;
use super::vtree;


/// One inconsistency found by the verification pass.
#[derive(Clone, Debug, Serialize)]
pub struct Violation {
    pub ino: u32,
    pub detail: String,
}


/// Verifies the version-tree invariants across the whole image: ring
/// closure and reversibility, producer coverage of shared pointers,
/// tree link-count accuracy, generation consistency of every link, and
/// phantom bookkeeping.
pub fn check(fs: &mut Fs, ctx: &mut Context) -> Result<Vec<Violation>>
{
    let mut violations = Vec::new();

    let mut regulars: Vec<(u32, Inode)> = Vec::new();
    for ino in 1..=fs.sb.s_inodes_count {
        if !fs.inode_map.check_bit(ino as usize - 1) {
            continue;
        }
        let node = match inode::read_inode(fs, ctx, ino) {
            Ok(node) => node,
            Err(FsError::BrokenLink) => continue,
            Err(e) => {
                violations.push(Violation {
                    ino,
                    detail: format!("unreadable inode: {}", e),
                });
                continue;
            }
        };
        let mode = IMode { 0: node.i_mode };
        if mode.has_ifreg() {
            regulars.push((ino, node));
        }
    }

    check_generations(fs, ctx, &regulars, &mut violations);
    check_rings(fs, ctx, &regulars, &mut violations);
    check_producers(fs, ctx, &regulars, &mut violations);
    check_vtree_counts(fs, ctx, &regulars, &mut violations)?;
    check_phantoms(fs, ctx, &regulars, &mut violations)?;

    Ok(violations)
}


fn link_pairs(node: &Inode) -> [(&'static str, u32, u32); 4]
{
    [
        ("parent", node.i_parent_ino, node.i_parent_generation),
        ("child", node.i_child_ino, node.i_child_generation),
        ("sibling_prev", node.i_sibling_prev_ino, node.i_sibling_prev_generation),
        ("sibling_next", node.i_sibling_next_ino, node.i_sibling_next_generation),
    ]
}


/// Every stored (ino, generation) pair matches a live inode.
fn check_generations(fs: &mut Fs, ctx: &mut Context, regulars: &[(u32, Inode)], violations: &mut Vec<Violation>)
{
    for (ino, node) in regulars {
        for (what, link_ino, link_generation) in link_pairs(node) {
            if link_ino == 0 {
                continue;
            }
            match inode::read_inode(fs, ctx, link_ino) {
                Ok(target) => {
                    if target.i_generation != link_generation {
                        violations.push(Violation {
                            ino: *ino,
                            detail: format!("stale {} link to {}", what, link_ino),
                        });
                    }
                }
                Err(_) => violations.push(Violation {
                    ino: *ino,
                    detail: format!("broken {} link to {}", what, link_ino),
                }),
            }
        }
    }
}


/// Sibling rings close, reverse cleanly, agree on their parent, and have
/// exactly as many members as the parent has children.
fn check_rings(fs: &mut Fs, ctx: &mut Context, regulars: &[(u32, Inode)], violations: &mut Vec<Violation>)
{
    let mut children_of: HashMap<u32, usize> = HashMap::new();
    for (_, node) in regulars {
        if node.i_parent_ino != 0 {
            *children_of.entry(node.i_parent_ino).or_insert(0) += 1;
        }
    }

    for (ino, node) in regulars {
        if node.i_parent_ino == 0 && node.i_sibling_next_ino != *ino {
            violations.push(Violation {
                ino: *ino,
                detail: "tree root has siblings".into(),
            });
        }

        let next = match inode::read_inode(fs, ctx, node.i_sibling_next_ino) {
            Ok(n) => n,
            Err(_) => continue,
        };
        let prev = match inode::read_inode(fs, ctx, node.i_sibling_prev_ino) {
            Ok(n) => n,
            Err(_) => continue,
        };
        if next.i_sibling_prev_ino != *ino || prev.i_sibling_next_ino != *ino {
            violations.push(Violation {
                ino: *ino,
                detail: "sibling ring does not reverse".into(),
            });
        }

        let members = match sibling::walk(fs, ctx, *ino) {
            Ok(members) => members,
            Err(e) => {
                violations.push(Violation {
                    ino: *ino,
                    detail: format!("sibling ring walk failed: {}", e),
                });
                continue;
            }
        };

        for member in &members {
            let m = match inode::read_inode(fs, ctx, *member) {
                Ok(m) => m,
                Err(_) => continue,
            };
            if m.i_parent_ino != node.i_parent_ino {
                violations.push(Violation {
                    ino: *member,
                    detail: format!("ring member disagrees on parent with {}", ino),
                });
            }
        }

        if node.i_parent_ino != 0 {
            let expected = children_of.get(&node.i_parent_ino).copied().unwrap_or(0);
            if members.len() != expected {
                violations.push(Violation {
                    ino: *ino,
                    detail: format!(
                        "ring has {} members but parent {} has {} children",
                        members.len(), node.i_parent_ino, expected,
                    ),
                });
            }
        }
    }
}


/// Every consumer pointer is covered by a producer somewhere up the
/// ancestor chain.
fn check_producers(fs: &mut Fs, ctx: &mut Context, regulars: &[(u32, Inode)], violations: &mut Vec<Violation>)
{
    for (ino, node) in regulars {
        for ptr in node.i_block {
            if ptr == 0 || test_producer_flg(ptr) {
                continue;
            }
            let blocknr = clear_producer_flg(ptr);

            let mut covered = false;
            let mut cur = node.i_parent_ino;
            let mut hops = 0;
            while cur != 0 && hops <= fs.sb.s_inodes_count {
                let ancestor = match inode::read_inode(fs, ctx, cur) {
                    Ok(a) => a,
                    Err(_) => break,
                };
                if ancestor.i_block.iter().any(|p| {
                    *p != 0 && test_producer_flg(*p) && clear_producer_flg(*p) == blocknr
                }) {
                    covered = true;
                    break;
                }
                cur = ancestor.i_parent_ino;
                hops += 1;
            }

            if !covered {
                violations.push(Violation {
                    ino: *ino,
                    detail: format!("shared block {} has no producing ancestor", blocknr),
                });
            }
        }
    }
}


/// The root of each tree carries exactly the number of directory entries
/// resolving into the tree; nothing else carries a count.
fn check_vtree_counts(fs: &mut Fs, ctx: &mut Context, regulars: &[(u32, Inode)], violations: &mut Vec<Violation>) -> Result<()>
{
    for (ino, node) in regulars {
        if node.i_parent_ino != 0 {
            if node.i_vtree_nlink != 0 {
                violations.push(Violation {
                    ino: *ino,
                    detail: "non-root version carries a tree link count".into(),
                });
            }
            continue;
        }

        let members = match vtree::tree_members(fs, ctx, *ino) {
            Ok(members) => members,
            Err(e) => {
                violations.push(Violation {
                    ino: *ino,
                    detail: format!("tree walk failed: {}", e),
                });
                continue;
            }
        };
        let links = namei::count_links_into(fs, ctx, &members)?;
        if links != node.i_vtree_nlink {
            violations.push(Violation {
                ino: *ino,
                detail: format!(
                    "tree link count is {} but {} directory entries resolve into the tree",
                    node.i_vtree_nlink, links,
                ),
            });
        }
    }

    Ok(())
}


/// Phantom versions sit on the orphan list; orphan-flagged versions
/// appear in the superblock chain.
fn check_phantoms(fs: &mut Fs, ctx: &mut Context, regulars: &[(u32, Inode)], violations: &mut Vec<Violation>) -> Result<()>
{
    let listed: HashSet<u32> = orphan::orphan_list(fs, ctx)?.into_iter().collect();

    for (ino, node) in regulars {
        let flags = IFlags { 0: node.i_flags };
        if flags.has_unknown() {
            violations.push(Violation {
                ino: *ino,
                detail: format!("unknown inode flags: {:#x}", flags.get_unknown()),
            });
        }
        if flags.has_phantom() && !flags.has_orphan() {
            violations.push(Violation {
                ino: *ino,
                detail: "phantom version is not orphan-flagged".into(),
            });
        }
        if flags.has_orphan() && !listed.contains(ino) {
            violations.push(Violation {
                ino: *ino,
                detail: "orphan-flagged version missing from the orphan list".into(),
            });
        }
    }

    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::super::{journal, namei, testutil};
    use super::super::file::{self, OpenIntent, O_WRONLY, O_VERSION};

    #[test]
    fn healthy_history_is_clean()
    {
        let (mut fs, mut ctx, _img) = testutil::scratch("clean");

        namei::create(&mut fs, &mut ctx, "/x").unwrap();
        for data in [b"a".as_slice(), b"b", b"c"] {
            let fd = file::open_path(
                &mut fs, &mut ctx, "/x",
                OpenIntent::from_flags(O_WRONLY | O_VERSION, 0),
            ).unwrap();
            file::file_write(&mut fs, &mut ctx, fd, 0, data).unwrap();
            file::close(&mut fs, &mut ctx, fd).unwrap();
        }

        assert!(check(&mut fs, &mut ctx).unwrap().is_empty());
    }

    #[test]
    fn stale_generation_is_reported()
    {
        let (mut fs, mut ctx, _img) = testutil::scratch("stale");

        let leaf = namei::create(&mut fs, &mut ctx, "/x").unwrap();
        let fd = file::open_path(
            &mut fs, &mut ctx, "/x",
            OpenIntent::from_flags(O_WRONLY | O_VERSION, 0),
        ).unwrap();
        file::file_write(&mut fs, &mut ctx, fd, 0, b"data").unwrap();
        file::close(&mut fs, &mut ctx, fd).unwrap();

        let mut handle = journal::start(&mut fs).unwrap();
        inode::update_inode(&mut handle, leaf, &mut fs, &mut ctx, |i| {
            i.i_parent_generation = i.i_parent_generation.wrapping_add(1);
        }).unwrap();
        journal::stop(&mut fs, &mut ctx, handle).unwrap();

        let violations = check(&mut fs, &mut ctx).unwrap();
        assert!(violations.iter().any(|v| v.ino == leaf && v.detail.contains("stale")));
    }

    #[test]
    fn wrong_tree_count_is_reported()
    {
        let (mut fs, mut ctx, _img) = testutil::scratch("badcount");

        let ino = namei::create(&mut fs, &mut ctx, "/x").unwrap();

        let mut handle = journal::start(&mut fs).unwrap();
        inode::update_inode(&mut handle, ino, &mut fs, &mut ctx, |i| {
            i.i_vtree_nlink = 7;
        }).unwrap();
        journal::stop(&mut fs, &mut ctx, handle).unwrap();

        let violations = check(&mut fs, &mut ctx).unwrap();
        assert!(violations.iter().any(|v| v.ino == ino && v.detail.contains("tree link count")));
    }
}
