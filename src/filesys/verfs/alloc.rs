use super::{Fs, FsError, Result};
use super::journal::{self, Handle};


/// Allocates one data block.
/// The new block's bitmap bit and the free counter ride the caller's
/// transaction; its contents are whatever the previous owner left, so the
/// caller must fully overwrite it before exposing it to reads.
pub fn alloc_block(handle: &mut Handle, fs: &mut Fs) -> Result<u32>
{
    let first = fs.sb.s_first_data_block as usize;
    let limit = fs.sb.s_blocks_count as usize;

    let bit = match fs.block_map.find_zero(first, limit) {
        Some(bit) => bit,
        None => return Err(FsError::NoSpace),
    };

    fs.block_map.set_bit(bit);
    fs.sb.s_free_blocks_count -= 1;

    journal::mark_bitmaps_dirty(handle, fs)?;
    journal::mark_sb_dirty(handle, fs)?;

    Ok(bit as u32)
}


/// Returns one data block to the free pool.
pub fn free_block(handle: &mut Handle, blocknr: u32, fs: &mut Fs) -> Result<()>
{
    if blocknr < fs.sb.s_first_data_block || blocknr >= fs.sb.s_blocks_count {
        return Err(FsError::Corrupt(format!("freeing out-of-range block {}", blocknr)));
    }
    if !fs.block_map.check_bit(blocknr as usize) {
        return Err(FsError::Corrupt(format!("double free of block {}", blocknr)));
    }

    fs.block_map.clear_bit(blocknr as usize);
    fs.sb.s_free_blocks_count += 1;

    journal::mark_bitmaps_dirty(handle, fs)?;
    journal::mark_sb_dirty(handle, fs)?;

    Ok(())
}


/// Allocates an inode number.
pub fn alloc_inode(handle: &mut Handle, fs: &mut Fs) -> Result<u32>
{
    let first = fs.sb.s_first_ino as usize - 1;
    let limit = fs.sb.s_inodes_count as usize;

    let bit = match fs.inode_map.find_zero(first, limit) {
        Some(bit) => bit,
        None => return Err(FsError::NoSpace),
    };

    fs.inode_map.set_bit(bit);
    fs.sb.s_free_inodes_count -= 1;

    journal::mark_bitmaps_dirty(handle, fs)?;
    journal::mark_sb_dirty(handle, fs)?;

    Ok(bit as u32 + 1)
}


/// Returns an inode number to the free pool.
pub fn free_inode_bit(handle: &mut Handle, ino: u32, fs: &mut Fs) -> Result<()>
{
    if ino < fs.sb.s_first_ino || ino > fs.sb.s_inodes_count {
        return Err(FsError::Corrupt(format!("freeing reserved inode {}", ino)));
    }
    if !fs.inode_map.check_bit(ino as usize - 1) {
        return Err(FsError::Corrupt(format!("double free of inode {}", ino)));
    }

    fs.inode_map.clear_bit(ino as usize - 1);
    fs.sb.s_free_inodes_count += 1;

    journal::mark_bitmaps_dirty(handle, fs)?;
    journal::mark_sb_dirty(handle, fs)?;

    Ok(())
}
