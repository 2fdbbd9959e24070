use std::io::{Seek, SeekFrom};
use anyhow::anyhow;
use bincode::{Options, DefaultOptions};
use crate::Context;
use super::FsType;
use super::verfs;


/// Attempts to detect the file system.
pub fn detect_fs(context: &mut Context) -> anyhow::Result<FsType>
{
    if let Some(v) = detect_verfs(context)? { return Ok(v); }

    Err(anyhow!("Unknown file system"))
}


/// Attempts to detect a verfs file system.
fn detect_verfs(context: &mut Context) -> anyhow::Result<Option<FsType>>
{
    let bincode_opt = DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes();

    context.drive.seek(SeekFrom::Start(verfs::SUPERBLOCK_OFFSET))?;
    let sb: verfs::SuperBlock = match bincode_opt.deserialize_from(&context.drive) {
        Ok(sb) => sb,
        Err(_) => return Ok(None),
    };

    if sb.s_magic != verfs::VERFS_MAGIC {
        return Ok(None);
    }

    if sb.s_state == 0 || sb.s_state >> 2 != 0 {
        return Ok(None);
    }

    Ok(Some(FsType::Verfs))
}
