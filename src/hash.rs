/// Name hashing for the dentry cache.
///
/// The textual hash is the classic rolling dentry hash; a versioned name
/// additionally mixes in the inode's generation and number so that two
/// cache entries with the same text but different versions land in
/// distinct slots.

pub fn partial_name_hash(c: u64, prevhash: u64) -> u64
{
    prevhash
        .wrapping_add(c << 4)
        .wrapping_add(c >> 4)
        .wrapping_mul(11)
}

pub fn end_name_hash(hash: u64) -> u32
{
    hash as u32
}

/// Hashes the raw text of a name.
pub fn name_hash(name: &str) -> u64
{
    let mut hash = 0;
    for b in name.bytes() {
        hash = partial_name_hash(b as u64, hash);
    }

    hash
}

/// Hashes a name bound to one specific version of a file.
pub fn version_name_hash(name: &str, generation: u32, ino: u32) -> u32
{
    let mut hash = name_hash(name);
    hash = partial_name_hash(generation as u64, hash);
    hash = partial_name_hash(ino as u64, hash);

    end_name_hash(hash)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_text_same_hash()
    {
        assert_eq!(name_hash("alpha"), name_hash("alpha"));
        assert_eq!(
            version_name_hash("alpha", 7, 12),
            version_name_hash("alpha", 7, 12),
        );
    }

    #[test]
    fn different_text_different_hash()
    {
        assert_ne!(name_hash("alpha"), name_hash("beta"));
    }

    #[test]
    fn versions_occupy_distinct_slots()
    {
        let a = version_name_hash("x", 1, 12);
        let b = version_name_hash("x", 1, 13);
        let c = version_name_hash("x", 2, 12);

        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn empty_name_is_stable()
    {
        assert_eq!(name_hash(""), 0);
        assert_eq!(end_name_hash(0), 0);
    }
}
