/// Number of blocks needed to hold `$bytes` bytes.
#[macro_export]
macro_rules! blocks_for {
    ($bytes:expr) => {
        ($bytes + $crate::filesys::verfs::BLOCK_SIZE - 1) / $crate::filesys::verfs::BLOCK_SIZE
    };
}

/// Directory records are padded to a 4-byte boundary.
#[macro_export]
macro_rules! rec_len_align {
    ($len:expr) => {
        ($len + 3) & !3
    };
}
