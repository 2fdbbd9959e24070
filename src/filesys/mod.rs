mod detect;

pub mod verfs;
pub use detect::detect_fs;


/// Supported file system types.
#[derive(Clone, Debug)]
pub enum FsType {
    Verfs,
}
