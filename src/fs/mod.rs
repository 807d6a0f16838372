//! FUSE-facing filesystem layer.

mod mount;

pub use mount::PointerFs;
