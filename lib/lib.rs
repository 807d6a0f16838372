//! pointer-fs shared library.

/// Background pump coalescing URL-resolution requests.
pub mod coordinator;
pub mod credentials;
/// Handle arena shared between the filesystem layer and managed objects.
pub mod handles;
pub mod object;
/// Decoders for on-disk content-pointer encodings.
pub mod pointer;
pub mod remotes;
pub mod repo;
pub mod resolver;
