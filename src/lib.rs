//! Image customization engine: attaches a prebuilt disk image, discovers its
//! partition/mount topology, mutates it in a chroot, resets identifiers,
//! optionally shrinks it, and packages the result as raw/COSI/bare-metal
//! output. See `imgcust_api` for the shared data model and error taxonomy,
//! and `osutils`/`sysdefs` for the tool wrappers and architecture/UUID
//! primitives this crate builds on.

pub mod cosi;
pub mod engine;
pub mod extract;
pub mod format;
pub mod shrink;
pub mod topology;
