pub mod bytes;
pub mod hash;

pub use bytes::ByteCount;
pub use hash::Sha384Hash;
