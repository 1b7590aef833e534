use std::io::{self, Read};
use std::marker::PhantomData;

use sha2::{Digest, Sha256, Sha384};

/// Wraps a reader and computes a digest of the data as it is read, one
/// `read()` call at a time. Used both when installing a compressed image
/// (verify as we stream) and when extracting one (hash as we write).
pub struct HashingReader<R: Read, D: Digest>(R, D, PhantomData<D>);

impl<R: Read, D: Digest> HashingReader<R, D> {
    pub fn new(reader: R) -> Self {
        Self(reader, D::new(), PhantomData)
    }

    pub fn hash(&self) -> String {
        format!("{:x}", self.1.clone().finalize())
    }
}

impl<R: Read, D: Digest> Read for HashingReader<R, D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.0.read(buf)?;
        self.1.update(&buf[..n]);
        Ok(n)
    }
}

pub type Sha256HashingReader<R> = HashingReader<R, Sha256>;
pub type Sha384HashingReader<R> = HashingReader<R, Sha384>;
