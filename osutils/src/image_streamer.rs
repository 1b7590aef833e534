use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Read, Write},
    path::Path,
    time::Instant,
};

use anyhow::{bail, Context, Error};
use log::{debug, trace};

use imgcust_api::primitives::ByteCount;
use sha2::{Sha256, Sha384};

use crate::{
    hashing_reader::HashingReader,
    zstd_frame::{self, build_frame},
};

/// Decompresses a Zstd-compressed stream straight onto a block device,
/// hashing the plaintext as it's written so the caller can verify it against
/// an expected digest afterwards.
pub fn stream_zstd<R: Read>(reader: R, destination_path: &Path) -> Result<String, Error> {
    let mut hashing = HashingReader::<_, Sha256>::new(reader);

    let mut decoder = zstd::stream::read::Decoder::new(BufReader::new(&mut hashing))?;

    let file = File::options()
        .write(true)
        .open(destination_path)
        .context(format!("Failed to open '{}'", destination_path.display()))?;

    let mut file = BufWriter::with_capacity(4 << 20, file);

    let t = Instant::now();

    let bytes_copied = io::copy(&mut decoder, &mut file).context("Failed to copy image")?;

    trace!("Decompressed {bytes_copied} bytes.");

    if decoder.read(&mut [0])? != 0 {
        bail!("Image is larger than destination ({bytes_copied} bytes already copied, however additional bytes remaining)");
    }

    file.into_inner()
        .context("Failed to flush")?
        .sync_all()
        .context("Failed to sync")?;

    debug!(
        "Copied {} [{}] to '{}' in {:.2} seconds",
        ByteCount::from(bytes_copied).to_human_readable(),
        bytes_copied,
        destination_path.display(),
        t.elapsed().as_secs_f32()
    );

    Ok(hashing.hash())
}

/// Copies a partition's raw bytes out to `destination_path` uncompressed,
/// returning the SHA-384 digest of what was written (COSI blobs are hashed
/// with SHA-384, per the COSI metadata format).
pub fn extract_raw(source_path: &Path, destination_path: &Path) -> Result<(String, u64), Error> {
    let source = File::open(source_path)
        .context(format!("Failed to open '{}'", source_path.display()))?;
    let mut hashing = HashingReader::<_, Sha384>::new(BufReader::new(source));

    let destination = File::create(destination_path).context(format!(
        "Failed to create '{}'",
        destination_path.display()
    ))?;
    let mut destination = BufWriter::with_capacity(4 << 20, destination);

    let bytes_copied =
        io::copy(&mut hashing, &mut destination).context("Failed to copy partition data")?;

    destination
        .into_inner()
        .context("Failed to flush")?
        .sync_all()
        .context("Failed to sync")?;

    Ok((hashing.hash(), bytes_copied))
}

/// Compression knobs mirroring the `zstd -f -<level> --long=<long> -T0`
/// invocation this module replaces with the `zstd` crate directly, so the
/// same level/window-log/multithreading choices are available without
/// shelling out.
#[derive(Debug, Clone, Copy)]
pub struct ZstdOptions {
    pub level: i32,
    /// `--long=<window_log>`; `None` disables long-distance matching.
    pub long_distance_window_log: Option<u32>,
}

impl Default for ZstdOptions {
    fn default() -> Self {
        ZstdOptions {
            level: 0,
            long_distance_window_log: None,
        }
    }
}

/// Compresses a partition's raw bytes with Zstd, prepending a skippable
/// frame carrying `image_uuid`, and returns the SHA-384 digest of the
/// *uncompressed* plaintext plus the number of uncompressed bytes read (the
/// COSI metadata records the compressed blob's own hash/size separately,
/// computed over the file this function writes).
pub fn extract_zstd(
    source_path: &Path,
    destination_path: &Path,
    image_uuid: &[u8; 16],
    options: ZstdOptions,
) -> Result<(String, u64), Error> {
    let source = File::open(source_path)
        .context(format!("Failed to open '{}'", source_path.display()))?;
    let mut hashing = HashingReader::<_, Sha384>::new(BufReader::new(source));

    let destination = File::create(destination_path).context(format!(
        "Failed to create '{}'",
        destination_path.display()
    ))?;
    let mut destination = BufWriter::with_capacity(4 << 20, destination);

    destination
        .write_all(&build_frame(image_uuid))
        .context("Failed to write skippable frame")?;

    let mut encoder = zstd::stream::write::Encoder::new(&mut destination, options.level)
        .context("Failed to create zstd encoder")?;

    if let Some(window_log) = options.long_distance_window_log {
        encoder
            .long_distance_matching(true)
            .context("Failed to enable zstd long-distance matching")?;
        encoder
            .window_log(window_log)
            .context("Failed to set zstd window log")?;
    }

    encoder
        .multithread(num_cpus())
        .context("Failed to enable zstd multithreading")?;

    let bytes_copied =
        io::copy(&mut hashing, &mut encoder).context("Failed to compress partition data")?;

    encoder.finish().context("Failed to finish zstd stream")?;
    destination
        .into_inner()
        .context("Failed to flush")?
        .sync_all()
        .context("Failed to sync")?;

    Ok((hashing.hash(), bytes_copied))
}

/// Mirrors `zstd -T0`: use every available core for compression.
fn num_cpus() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

/// Reads the image UUID out of an extracted blob's skippable frame without
/// decompressing the rest of it.
pub fn read_blob_image_uuid(blob_path: &Path) -> Result<[u8; 16], Error> {
    let mut file = BufReader::new(
        File::open(blob_path).context(format!("Failed to open '{}'", blob_path.display()))?,
    );
    zstd_frame::read_frame(&mut file)
}
