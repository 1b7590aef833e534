//! Artifact extractor (C8): copies each partition out of the attached image
//! into a sparse raw file, integrity-checks it through a fresh loopback
//! attach, then optionally compresses it into a `.raw.zst` blob carrying the
//! image UUID in a skippable frame. Feeds the COSI packer (C9) and plain
//! `bare-metal-image` output alike.

use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
};

use anyhow::{Context, Error};
use imgcust_api::model::{FsType, ImageUuid};
use sha2::{Digest, Sha384};

use osutils::{
    fsops,
    image_streamer::{self, ZstdOptions},
    loopback::Loopback,
};

/// How a partition's extracted blob should be encoded on disk.
#[derive(Debug, Clone, Copy)]
pub enum Encoding {
    Raw,
    RawZst(ZstdOptions),
}

/// The zstd level at or above which the `zstd` CLI this module's compression
/// replaces would require `--ultra`. Callers picking a compression level
/// above this should also request a wider `long_distance_window_log`.
pub const ULTRA_LEVEL_THRESHOLD: i32 = 20;

/// One partition's extracted, verified, and (optionally) compressed blob,
/// ready to become a COSI `ImageFile` or a bare-metal-image sibling file.
#[derive(Debug, Clone)]
pub struct ExtractedBlob {
    pub filename: String,
    pub path: PathBuf,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    pub sha384: String,
}

/// Extracts one partition to `work_dir/<filename_stem>.raw[.zst]`.
///
/// Always block-copies to a raw file first and integrity-checks it via a
/// fresh loopback attach before compressing, so that a copy corrupted in
/// transit is caught before its own hash is sealed into a blob that would
/// otherwise "verify" the corruption.
pub fn extract_partition(
    partition_device_path: &Path,
    fs_type: &FsType,
    work_dir: &Path,
    filename_stem: &str,
    encoding: Encoding,
    image_uuid: &ImageUuid,
) -> Result<ExtractedBlob, Error> {
    let raw_path = work_dir.join(format!("{filename_stem}.raw"));
    let (_source_hash, uncompressed_size) =
        image_streamer::extract_raw(partition_device_path, &raw_path).context(format!(
            "Failed to block-copy partition '{}'",
            partition_device_path.display()
        ))?;

    verify_extracted_raw(&raw_path, fs_type)?;

    match encoding {
        Encoding::Raw => {
            let sha384 = sha384_of_file(&raw_path)?;
            Ok(ExtractedBlob {
                filename: format!("{filename_stem}.raw"),
                path: raw_path,
                uncompressed_size,
                compressed_size: uncompressed_size,
                sha384,
            })
        }
        Encoding::RawZst(options) => {
            let zst_path = work_dir.join(format!("{filename_stem}.raw.zst"));
            image_streamer::extract_zstd(&raw_path, &zst_path, image_uuid.as_bytes(), options)
                .context("Failed to compress extracted partition")?;
            std::fs::remove_file(&raw_path).context("Failed to remove raw intermediate")?;

            let sha384 = sha384_of_file(&zst_path)?;
            let compressed_size = std::fs::metadata(&zst_path)
                .context("Failed to stat compressed blob")?
                .len();

            Ok(ExtractedBlob {
                filename: format!("{filename_stem}.raw.zst"),
                path: zst_path,
                uncompressed_size,
                compressed_size,
                sha384,
            })
        }
    }
}

/// Attaches `raw_path` as its own loop device and runs the read-only check
/// appropriate for `fs_type` against it, the same way a real partition would
/// be checked in place.
fn verify_extracted_raw(raw_path: &Path, fs_type: &FsType) -> Result<(), Error> {
    let loopback = Loopback::attach(raw_path)
        .context("Failed to attach extracted partition for integrity check")?;
    let check_result = fsops::check_ro(fs_type, loopback.device_path());
    loopback
        .clean_close()
        .context("Failed to detach verification loopback")?;
    check_result.context("Extracted partition failed integrity check")
}

fn sha384_of_file(path: &Path) -> Result<String, Error> {
    let mut file = File::open(path).context(format!("Failed to open '{}'", path.display()))?;
    let mut hasher = Sha384::new();
    let mut buf = [0u8; 1 << 20];
    loop {
        let n = file
            .read(&mut buf)
            .context("Failed to read blob for hashing")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha384_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        std::fs::write(&path, b"hello").unwrap();
        assert_eq!(
            sha384_of_file(&path).unwrap(),
            "59e1748777448c69de6b800d7a33bbfb9ff1b463e44354c3553bcdb9c666fa90125a3c79f90397bdf5f6a13de828684"
        );
    }

    #[test]
    fn test_raw_encoding_keeps_equal_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("source.raw");
        std::fs::write(&source_path, vec![0u8; 4096]).unwrap();
        let (_, size) = image_streamer::extract_raw(
            &source_path,
            &dir.path().join("dest.raw"),
        )
        .unwrap();
        assert_eq!(size, 4096);
    }
}

#[cfg(feature = "functional-test")]
#[cfg_attr(not(test), allow(unused_imports, dead_code))]
mod functional_test {
    use super::*;
    use imgcust_api::model::FsType;

    #[test]
    fn test_extract_partition_negative() {
        let dir = tempfile::tempdir().unwrap();
        let err = extract_partition(
            Path::new("/dev/nonexistent-extract-test"),
            &FsType::Ext4,
            dir.path(),
            "part1",
            Encoding::Raw,
            &ImageUuid::generate(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("block-copy") || err.to_string().contains("Failed"));
    }
}
