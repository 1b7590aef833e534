//! COSI packer (C9): assembles the partition blobs produced by the artifact
//! extractor (C8) into a PAX tar archive with `metadata.json` as its first
//! member, followed by each partition's image (and, for verity-protected
//! partitions, its paired hash image) in the order `metadata.images` lists
//! them.

use std::{
    fs::File,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Error};
use imgcust_api::model::{CosiMetadata, FileSystemEntry, ImageFile, VerityMetadata};

use crate::extract::ExtractedBlob;

/// One partition's worth of material the packer needs: its extracted blob,
/// the COSI entry fields describing it, and (for a verity-protected data
/// partition) the root hash plus the paired hash image's own extracted blob.
pub struct CosiPartition {
    pub blob: ExtractedBlob,
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub fs_uuid: Option<String>,
    pub part_type: String,
    pub verity: Option<(String, ExtractedBlob)>,
}

/// Builds the `FileSystemEntry` list that becomes `metadata.images`, in the
/// order `partitions` was given. Tar member order mirrors this same order:
/// each entry's data image, then its hash image when one is present.
pub fn build_entries(partitions: &[CosiPartition]) -> Vec<FileSystemEntry> {
    partitions
        .iter()
        .map(|p| FileSystemEntry {
            image: image_file_of(&p.blob),
            mount_point: p.mount_point.clone(),
            fs_type: p.fs_type.clone(),
            fs_uuid: p.fs_uuid.clone(),
            part_type: p.part_type.clone(),
            verity: p
                .verity
                .as_ref()
                .map(|(roothash, hash_blob)| VerityMetadata {
                    roothash: roothash.clone(),
                    image: image_file_of(hash_blob),
                }),
        })
        .collect()
}

fn image_file_of(blob: &ExtractedBlob) -> ImageFile {
    ImageFile {
        path: format!("images/{}", blob.filename),
        uncompressed_size: blob.uncompressed_size,
        compressed_size: blob.compressed_size,
        sha384: blob.sha384.clone().into(),
    }
}

/// Packs `metadata` and every partition blob it references into `output_path`
/// as a PAX tar archive: `metadata.json` first, then each data image
/// followed by its hash image when the entry carries verity metadata.
/// `metadata.images` and `partitions` MUST be in the same order; callers
/// build both from the same call to [`build_entries`].
pub fn pack(
    output_path: &Path,
    metadata: &CosiMetadata,
    partitions: &[CosiPartition],
) -> Result<(), Error> {
    let file =
        File::create(output_path).context(format!("Failed to create '{}'", output_path.display()))?;
    let mut builder = tar::Builder::new(file);

    let metadata_json =
        serde_json::to_vec_pretty(metadata).context("Failed to serialize COSI metadata")?;
    append_bytes(&mut builder, "metadata.json", &metadata_json)?;

    for partition in partitions {
        append_file(&mut builder, &image_file_of(&partition.blob).path, &partition.blob.path)?;
        if let Some((_, hash_blob)) = &partition.verity {
            append_file(&mut builder, &image_file_of(hash_blob).path, &hash_blob.path)?;
        }
    }

    builder
        .into_inner()
        .context("Failed to finish COSI tar")?
        .sync_all()
        .context("Failed to sync COSI file")?;
    Ok(())
}

fn current_mtime() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Writes a single PAX-tagged, mode-0o400 member holding `data` in memory.
/// Used only for `metadata.json`, which is small; partition blobs stream
/// straight from disk via [`append_file`] instead.
fn append_bytes(builder: &mut tar::Builder<File>, tar_path: &str, data: &[u8]) -> Result<(), Error> {
    builder
        .append_pax_extensions(std::iter::empty::<(&str, &[u8])>())
        .context("Failed to write PAX header record")?;
    let mut header = tar::Header::new_ustar();
    header.set_size(data.len() as u64);
    header.set_mode(0o400);
    header.set_mtime(current_mtime());
    header.set_cksum();
    builder
        .append_data(&mut header, tar_path, data)
        .context(format!("Failed to append '{tar_path}' to COSI archive"))
}

/// Streams `source_path`'s bytes into a PAX-tagged, mode-0o400 tar member
/// without reading the whole blob into memory.
fn append_file(builder: &mut tar::Builder<File>, tar_path: &str, source_path: &Path) -> Result<(), Error> {
    let size = std::fs::metadata(source_path)
        .context(format!("Failed to stat '{}'", source_path.display()))?
        .len();

    builder
        .append_pax_extensions(std::iter::empty::<(&str, &[u8])>())
        .context("Failed to write PAX header record")?;
    let mut header = tar::Header::new_ustar();
    header.set_size(size);
    header.set_mode(0o400);
    header.set_mtime(current_mtime());
    header.set_cksum();

    let source =
        File::open(source_path).context(format!("Failed to open '{}'", source_path.display()))?;
    builder
        .append_data(&mut header, tar_path, source)
        .context(format!("Failed to append '{tar_path}' to COSI archive"))
}
