//! Input image format auto-detection (spec §6, §8 S6). The distilled spec
//! only lists the accepted formats; the magic-byte matching here is new,
//! grounded on the pack's general pattern of small single-purpose detection
//! functions keyed on a fixed-size header read (`sysdefs::arch`,
//! `osutils::uki`).

use std::{
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::Path,
};

use anyhow::{Context, Error};

/// MBR boot signature, always at offset 510 of sector 0 for a partitioned
/// disk image (raw, vhd-fixed) regardless of partition table type.
const MBR_SIGNATURE_OFFSET: u64 = 510;
const MBR_SIGNATURE: [u8; 2] = [0x55, 0xAA];

/// `vhd`/`vhd-fixed` footer cookie, 8 bytes, ASCII "conectix".
const VHD_COOKIE: &[u8; 8] = b"conectix";
/// `vhdx` file identifier signature, the first 8 bytes of the file.
const VHDX_SIGNATURE: &[u8; 8] = b"vhdxfile";
/// Zstd frame magic, little-endian.
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];
/// QCOW2 magic, big-endian `QFI\xfb`.
const QCOW2_MAGIC: [u8; 4] = [0x51, 0x46, 0x49, 0xFB];

/// The disk image container formats this engine can accept as input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Raw,
    Qcow2,
    Vhd,
    VhdFixed,
    Vhdx,
    Zst,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Raw => "raw",
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Vhd => "vhd",
            ImageFormat::VhdFixed => "vhd-fixed",
            ImageFormat::Vhdx => "vhdx",
            ImageFormat::Zst => "zst",
        }
    }
}

/// Detects the container format of a disk image by reading a fixed-size
/// header and the final 512 bytes and matching magic bytes, per spec.md §8
/// scenario S6:
/// - first 8 bytes `conectix` with no MBR signature at 510 -> `vhd`
/// - first 8 bytes `vhdxfile` -> `vhdx`
/// - first 4 bytes `28 B5 2F FD` -> `zst`
/// - first 4 bytes `51 46 49 FB` -> `qcow2`
/// - MBR signature at 510 and `conectix` in the last 512 bytes -> `vhd-fixed`
/// - MBR signature at 510 alone -> `raw`
pub fn detect(path: &Path) -> Result<ImageFormat, Error> {
    let mut file =
        File::open(path).context(format!("Failed to open '{}'", path.display()))?;

    let mut header = [0u8; 8];
    let header_len = read_at_most(&mut file, 0, &mut header)?;

    if header_len >= 8 && &header == VHDX_SIGNATURE {
        return Ok(ImageFormat::Vhdx);
    }
    if header_len >= 4 && header[0..4] == ZSTD_MAGIC {
        return Ok(ImageFormat::Zst);
    }
    if header_len >= 4 && header[0..4] == QCOW2_MAGIC {
        return Ok(ImageFormat::Qcow2);
    }

    let has_mbr_signature = has_mbr_signature(&mut file)?;
    let footer_has_vhd_cookie = footer_has_vhd_cookie(&mut file)?;

    if header_len >= 8 && &header == VHD_COOKIE && !has_mbr_signature {
        return Ok(ImageFormat::Vhd);
    }

    if has_mbr_signature && footer_has_vhd_cookie {
        return Ok(ImageFormat::VhdFixed);
    }

    if has_mbr_signature {
        return Ok(ImageFormat::Raw);
    }

    anyhow::bail!(
        "Could not detect the format of image '{}': no recognized magic bytes",
        path.display()
    )
}

fn read_at_most(file: &mut File, offset: u64, buf: &mut [u8]) -> Result<usize, Error> {
    file.seek(SeekFrom::Start(offset))
        .context("Failed to seek in image file")?;
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..])? {
            0 => break,
            n => total += n,
        }
    }
    Ok(total)
}

fn has_mbr_signature(file: &mut File) -> Result<bool, Error> {
    let mut sig = [0u8; 2];
    let n = read_at_most(file, MBR_SIGNATURE_OFFSET, &mut sig)?;
    Ok(n == 2 && sig == MBR_SIGNATURE)
}

fn footer_has_vhd_cookie(file: &mut File) -> Result<bool, Error> {
    let len = file.metadata().context("Failed to stat image file")?.len();
    if len < 512 {
        return Ok(false);
    }
    let mut footer = [0u8; 512];
    read_at_most(file, len - 512, &mut footer)?;
    Ok(footer.windows(VHD_COOKIE.len()).any(|w| w == VHD_COOKIE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_detect_raw() {
        let mut bytes = vec![0u8; 1024];
        bytes[510] = 0x55;
        bytes[511] = 0xAA;
        let file = write_temp(&bytes);
        assert_eq!(detect(file.path()).unwrap(), ImageFormat::Raw);
    }

    #[test]
    fn test_detect_vhd() {
        let mut bytes = b"conectix".to_vec();
        bytes.resize(1024, 0);
        let file = write_temp(&bytes);
        assert_eq!(detect(file.path()).unwrap(), ImageFormat::Vhd);
    }

    #[test]
    fn test_detect_vhdx() {
        let mut bytes = b"vhdxfile".to_vec();
        bytes.resize(1024, 0);
        let file = write_temp(&bytes);
        assert_eq!(detect(file.path()).unwrap(), ImageFormat::Vhdx);
    }

    #[test]
    fn test_detect_zst() {
        let mut bytes = ZSTD_MAGIC.to_vec();
        bytes.resize(64, 0);
        let file = write_temp(&bytes);
        assert_eq!(detect(file.path()).unwrap(), ImageFormat::Zst);
    }

    #[test]
    fn test_detect_vhd_fixed() {
        let mut bytes = vec![0u8; 2048];
        bytes[510] = 0x55;
        bytes[511] = 0xAA;
        let footer_start = bytes.len() - 512;
        bytes[footer_start..footer_start + 8].copy_from_slice(b"conectix");
        let file = write_temp(&bytes);
        assert_eq!(detect(file.path()).unwrap(), ImageFormat::VhdFixed);
    }

    #[test]
    fn test_detect_qcow2() {
        let mut bytes = QCOW2_MAGIC.to_vec();
        bytes.resize(64, 0);
        let file = write_temp(&bytes);
        assert_eq!(detect(file.path()).unwrap(), ImageFormat::Qcow2);
    }

    #[test]
    fn test_detect_unrecognized() {
        let file = write_temp(&[0u8; 16]);
        assert!(detect(file.path()).is_err());
    }
}
