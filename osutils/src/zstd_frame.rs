use std::io::{self, Read};

use anyhow::{bail, Context, Error};

/// Zstd skippable frame magic number range starts at `0x184D2A50`; the low
/// nibble (0x0-0xF) selects one of the 16 skippable frame IDs. This module
/// always uses the base ID.
const SKIPPABLE_MAGIC: u32 = 0x184D2A50;
const PAYLOAD_LEN: u32 = 16;
const FRAME_LEN: usize = 4 + 4 + PAYLOAD_LEN as usize;

/// Builds the 24-byte skippable frame that's prepended to every extracted,
/// zstd-compressed partition blob: 4-byte magic, 4-byte payload length (always
/// 16), then the 16-byte image UUID. A standard zstd decoder skips this frame
/// automatically; this crate's own reader uses it to recover the UUID without
/// decompressing the rest of the stream.
pub fn build_frame(image_uuid: &[u8; 16]) -> [u8; FRAME_LEN] {
    let mut frame = [0u8; FRAME_LEN];
    frame[0..4].copy_from_slice(&SKIPPABLE_MAGIC.to_le_bytes());
    frame[4..8].copy_from_slice(&PAYLOAD_LEN.to_le_bytes());
    frame[8..24].copy_from_slice(image_uuid);
    frame
}

/// Reads a skippable frame from the front of `reader` and returns the image
/// UUID it carries, leaving `reader` positioned right after the frame (at the
/// start of the real zstd stream).
pub fn read_frame(reader: &mut impl Read) -> Result<[u8; 16], Error> {
    let mut header = [0u8; 8];
    reader
        .read_exact(&mut header)
        .context("Failed to read skippable frame header")?;

    let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
    if magic != SKIPPABLE_MAGIC {
        bail!(
            "Expected skippable frame magic 0x{SKIPPABLE_MAGIC:08x}, found 0x{magic:08x}"
        );
    }

    let payload_len = u32::from_le_bytes(header[4..8].try_into().unwrap());
    if payload_len != PAYLOAD_LEN {
        bail!("Expected skippable frame payload length {PAYLOAD_LEN}, found {payload_len}");
    }

    let mut payload = [0u8; 16];
    reader
        .read_exact(&mut payload)
        .context("Failed to read skippable frame payload")?;

    Ok(payload)
}

/// Like `read_frame`, but tolerates a stream with no skippable frame at all
/// (the outer zstd stream starts immediately), returning `None` in that case.
/// Used when a compressed blob may have been produced by a tool other than
/// this crate's own extractor.
pub fn try_read_frame<R: Read>(reader: &mut R) -> Result<(Option<[u8; 16]>, Vec<u8>), Error> {
    let mut header = [0u8; 8];
    let n = read_fill(reader, &mut header)?;
    if n < 8 {
        return Ok((None, header[..n].to_vec()));
    }

    let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
    if magic != SKIPPABLE_MAGIC {
        return Ok((None, header.to_vec()));
    }

    let payload_len = u32::from_le_bytes(header[4..8].try_into().unwrap());
    if payload_len != PAYLOAD_LEN {
        return Ok((None, header.to_vec()));
    }

    let mut payload = [0u8; 16];
    reader
        .read_exact(&mut payload)
        .context("Failed to read skippable frame payload")?;

    Ok((Some(payload), Vec::new()))
}

fn read_fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}
