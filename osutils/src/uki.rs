use std::{fs, path::Path};

use anyhow::{bail, Context, Error};
use goblin::pe::PE;

/// Name of the PE section systemd-stub embeds the kernel command line in.
const CMDLINE_SECTION: &str = ".cmdline";

/// Reads the embedded kernel command line out of a Unified Kernel Image: a
/// single PE executable with a `.cmdline` section holding the raw argument
/// string, as produced by `systemd-stub`/`ukify`.
///
/// The file is first copied to a writable scratch location and read back
/// from there, never opened for write against the original, so nothing in
/// this path can tamper with the UKI's signature. The whole copy is read
/// into memory; UKIs are kernel-sized (tens of MB), which is small enough
/// that streaming the PE header isn't worth the complexity.
pub fn read_cmdline(uki_path: &Path) -> Result<String, Error> {
    let scratch_dir = tempfile::tempdir().context("Failed to create UKI scratch directory")?;
    let scratch_path = scratch_dir.path().join("uki.efi");
    fs::copy(uki_path, &scratch_path).context(format!(
        "Failed to copy UKI file '{}' to scratch location",
        uki_path.display()
    ))?;

    let bytes = fs::read(&scratch_path).context(format!(
        "Failed to read UKI scratch copy of '{}'",
        uki_path.display()
    ))?;

    let pe = PE::parse(&bytes).context(format!(
        "Failed to parse '{}' as a PE executable",
        uki_path.display()
    ))?;

    let section = pe
        .sections
        .iter()
        .find(|s| s.name().map(|n| n == CMDLINE_SECTION).unwrap_or(false))
        .context(format!(
            "No '{CMDLINE_SECTION}' section found in UKI '{}'",
            uki_path.display()
        ))?;

    let start = section.pointer_to_raw_data as usize;
    let len = section.size_of_raw_data as usize;
    let end = start
        .checked_add(len)
        .filter(|end| *end <= bytes.len())
        .context(format!(
            "'{CMDLINE_SECTION}' section in '{}' extends past end of file",
            uki_path.display()
        ))?;

    let raw = &bytes[start..end];
    let text = std::str::from_utf8(raw)
        .context(format!(
            "'{CMDLINE_SECTION}' section in '{}' is not valid UTF-8",
            uki_path.display()
        ))?
        .trim_end_matches('\0')
        .trim();

    if text.is_empty() {
        bail!(
            "'{CMDLINE_SECTION}' section in '{}' is empty",
            uki_path.display()
        );
    }

    Ok(text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_cmdline_rejects_non_pe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-uki");
        fs::write(&path, b"not a PE file at all").unwrap();
        assert!(read_cmdline(&path).is_err());
    }

    #[test]
    fn test_read_cmdline_rejects_missing_file() {
        assert!(read_cmdline(Path::new("/nonexistent/uki.efi")).is_err());
    }
}
