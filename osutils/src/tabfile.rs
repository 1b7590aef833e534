use std::path::Path;

use anyhow::{bail, Context, Error};
use imgcust_api::model::{FstabEntry, MountSource};

/// A parsed `/etc/fstab`, preserving enough of the original text that
/// unrelated columns survive a rewrite byte-for-byte.
#[derive(Debug, Default)]
pub struct TabFile {
    lines: Vec<TabLine>,
}

/// One physical line of the file: either an entry with its original field
/// spans recorded, or an opaque line (blank/comment) kept verbatim.
#[derive(Debug)]
enum TabLine {
    Entry {
        entry: FstabEntry,
        raw: String,
        /// Byte range of the source field within `raw`, so `rewrite_sources`
        /// can substitute just that span and leave everything else (interior
        /// whitespace included) untouched.
        source_span: (usize, usize),
    },
    Verbatim(String),
}

impl TabFile {
    /// Parses an existing fstab's contents, keeping each entry's original
    /// line so a later `rewrite_sources` call can touch only the source
    /// column.
    pub fn parse(contents: &str) -> Result<Self, Error> {
        let mut lines = Vec::new();
        for raw in contents.lines() {
            let trimmed = raw.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                lines.push(TabLine::Verbatim(raw.to_string()));
                continue;
            }

            let (entry, source_span) = parse_entry_line(raw)
                .context(format!("Failed to parse fstab line: '{raw}'"))?;
            lines.push(TabLine::Entry {
                entry,
                raw: raw.to_string(),
                source_span,
            });
        }
        Ok(Self { lines })
    }

    /// Reads and parses a fstab file from disk.
    pub fn read(path: impl AsRef<Path>) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path.as_ref())
            .context(format!("Failed to read '{}'", path.as_ref().display()))?;
        Self::parse(&contents)
    }

    /// All non-pseudo-filesystem entries, in file order.
    pub fn entries(&self) -> impl Iterator<Item = &FstabEntry> {
        self.lines.iter().filter_map(|l| match l {
            TabLine::Entry { entry, .. } => Some(entry),
            TabLine::Verbatim(_) => None,
        })
    }

    /// Rewrites every entry's source field using `resolve`, which maps an old
    /// source to its replacement (or `None` to leave the entry untouched,
    /// e.g. `PARTLABEL=`/`/dev` sources per the fstab rewrite protocol).
    /// Every other column, and all original whitespace around the source
    /// field, is preserved bit-exact.
    pub fn rewrite_sources(
        &mut self,
        mut resolve: impl FnMut(&MountSource) -> Option<MountSource>,
    ) {
        for line in &mut self.lines {
            if let TabLine::Entry {
                entry,
                raw,
                source_span,
            } = line
            {
                let Some(new_source) = resolve(&entry.source) else {
                    continue;
                };
                let rendered = new_source.render();
                let (start, end) = *source_span;
                raw.replace_range(start..end, &rendered);
                *source_span = (start, start + rendered.len());
                entry.source = new_source;
            }
        }
    }

    /// Renders the file back to text, byte-identical to the input wherever
    /// `rewrite_sources` made no change.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            let text = match line {
                TabLine::Entry { raw, .. } => raw.as_str(),
                TabLine::Verbatim(raw) => raw.as_str(),
            };
            out.push_str(text);
            out.push('\n');
        }
        out
    }

    /// Writes this fstab back to disk.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        std::fs::write(path.as_ref(), self.render())
            .context(format!("Failed to write '{}'", path.as_ref().display()))
    }
}

/// Splits one fstab entry line into its six whitespace-separated fields and
/// records the byte span of the first (source) field within the original
/// string, so callers can substitute in place.
fn parse_entry_line(raw: &str) -> Result<(FstabEntry, (usize, usize)), Error> {
    let mut fields = Vec::new();
    let mut idx = 0;
    let bytes = raw.as_bytes();
    while idx < bytes.len() {
        while idx < bytes.len() && bytes[idx].is_ascii_whitespace() {
            idx += 1;
        }
        if idx >= bytes.len() {
            break;
        }
        let start = idx;
        while idx < bytes.len() && !bytes[idx].is_ascii_whitespace() {
            idx += 1;
        }
        fields.push((start, idx));
    }

    if fields.len() < 4 {
        bail!("expected at least 4 fields, found {}", fields.len());
    }

    let field_str = |i: usize| -> &str { &raw[fields[i].0..fields[i].1] };

    let source = MountSource::parse(field_str(0));
    let target = field_str(1).into();
    let fs_type = field_str(2).to_string();
    let (vfs_flags, fs_options) = split_options(field_str(3));
    let dump = fields
        .get(4)
        .map(|_| field_str(4).parse())
        .transpose()
        .context("invalid dump field")?
        .unwrap_or(0);
    let pass = fields
        .get(5)
        .map(|_| field_str(5).parse())
        .transpose()
        .context("invalid pass field")?
        .unwrap_or(0);

    let entry = FstabEntry {
        source,
        target,
        fs_type,
        vfs_flags,
        fs_options,
        dump,
        pass,
    };

    Ok((entry, fields[0]))
}

/// Names `mount(8)` recognizes as generic, filesystem-independent VFS flags
/// (its "FILESYSTEM INDEPENDENT MOUNT OPTIONS") rather than options a
/// specific filesystem driver interprets (`subvol=`, `data=ordered`, ...).
/// Anything not in this set is passed through to the filesystem untouched.
const VFS_FLAG_OPTIONS: &[&str] = &[
    "defaults", "ro", "rw", "exec", "noexec", "suid", "nosuid", "dev", "nodev", "auto", "noauto",
    "nouser", "user", "users", "owner", "group", "atime", "noatime", "diratime", "nodiratime",
    "relatime", "norelatime", "strictatime", "nostrictatime", "lazytime", "nolazytime", "sync",
    "async", "dirsync", "mand", "nomand", "remount", "bind", "rbind", "_netdev", "nofail",
    "iversion", "noiversion",
];

/// Splits a comma-separated fstab options column into its VFS-flag and
/// filesystem-specific parts, per `FstabEntry`'s two-field model.
fn split_options(options_raw: &str) -> (Vec<String>, Vec<String>) {
    let mut vfs_flags = Vec::new();
    let mut fs_options = Vec::new();
    for option in options_raw.split(',') {
        if VFS_FLAG_OPTIONS.contains(&option) {
            vfs_flags.push(option.to_string());
        } else {
            fs_options.push(option.to_string());
        }
    }
    (vfs_flags, fs_options)
}
