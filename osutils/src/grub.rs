use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Error};
use imgcust_api::model::GrubArg;
use log::trace;
use once_cell::sync::Lazy;
use regex::Regex;

/// Matches a GRUB `linux` (or `linux16`/`linuxefi`) command line, optionally
/// indented, capturing the kernel path and the remainder of the line as the
/// argument list. Continuation backslashes are joined into one logical line
/// before this pattern is applied.
static LINUX_LINE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*linux(?:16|efi)?\s+(\S+)(.*)$").expect("valid regex"));

/// Matches a `menuentry` opening line, capturing its title, to identify and
/// skip known recovery/rescue menu entries.
static MENUENTRY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?m)^\s*menuentry\s+['"]([^'"]*)['"]"#).expect("valid regex"));

/// Parsed `grub.cfg` contents: every top-level `linux` command found outside
/// a recovery menu entry, keyed by kernel path.
pub struct GrubConfig {
    path: PathBuf,
    contents: String,
}

impl GrubConfig {
    /// Load grub.cfg from a disk.
    pub fn read(path: impl AsRef<Path>) -> Result<Self, Error> {
        if !path.as_ref().exists() {
            bail!(
                "GRUB config does not exist at path: '{}'",
                path.as_ref().display()
            );
        }

        Ok(Self {
            path: path.as_ref().to_owned(),
            contents: fs::read_to_string(path.as_ref())
                .context(format!("Failed to read file '{}'", path.as_ref().display()))?,
        })
    }

    /// Parses every `linux` command line in the config, skipping menu entries
    /// whose title looks like a recovery/rescue entry, and returns the
    /// tokenized argument list for each kernel path found.
    pub fn kernel_command_lines(&self) -> Result<HashMap<String, Vec<GrubArg>>, Error> {
        let joined = join_continuations(&self.contents);
        let recovery_spans = recovery_menu_spans(&joined);

        let mut result = HashMap::new();
        for caps in LINUX_LINE_PATTERN.captures_iter(&joined) {
            let whole = caps.get(0).unwrap();
            if recovery_spans
                .iter()
                .any(|(start, end)| whole.start() >= *start && whole.start() < *end)
            {
                trace!("Skipping linux command line inside recovery menu entry");
                continue;
            }

            let kernel_path = caps.get(1).unwrap().as_str().to_string();
            let args_str = caps.get(2).unwrap().as_str();
            result.insert(kernel_path, tokenize(args_str));
        }

        if result.is_empty() {
            bail!("No linux command line found in '{}'", self.path.display());
        }

        Ok(result)
    }

    /// Requires exactly one kernel command line to be present, returning it.
    /// Most single-kernel GRUB configs (the common case this crate targets)
    /// satisfy this; multi-kernel configs should use `kernel_command_lines`
    /// directly and pick the entry that matters to the caller.
    pub fn single_kernel_command_line(&self) -> Result<Vec<GrubArg>, Error> {
        let mut all = self.kernel_command_lines()?;
        if all.len() > 1 {
            bail!(
                "Multiple linux command lines found in '{}'",
                self.path.display()
            );
        }
        Ok(all.drain().next().unwrap().1)
    }
}

/// Finds the byte spans of `menuentry { ... }` blocks whose title contains
/// "recovery" or "rescue" (case-insensitively), so their `linux` lines are
/// excluded from the result.
fn recovery_menu_spans(contents: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    for caps in MENUENTRY_PATTERN.captures_iter(contents) {
        let title = caps.get(1).unwrap().as_str().to_lowercase();
        if !title.contains("recovery") && !title.contains("rescue") {
            continue;
        }
        let start = caps.get(0).unwrap().end();
        if let Some(end) = matching_brace_end(contents, start) {
            spans.push((start, end));
        }
    }
    spans
}

/// Finds the end offset of the `{ ... }` block opened at or after `from`,
/// accounting for nested braces (GRUB's `if`/`submenu` blocks nest).
fn matching_brace_end(contents: &str, from: usize) -> Option<usize> {
    let bytes = contents.as_bytes();
    let open = bytes[from..].iter().position(|b| *b == b'{')? + from;
    let mut depth = 0i32;
    for (i, b) in bytes[open..].iter().enumerate() {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Joins GRUB script line continuations (a trailing `\`) into a single
/// logical line so the `linux` pattern matches arguments split across lines.
fn join_continuations(contents: &str) -> String {
    contents.replace("\\\n", " ")
}

/// Splits a kernel command line into tokens, respecting single- and
/// double-quoted substrings (GRUB and the Linux kernel both allow
/// `key="value with spaces"`).
fn tokenize(args_str: &str) -> Vec<GrubArg> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in args_str.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(parse_token(&current));
                    current.clear();
                }
            }
            None => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(parse_token(&current));
    }
    tokens
}

fn parse_token(raw: &str) -> GrubArg {
    match raw.split_once('=') {
        Some((key, value)) => GrubArg {
            key: key.to_string(),
            value: Some(value.to_string()),
            raw_token: raw.to_string(),
        },
        None => GrubArg {
            key: raw.to_string(),
            value: None,
            raw_token: raw.to_string(),
        },
    }
}

/// Looks up a single argument's value by key in an already-tokenized command
/// line. Errors if the key appears more than once with conflicting values,
/// since callers (e.g. the verity resolver) need a single authoritative
/// answer and a silent "last one wins" would hide a malformed config.
pub fn find_arg_value<'a>(args: &'a [GrubArg], key: &str) -> Result<Option<&'a str>, Error> {
    let matches: Vec<&GrubArg> = args.iter().filter(|a| a.key == key).collect();
    match matches.as_slice() {
        [] => Ok(None),
        [single] => Ok(single.value.as_deref()),
        multiple => {
            let values: Vec<&str> = multiple.iter().map(|a| a.raw_token.as_str()).collect();
            if values.iter().all(|v| *v == values[0]) {
                Ok(multiple[0].value.as_deref())
            } else {
                bail!("Conflicting values for kernel argument '{key}': {values:?}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_simple() {
        let args = tokenize("root=/dev/sda1 ro quiet splash");
        assert_eq!(args.len(), 4);
        assert_eq!(args[0].key, "root");
        assert_eq!(args[0].value.as_deref(), Some("/dev/sda1"));
        assert_eq!(args[1].key, "ro");
        assert_eq!(args[1].value, None);
    }

    #[test]
    fn test_tokenize_quoted_value() {
        let args = tokenize(r#"console=ttyS0 systemd.unit="multi user.target""#);
        assert_eq!(args[1].key, "systemd.unit");
        assert_eq!(args[1].value.as_deref(), Some("multi user.target"));
    }

    #[test]
    fn test_find_arg_value_single() {
        let args = tokenize("root=PARTUUID=abcd-1234 ro");
        assert_eq!(
            find_arg_value(&args, "root").unwrap(),
            Some("PARTUUID=abcd-1234")
        );
        assert_eq!(find_arg_value(&args, "missing").unwrap(), None);
    }

    #[test]
    fn test_find_arg_value_conflict() {
        let args = tokenize("foo=1 foo=2");
        assert!(find_arg_value(&args, "foo").is_err());
    }

    #[test]
    fn test_kernel_command_lines_skips_recovery_menu() {
        let contents = r#"
menuentry 'My OS' {
    linux /boot/vmlinuz root=/dev/sda1 ro
}
menuentry 'My OS (recovery mode)' {
    linux /boot/vmlinuz root=/dev/sda1 single
}
"#;
        let path = write_temp_grub_cfg(contents);
        let config = GrubConfig::read(&path).unwrap();
        let lines = config.kernel_command_lines().unwrap();
        assert_eq!(lines.len(), 1);
        let args = &lines["/boot/vmlinuz"];
        assert!(find_arg_value(args, "ro").unwrap().is_none());
        assert!(args.iter().any(|a| a.key == "ro"));
        assert!(!args.iter().any(|a| a.key == "single"));
    }

    #[test]
    fn test_kernel_command_lines_continuation() {
        let contents = "linux /boot/vmlinuz root=/dev/sda1 \\\n    ro quiet\n";
        let path = write_temp_grub_cfg(contents);
        let config = GrubConfig::read(&path).unwrap();
        let lines = config.kernel_command_lines().unwrap();
        let args = &lines["/boot/vmlinuz"];
        assert!(args.iter().any(|a| a.key == "quiet"));
    }

    #[test]
    fn test_single_kernel_command_line_rejects_multiple() {
        let contents = "linux /boot/vmlinuz-a root=/dev/sda1\nlinux /boot/vmlinuz-b root=/dev/sda2\n";
        let path = write_temp_grub_cfg(contents);
        let config = GrubConfig::read(&path).unwrap();
        assert!(config.single_kernel_command_line().is_err());
    }

    fn write_temp_grub_cfg(contents: &str) -> PathBuf {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grub.cfg");
        fs::write(&path, contents).unwrap();
        std::mem::forget(dir);
        path
    }
}
