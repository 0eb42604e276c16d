//! Mount table introspection via `/proc/self/mountinfo`.

use std::path::{Path, PathBuf};

use stratum_core::error::{Result, StratumError};

const MOUNTINFO: &str = "/proc/self/mountinfo";

/// One mount as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub target: PathBuf,
    pub fs_type: String,
    /// Overlay upper directory
    pub upper: Option<PathBuf>,
    /// Overlay lowers, most recently added last
    pub lowers: Vec<PathBuf>,
}

impl MountInfo {
    pub fn is_overlay(&self) -> bool {
        self.fs_type == "overlay"
    }
}

/// Parse mountinfo text. Malformed lines are skipped.
pub fn parse_mountinfo(text: &str) -> Vec<MountInfo> {
    text.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<MountInfo> {
    // <id> <parent> <maj:min> <root> <target> <opts> [optional...] - <fstype> <source> <super opts>
    let (head, tail) = line.split_once(" - ")?;
    let target = head.split_whitespace().nth(4)?;

    let mut tail = tail.split_whitespace();
    let fs_type = tail.next()?.to_string();
    let _source = tail.next()?;
    let super_opts = tail.next().unwrap_or("");

    let mut upper = None;
    let mut lowers = Vec::new();
    for opt in super_opts.split(',') {
        if let Some(value) = opt.strip_prefix("upperdir=") {
            upper = Some(PathBuf::from(unescape(value)));
        } else if let Some(value) = opt.strip_prefix("lowerdir=") {
            // Overlay lists the top-most lower first.
            lowers = value
                .split(':')
                .filter(|l| !l.is_empty())
                .map(|l| PathBuf::from(unescape(l)))
                .rev()
                .collect();
        }
    }

    Some(MountInfo {
        target: PathBuf::from(unescape(target)),
        fs_type,
        upper,
        lowers,
    })
}

/// Decode the `\ooo` octal escapes the kernel uses for whitespace.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits.iter().fold(0u32, |acc, b| acc * 8 + (b - b'0') as u32);
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Read and parse the current process's mount table.
pub fn read_mount_table() -> Result<Vec<MountInfo>> {
    let text = std::fs::read_to_string(MOUNTINFO).map_err(|e| {
        StratumError::mount(MOUNTINFO, format!("Failed to read mount table: {}", e))
    })?;
    Ok(parse_mountinfo(&text))
}

/// Top-most mount at `target` within a parsed table.
pub fn find_mount<'a>(table: &'a [MountInfo], target: &Path) -> Option<&'a MountInfo> {
    table.iter().rev().find(|m| m.target == target)
}

/// Whether `target` is mounted, and with what composition. The kernel
/// reports absolute, resolved paths, so `target` is resolved first.
pub fn mount_details(target: &Path) -> Result<Option<MountInfo>> {
    let table = read_mount_table()?;
    Ok(find_mount(&table, &resolve_path(target)).cloned())
}

/// `path` made absolute with symlinks resolved, or unchanged when it
/// cannot be resolved.
pub fn resolve_path(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Overlay mounts whose target lies under `root`.
pub fn overlays_under(table: &[MountInfo], root: &Path) -> Vec<MountInfo> {
    table
        .iter()
        .filter(|m| m.is_overlay() && m.target.starts_with(root))
        .cloned()
        .collect()
}
