//! Mount table probing.
//!
//! A mount point is considered backed by blobfs when `/proc/self/mountinfo`
//! lists it with filesystem type `fuse.<fs_name>`, or type `fuse` with
//! `<fs_name>` as the mount source.

use std::path::{Path, PathBuf};

const MOUNTINFO: &str = "/proc/self/mountinfo";

/// One line of `mountinfo`, reduced to what matching needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub source: String,
}

impl MountEntry {
    pub fn is_served_by(&self, fs_name: &str) -> bool {
        match self.fs_type.strip_prefix("fuse.") {
            Some(subtype) => subtype == fs_name,
            None => self.fs_type == "fuse" && self.source == fs_name,
        }
    }
}

/// Parse `mountinfo` text. Malformed lines are skipped.
///
/// Format: `id parent major:minor root mount_point options [optional...] - fs_type source super_options`
pub fn parse_mountinfo(text: &str) -> Vec<MountEntry> {
    text.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<MountEntry> {
    let (head, tail) = line.split_once(" - ")?;
    let mount_point = head.split(' ').nth(4)?;
    let mut tail = tail.split(' ');
    let fs_type = tail.next()?;
    let source = tail.next().unwrap_or_default();
    Some(MountEntry {
        mount_point: PathBuf::from(unescape(mount_point)),
        fs_type: unescape(fs_type),
        source: unescape(source),
    })
}

/// Undo the kernel's octal escaping of space, tab, newline and backslash.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let v = digits.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(v) = u8::try_from(v) {
                    out.push(v);
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

/// Whether `mount_point` is currently backed by `fs_name`, according to
/// the given mount table.
pub fn is_mounted_in(entries: &[MountEntry], mount_point: &Path, fs_name: &str) -> bool {
    // Stacked mounts: the last entry for a path is the visible one.
    entries
        .iter()
        .rev()
        .find(|e| e.mount_point == mount_point)
        .is_some_and(|e| e.is_served_by(fs_name))
}

/// Whether `mount_point` is currently backed by `fs_name` in this process's
/// mount namespace. An unreadable mount table counts as not mounted.
pub fn is_mounted(mount_point: &Path, fs_name: &str) -> bool {
    match std::fs::read_to_string(MOUNTINFO) {
        Ok(text) => is_mounted_in(&parse_mountinfo(&text), mount_point, fs_name),
        Err(_) => false,
    }
}
