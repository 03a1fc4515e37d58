//! Node resolution: turning a mount-relative path into a typed node.
//!
//! ```text
//! /                         Top
//! /WELCOME.txt              static help text
//! /roots/<r>/...            mutable roots
//! /recent/<f>               recently committed versions
//! /date/<YYYY-MM-DD>/<f>    commits grouped by day
//! /tag/<t>/<r>/...          read-only snapshots of tagged roots
//! /sha1-<hex>/...           any stored blob, by digest
//! /.blobfs_stats/<counter>  counters (only when stats are enabled)
//! ```

use std::time::SystemTime;

use blobfs_cas::{Digest, DIGEST_HEX_LEN, DIGEST_PREFIX};

use crate::clock::{from_unix_secs, unix_secs};
use crate::context::FsContext;
use crate::error::{Result, VfsError};
use crate::schema::{DirectoryRecord, EntryKind};
use crate::tree::{FileMeta, Found};
use crate::views::{bucket_entries, date_buckets, ViewEntry};
use crate::welcome::WELCOME_TEXT;

pub const WELCOME_FILE: &str = "WELCOME.txt";
pub const ROOTS_DIR: &str = "roots";
pub const RECENT_DIR: &str = "recent";
pub const DATE_DIR: &str = "date";
pub const TAG_DIR: &str = "tag";
pub const STATS_DIR: &str = ".blobfs_stats";

/// Name listed at the top level to advertise digest browsing. It has the
/// shape of a digest ref but is not one, so it never resolves.
pub fn digest_placeholder() -> String {
    format!("{}{}", DIGEST_PREFIX, "x".repeat(DIGEST_HEX_LEN))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Top,
    Welcome,
    RootsDir,
    RecentDir,
    DateDir,
    DateBucket(String),
    TagDir,
    Tag(String),
    StatsDir,
    StatFile(String),
    ImmutableDir {
        digest: Digest,
        mtime: u64,
    },
    ImmutableFile {
        digest: Digest,
        size: u64,
        mtime: u64,
    },
    /// A directory inside a root; the empty path is the root itself.
    MutableDir {
        root: String,
        path: Vec<String>,
        mtime: u64,
    },
    MutableFile {
        root: String,
        path: Vec<String>,
        meta: FileMeta,
    },
}

impl Node {
    pub fn kind(&self) -> EntryKind {
        match self {
            Node::Welcome
            | Node::StatFile(_)
            | Node::ImmutableFile { .. }
            | Node::MutableFile { .. } => EntryKind::File,
            _ => EntryKind::Dir,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == EntryKind::Dir
    }
}

/// Attributes reported for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attr {
    pub kind: EntryKind,
    pub size: u64,
    pub mtime: SystemTime,
    pub perm: u16,
}

/// Split a mount-relative path into components, dropping empty and `.`
/// components.
pub fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .map(String::from)
        .collect()
}

pub(crate) fn resolve(ctx: &FsContext, path: &[String]) -> Result<Node> {
    let Some((first, rest)) = path.split_first() else {
        return Ok(Node::Top);
    };
    match first.as_str() {
        WELCOME_FILE => leaf(Node::Welcome, rest),
        ROOTS_DIR => resolve_roots(ctx, rest),
        RECENT_DIR => resolve_recent(ctx, rest),
        DATE_DIR => resolve_date(ctx, rest),
        TAG_DIR => resolve_tag(ctx, rest),
        STATS_DIR if ctx.stats.enabled() => resolve_stats(ctx, rest),
        name => match Digest::parse_ref(name) {
            Some(digest) if ctx.store.contains(&digest) => {
                resolve_immutable(ctx, digest, 0, rest)
            }
            _ => Err(VfsError::NotFound(name.to_string())),
        },
    }
}

/// `node` if nothing follows it; files cannot have children.
fn leaf(node: Node, rest: &[String]) -> Result<Node> {
    match rest.first() {
        None => Ok(node),
        Some(next) if node.is_dir() => Err(VfsError::NotFound(next.clone())),
        Some(next) => Err(VfsError::NotADirectory(next.clone())),
    }
}

fn resolve_roots(ctx: &FsContext, rest: &[String]) -> Result<Node> {
    let Some((name, inner)) = rest.split_first() else {
        return Ok(Node::RootsDir);
    };
    let root = ctx
        .roots
        .get(name)
        .ok_or_else(|| VfsError::NotFound(name.clone()))?;
    let tree = root.snapshot();
    Ok(match tree.find(inner)? {
        Found::Dir(dir) => Node::MutableDir {
            root: name.clone(),
            path: inner.to_vec(),
            mtime: dir.mtime(),
        },
        Found::File(meta) => Node::MutableFile {
            root: name.clone(),
            path: inner.to_vec(),
            meta: *meta,
        },
    })
}

fn immutable_file(digest: Digest, size: u64, mtime: u64) -> Node {
    Node::ImmutableFile {
        digest,
        size,
        mtime,
    }
}

fn view_file(entry: &ViewEntry) -> Node {
    immutable_file(entry.digest, entry.size, unix_secs(entry.time))
}

fn resolve_recent(ctx: &FsContext, rest: &[String]) -> Result<Node> {
    let Some((name, inner)) = rest.split_first() else {
        return Ok(Node::RecentDir);
    };
    let entries = ctx.recent.select(&ctx.activity.snapshot());
    let entry = entries
        .iter()
        .find(|e| &e.name == name)
        .ok_or_else(|| VfsError::NotFound(name.clone()))?;
    leaf(view_file(entry), inner)
}

fn resolve_date(ctx: &FsContext, rest: &[String]) -> Result<Node> {
    let Some((bucket, inner)) = rest.split_first() else {
        return Ok(Node::DateDir);
    };
    let events = ctx.activity.snapshot();
    if !ctx.dates.is_bucket(bucket) || !date_buckets(ctx.dates.as_ref(), &events).contains(bucket) {
        return Err(VfsError::NotFound(bucket.clone()));
    }
    let Some((name, inner)) = inner.split_first() else {
        return Ok(Node::DateBucket(bucket.clone()));
    };
    let entries = bucket_entries(ctx.dates.as_ref(), &events, bucket);
    let entry = entries
        .iter()
        .find(|e| &e.name == name)
        .ok_or_else(|| VfsError::NotFound(name.clone()))?;
    leaf(view_file(entry), inner)
}

fn resolve_tag(ctx: &FsContext, rest: &[String]) -> Result<Node> {
    let Some((tag, inner)) = rest.split_first() else {
        return Ok(Node::TagDir);
    };
    let members = ctx
        .tags
        .get(tag)
        .ok_or_else(|| VfsError::NotFound(tag.clone()))?;
    let Some((root_name, inner)) = inner.split_first() else {
        return Ok(Node::Tag(tag.clone()));
    };
    let root = members
        .iter()
        .find(|m| *m == root_name)
        .and_then(|m| ctx.roots.get(m))
        .ok_or_else(|| VfsError::NotFound(root_name.clone()))?;
    let tree = root.snapshot();
    resolve_immutable(ctx, tree.digest(), tree.mtime(), inner)
}

fn resolve_stats(ctx: &FsContext, rest: &[String]) -> Result<Node> {
    let Some((name, inner)) = rest.split_first() else {
        return Ok(Node::StatsDir);
    };
    if ctx.stats.snapshot(name).is_none() {
        return Err(VfsError::NotFound(name.clone()));
    }
    leaf(Node::StatFile(name.clone()), inner)
}

/// Walk an immutable tree starting at `digest`.
///
/// The starting blob is a directory if it decodes as one and a file
/// otherwise; below that, entry kinds come from the directory records.
fn resolve_immutable(ctx: &FsContext, digest: Digest, mtime: u64, rest: &[String]) -> Result<Node> {
    let store = ctx.store.as_ref();
    let Some(mut dir) = DirectoryRecord::sniff(store, &digest)? else {
        let size = store.size(&digest)?;
        return leaf(immutable_file(digest, size, mtime), rest);
    };
    let mut node = Node::ImmutableDir { digest, mtime };
    for (i, name) in rest.iter().enumerate() {
        let entry = dir
            .entries
            .get(name)
            .cloned()
            .ok_or_else(|| VfsError::NotFound(name.clone()))?;
        match entry.kind {
            EntryKind::File => {
                return leaf(
                    immutable_file(entry.digest, entry.size, entry.mtime),
                    &rest[i + 1..],
                );
            }
            EntryKind::Dir => {
                dir = DirectoryRecord::decode_strict(&store.get(&entry.digest)?, &entry.digest)?;
                node = Node::ImmutableDir {
                    digest: entry.digest,
                    mtime: entry.mtime,
                };
            }
        }
    }
    Ok(node)
}

pub(crate) fn attr(ctx: &FsContext, node: &Node) -> Result<Attr> {
    const RO_DIR: u16 = 0o555;
    const RO_FILE: u16 = 0o444;
    let dir = |mtime: SystemTime, perm: u16| Attr {
        kind: EntryKind::Dir,
        size: 0,
        mtime,
        perm,
    };
    let file = |size: u64, mtime: SystemTime, perm: u16| Attr {
        kind: EntryKind::File,
        size,
        mtime,
        perm,
    };
    // Blobs reached by digest carry no mtime of their own, and mtimes
    // read from stored records may be out of range.
    let at = |secs: u64| match secs {
        0 => ctx.started,
        secs => from_unix_secs(secs).unwrap_or(ctx.started),
    };
    Ok(match node {
        Node::Top
        | Node::RecentDir
        | Node::DateDir
        | Node::DateBucket(_)
        | Node::TagDir
        | Node::Tag(_)
        | Node::StatsDir => dir(ctx.started, RO_DIR),
        Node::RootsDir => dir(ctx.started, 0o755),
        Node::Welcome => file(WELCOME_TEXT.len() as u64, ctx.started, RO_FILE),
        Node::StatFile(name) => {
            let size = ctx.stats.render(name).map(|s| s.len()).unwrap_or(0);
            file(size as u64, ctx.now(), RO_FILE)
        }
        Node::ImmutableDir { mtime, .. } => dir(at(*mtime), RO_DIR),
        Node::ImmutableFile { size, mtime, .. } => file(*size, at(*mtime), RO_FILE),
        Node::MutableDir { mtime, .. } => dir(at(*mtime), 0o755),
        Node::MutableFile { meta, .. } => file(meta.size, at(meta.mtime), 0o644),
    })
}
