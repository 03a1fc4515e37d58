//! Directory listings for every directory node.

use crate::context::FsContext;
use crate::error::{Result, VfsError};
use crate::node::{
    digest_placeholder, Node, DATE_DIR, RECENT_DIR, ROOTS_DIR, TAG_DIR, WELCOME_FILE,
};
use crate::schema::{DirectoryRecord, EntryKind};
use crate::tree::Found;
use crate::views::{bucket_entries, date_buckets};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub name: String,
    pub kind: EntryKind,
}

impl Listing {
    fn file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::File,
        }
    }

    fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Dir,
        }
    }
}

/// The fixed top-level listing, sorted by name.
///
/// The stats directory resolves when stats are enabled but is never listed.
pub fn top_level() -> Vec<Listing> {
    let mut names = vec![
        Listing::file(WELCOME_FILE),
        Listing::dir(DATE_DIR),
        Listing::dir(RECENT_DIR),
        Listing::dir(ROOTS_DIR),
        Listing::dir(digest_placeholder()),
        Listing::dir(TAG_DIR),
    ];
    names.sort_by(|a, b| a.name.cmp(&b.name));
    names
}

/// Entries of a directory node, excluding `.` and `..`.
///
/// Views list in their policy's order; every other directory lists
/// sorted by name.
pub(crate) fn list(ctx: &FsContext, node: &Node) -> Result<Vec<Listing>> {
    Ok(match node {
        Node::Top => top_level(),
        Node::RootsDir => ctx.roots.names().into_iter().map(Listing::dir).collect(),
        Node::RecentDir => ctx
            .recent
            .select(&ctx.activity.snapshot())
            .into_iter()
            .map(|e| Listing::file(e.name))
            .collect(),
        Node::DateDir => date_buckets(ctx.dates.as_ref(), &ctx.activity.snapshot())
            .into_iter()
            .map(Listing::dir)
            .collect(),
        Node::DateBucket(bucket) => {
            bucket_entries(ctx.dates.as_ref(), &ctx.activity.snapshot(), bucket)
                .into_iter()
                .map(|e| Listing::file(e.name))
                .collect()
        }
        Node::TagDir => ctx.tags.keys().cloned().map(Listing::dir).collect(),
        Node::Tag(tag) => {
            let mut members: Vec<_> = ctx
                .tags
                .get(tag)
                .into_iter()
                .flatten()
                .filter(|name| ctx.roots.get(name).is_some())
                .cloned()
                .collect();
            members.sort();
            members.dedup();
            members.into_iter().map(Listing::dir).collect()
        }
        Node::StatsDir => ctx.stats.names().into_iter().map(Listing::file).collect(),
        Node::ImmutableDir { digest, .. } => {
            let bytes = ctx.store.get(digest)?;
            DirectoryRecord::decode_strict(&bytes, digest)?
                .entries
                .into_iter()
                .map(|(name, rec)| Listing {
                    name,
                    kind: rec.kind,
                })
                .collect()
        }
        Node::MutableDir { root, path, .. } => {
            let root = ctx
                .roots
                .get(root)
                .ok_or_else(|| VfsError::NotFound(root.clone()))?;
            let tree = root.snapshot();
            match tree.find(path)? {
                Found::Dir(dir) => dir
                    .entries()
                    .iter()
                    .map(|(name, entry)| Listing {
                        name: name.clone(),
                        kind: entry.kind(),
                    })
                    .collect(),
                Found::File(_) => return Err(VfsError::NotADirectory(path.join("/"))),
            }
        }
        Node::Welcome
        | Node::StatFile(_)
        | Node::ImmutableFile { .. }
        | Node::MutableFile { .. } => {
            return Err(VfsError::NotADirectory(format!("{:?}", node.kind())))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_level_is_sorted_and_fixed() {
        let names: Vec<_> = top_level().into_iter().map(|l| l.name).collect();
        assert_eq!(
            names,
            vec![
                "WELCOME.txt".to_string(),
                "date".to_string(),
                "recent".to_string(),
                "roots".to_string(),
                digest_placeholder(),
                "tag".to_string(),
            ]
        );
    }
}
