//! Inode numbers for mount-relative paths.
//!
//! The kernel names files by 64-bit inode; the filesystem engine names them
//! by path. Inodes are handed out on first lookup and follow their path
//! through renames.

use std::collections::HashMap;

#[derive(Debug)]
pub struct InodeTable {
    path_to_inode: HashMap<String, u64>,
    inode_to_path: HashMap<u64, String>,
    next_inode: u64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    /// Root inode number (always 1 in FUSE)
    pub const ROOT_INODE: u64 = 1;

    pub fn new() -> Self {
        let mut table = Self {
            path_to_inode: HashMap::new(),
            inode_to_path: HashMap::new(),
            next_inode: 2,
        };
        table.path_to_inode.insert("/".to_string(), Self::ROOT_INODE);
        table.inode_to_path.insert(Self::ROOT_INODE, "/".to_string());
        table
    }

    pub fn get_or_create(&mut self, path: &str) -> u64 {
        let normalized = normalize_path(path);
        if let Some(&inode) = self.path_to_inode.get(&normalized) {
            return inode;
        }
        let inode = self.next_inode;
        self.next_inode += 1;
        self.path_to_inode.insert(normalized.clone(), inode);
        self.inode_to_path.insert(inode, normalized);
        inode
    }

    pub fn get_inode(&self, path: &str) -> Option<u64> {
        self.path_to_inode.get(&normalize_path(path)).copied()
    }

    pub fn get_path(&self, inode: u64) -> Option<&str> {
        self.inode_to_path.get(&inode).map(String::as_str)
    }

    /// Path of `name` inside the directory `parent`.
    pub fn child_path(&self, parent: u64, name: &str) -> Option<String> {
        let parent = self.get_path(parent)?;
        Some(join(parent, name))
    }

    /// Forget a path and everything below it.
    pub fn remove_by_path(&mut self, path: &str) -> Option<u64> {
        let normalized = normalize_path(path);
        let prefix = format!("{}/", normalized);
        let below: Vec<String> = self
            .path_to_inode
            .keys()
            .filter(|p| p.starts_with(&prefix))
            .cloned()
            .collect();
        for p in below {
            if let Some(inode) = self.path_to_inode.remove(&p) {
                self.inode_to_path.remove(&inode);
            }
        }
        let inode = self.path_to_inode.remove(&normalized)?;
        self.inode_to_path.remove(&inode);
        Some(inode)
    }

    /// Move a path, and every path below it, to `new_path`.
    ///
    /// Whatever was known at `new_path` is forgotten first, as the rename
    /// replaced it.
    pub fn rename(&mut self, old_path: &str, new_path: &str) -> Option<u64> {
        let old = normalize_path(old_path);
        let new = normalize_path(new_path);
        if old == new {
            return self.path_to_inode.get(&old).copied();
        }
        self.remove_by_path(&new);

        let prefix = format!("{}/", old);
        let moved: Vec<(String, u64)> = self
            .path_to_inode
            .iter()
            .filter(|(p, _)| **p == old || p.starts_with(&prefix))
            .map(|(p, i)| (p.clone(), *i))
            .collect();
        for (path, inode) in &moved {
            self.path_to_inode.remove(path);
            let renamed = format!("{}{}", new, &path[old.len()..]);
            self.inode_to_path.insert(*inode, renamed.clone());
            self.path_to_inode.insert(renamed, *inode);
        }
        self.path_to_inode.get(&new).copied()
    }

    pub fn len(&self) -> usize {
        self.inode_to_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inode_to_path.is_empty()
    }

    /// Get the parent path of a given path
    pub fn parent_path(path: &str) -> String {
        let normalized = normalize_path(path);
        match normalized.rfind('/') {
            Some(0) | None => "/".to_string(),
            Some(pos) => normalized[..pos].to_string(),
        }
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Leading slash, no trailing slash, `/` for the root.
fn normalize_path(path: &str) -> String {
    let path = path.trim();
    if path.is_empty() || path == "/" {
        return "/".to_string();
    }
    let mut normalized = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    while normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_is_preregistered() {
        let table = InodeTable::new();
        assert_eq!(table.get_path(InodeTable::ROOT_INODE), Some("/"));
        assert_eq!(table.get_inode(""), Some(InodeTable::ROOT_INODE));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_get_or_create_is_stable() {
        let mut table = InodeTable::new();
        let a = table.get_or_create("/roots/r");
        let b = table.get_or_create("roots/r/");
        assert_eq!(a, b);
        assert_ne!(a, InodeTable::ROOT_INODE);
        assert_eq!(table.get_path(a), Some("/roots/r"));
    }

    #[test]
    fn test_child_path() {
        let mut table = InodeTable::new();
        assert_eq!(
            table.child_path(InodeTable::ROOT_INODE, "roots").as_deref(),
            Some("/roots")
        );
        let roots = table.get_or_create("/roots");
        assert_eq!(table.child_path(roots, "r").as_deref(), Some("/roots/r"));
        assert_eq!(table.child_path(999, "x"), None);
    }

    #[test]
    fn test_remove_drops_descendants() {
        let mut table = InodeTable::new();
        let dir = table.get_or_create("/roots/r/dir");
        let file = table.get_or_create("/roots/r/dir/file");
        let sibling = table.get_or_create("/roots/r/dir2");

        assert_eq!(table.remove_by_path("/roots/r/dir"), Some(dir));
        assert_eq!(table.get_path(file), None);
        assert_eq!(table.get_path(sibling), Some("/roots/r/dir2"));
    }

    #[test]
    fn test_rename_moves_subtree() {
        let mut table = InodeTable::new();
        let dir = table.get_or_create("/roots/r/a");
        let file = table.get_or_create("/roots/r/a/f");
        let replaced = table.get_or_create("/roots/r/b");

        assert_eq!(table.rename("/roots/r/a", "/roots/r/b"), Some(dir));
        assert_eq!(table.get_path(dir), Some("/roots/r/b"));
        assert_eq!(table.get_path(file), Some("/roots/r/b/f"));
        assert_eq!(table.get_path(replaced), None);
        assert_eq!(table.get_inode("/roots/r/a"), None);
    }

    #[test]
    fn test_parent_path() {
        assert_eq!(InodeTable::parent_path("/roots/r/f"), "/roots/r");
        assert_eq!(InodeTable::parent_path("/roots"), "/");
        assert_eq!(InodeTable::parent_path("/"), "/");
    }
}
