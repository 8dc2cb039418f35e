//! Content-addressed Merkle tree over file records.
//!
//! A file leaf hashes its content hash; a directory hashes its children
//! (name, hash) pairs in name order. Trees are immutable and share unchanged
//! subtrees through `Arc`, so rebuilding after a small change only allocates
//! the nodes on the changed paths.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::record::FileRecord;

/// 32-byte SHA-256 hash used throughout the tree.
pub type MerkleHash = [u8; 32];

/// Directory children are keyed with a trailing `/` so a file and a
/// directory with the same name never collide.
const DIR_SUFFIX: char = '/';

/// A node in the content-addressed tree.
#[derive(Debug)]
pub enum MerkleNode {
    /// A file leaf.
    File {
        hash: MerkleHash,
        path: Arc<str>,
        content_hash: String,
    },
    /// A directory with its children sorted by name.
    Directory {
        hash: MerkleHash,
        children: BTreeMap<String, Arc<MerkleNode>>,
    },
}

impl MerkleNode {
    /// Hash of this node.
    pub fn hash(&self) -> MerkleHash {
        match self {
            Self::File { hash, .. } | Self::Directory { hash, .. } => *hash,
        }
    }

    fn file(path: &str, content_hash: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"blob\0");
        hasher.update(content_hash.as_bytes());
        Self::File {
            hash: hasher.finalize().into(),
            path: Arc::from(path),
            content_hash: content_hash.to_string(),
        }
    }

    fn directory(children: BTreeMap<String, Arc<MerkleNode>>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"tree\0");
        for (name, child) in &children {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update(child.hash());
        }
        Self::Directory {
            hash: hasher.finalize().into(),
            children,
        }
    }

    fn is_file_for(&self, record: &FileRecord) -> bool {
        match self {
            Self::File {
                path, content_hash, ..
            } => &**path == record.path.as_str() && *content_hash == record.content_hash,
            Self::Directory { .. } => false,
        }
    }

    fn children(&self) -> Option<&BTreeMap<String, Arc<MerkleNode>>> {
        match self {
            Self::Directory { children, .. } => Some(children),
            Self::File { .. } => None,
        }
    }

    /// Push the paths of every file below this node.
    fn collect_files(&self, out: &mut Vec<String>) {
        match self {
            Self::File { path, .. } => out.push(path.to_string()),
            Self::Directory { children, .. } => {
                for child in children.values() {
                    child.collect_files(out);
                }
            }
        }
    }

    fn file_count(&self) -> usize {
        match self {
            Self::File { .. } => 1,
            Self::Directory { children, .. } => children.values().map(|c| c.file_count()).sum(),
        }
    }
}

/// Files that differ between two trees.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Paths only present in the newer tree.
    pub added: Vec<String>,
    /// Paths present in both with a different content hash.
    pub modified: Vec<String>,
    /// Paths only present in the older tree.
    pub removed: Vec<String>,
}

impl ChangeSet {
    /// True when nothing changed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// Total number of changed paths.
    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }

    fn sort(&mut self) {
        self.added.sort();
        self.modified.sort();
        self.removed.sort();
    }
}

/// An immutable Merkle tree.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    root: Arc<MerkleNode>,
}

impl MerkleTree {
    /// A tree with no files.
    pub fn empty() -> Self {
        Self {
            root: Arc::new(MerkleNode::directory(BTreeMap::new())),
        }
    }

    /// Build a tree from scratch.
    pub fn build<'a>(records: impl IntoIterator<Item = &'a FileRecord>) -> Self {
        Self::empty().rebuild(records)
    }

    /// Build a tree for `records`, reusing every subtree of `self` whose
    /// content is unchanged.
    pub fn rebuild<'a>(&self, records: impl IntoIterator<Item = &'a FileRecord>) -> Self {
        let mut builder = DirBuilder::default();
        for record in records {
            builder.insert(&components(&record.path), record);
        }
        Self {
            root: builder.finish(Some(&self.root)),
        }
    }

    /// Return a new tree with `updated` inserted or replaced and `removed`
    /// deleted. Only the nodes on the touched paths are reallocated.
    pub fn apply<'a>(
        &self,
        updated: impl IntoIterator<Item = &'a FileRecord>,
        removed: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let mut root = Arc::clone(&self.root);
        for path in removed {
            root = remove_path(&root, &components(path)).unwrap_or_else(|| {
                Arc::new(MerkleNode::directory(BTreeMap::new()))
            });
        }
        for record in updated {
            root = insert_path(
                Some(&root),
                &components(&record.path),
                &record.path,
                &record.content_hash,
            );
        }
        Self { root }
    }

    /// Root node.
    pub fn root(&self) -> &Arc<MerkleNode> {
        &self.root
    }

    /// Root hash.
    pub fn root_hash(&self) -> MerkleHash {
        self.root.hash()
    }

    /// Root hash as lowercase hex.
    pub fn root_hex(&self) -> String {
        hex(&self.root_hash())
    }

    /// Number of files in the tree.
    pub fn file_count(&self) -> usize {
        self.root.file_count()
    }

    /// Files that changed going from `self` to `newer`.
    ///
    /// Directories are compared top-down and equal subtrees are skipped, so
    /// the work is proportional to the changed files and directories.
    pub fn diff(&self, newer: &MerkleTree) -> ChangeSet {
        let mut changes = ChangeSet::default();
        diff_nodes(Some(&self.root), Some(&newer.root), &mut changes);
        changes.sort();
        changes
    }
}

impl Default for MerkleTree {
    fn default() -> Self {
        Self::empty()
    }
}

/// Lowercase hex encoding of a hash.
pub fn hex(hash: &MerkleHash) -> String {
    hash.iter().map(|b| format!("{b:02x}")).collect()
}

fn components(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}

fn dir_key(name: &str) -> String {
    format!("{name}{DIR_SUFFIX}")
}

fn diff_nodes(old: Option<&Arc<MerkleNode>>, new: Option<&Arc<MerkleNode>>, out: &mut ChangeSet) {
    match (old, new) {
        (Some(a), Some(b)) if a.hash() == b.hash() => {}
        (Some(a), Some(b)) => match (a.children(), b.children()) {
            (Some(old_children), Some(new_children)) => {
                let names: BTreeSet<&String> =
                    old_children.keys().chain(new_children.keys()).collect();
                for name in names {
                    diff_nodes(old_children.get(name), new_children.get(name), out);
                }
            }
            (None, None) => b.collect_files(&mut out.modified),
            _ => {
                a.collect_files(&mut out.removed);
                b.collect_files(&mut out.added);
            }
        },
        (Some(a), None) => a.collect_files(&mut out.removed),
        (None, Some(b)) => b.collect_files(&mut out.added),
        (None, None) => {}
    }
}

fn insert_path(
    node: Option<&Arc<MerkleNode>>,
    comps: &[&str],
    path: &str,
    content_hash: &str,
) -> Arc<MerkleNode> {
    let mut children = node
        .and_then(|n| n.children())
        .cloned()
        .unwrap_or_default();

    match comps {
        [] => return Arc::new(MerkleNode::file(path, content_hash)),
        [name] => {
            children.insert(
                (*name).to_string(),
                Arc::new(MerkleNode::file(path, content_hash)),
            );
        }
        [name, rest @ ..] => {
            let key = dir_key(name);
            let child = insert_path(children.get(&key), rest, path, content_hash);
            children.insert(key, child);
        }
    }
    Arc::new(MerkleNode::directory(children))
}

/// Remove a file; returns `None` when the node becomes empty.
fn remove_path(node: &Arc<MerkleNode>, comps: &[&str]) -> Option<Arc<MerkleNode>> {
    let Some(existing) = node.children() else {
        return Some(Arc::clone(node));
    };
    let mut children = existing.clone();
    match comps {
        [] => return Some(Arc::clone(node)),
        [name] => {
            if children.remove(*name).is_none() {
                return Some(Arc::clone(node));
            }
        }
        [name, rest @ ..] => {
            let key = dir_key(name);
            let Some(child) = children.get(&key) else {
                return Some(Arc::clone(node));
            };
            match remove_path(child, rest) {
                Some(updated) if Arc::ptr_eq(&updated, child) => return Some(Arc::clone(node)),
                Some(updated) => {
                    children.insert(key, updated);
                }
                None => {
                    children.remove(&key);
                }
            }
        }
    }
    if children.is_empty() {
        None
    } else {
        Some(Arc::new(MerkleNode::directory(children)))
    }
}

/// Mutable staging tree used by [`MerkleTree::rebuild`].
#[derive(Default)]
struct DirBuilder<'a> {
    files: BTreeMap<String, &'a FileRecord>,
    dirs: BTreeMap<String, DirBuilder<'a>>,
}

impl<'a> DirBuilder<'a> {
    fn insert(&mut self, comps: &[&str], record: &'a FileRecord) {
        match comps {
            [] => {}
            [name] => {
                self.files.insert((*name).to_string(), record);
            }
            [name, rest @ ..] => self.dirs.entry(dir_key(name)).or_default().insert(rest, record),
        }
    }

    fn finish(self, previous: Option<&Arc<MerkleNode>>) -> Arc<MerkleNode> {
        let previous_children = previous.and_then(|p| p.children());
        let mut children = BTreeMap::new();

        for (name, record) in self.files {
            let reused = previous_children
                .and_then(|c| c.get(&name))
                .filter(|node| node.is_file_for(record))
                .cloned();
            let node = reused
                .unwrap_or_else(|| Arc::new(MerkleNode::file(&record.path, &record.content_hash)));
            children.insert(name, node);
        }
        for (name, dir) in self.dirs {
            let prev = previous_children.and_then(|c| c.get(&name));
            children.insert(name, dir.finish(prev));
        }

        if let Some(prev) = previous {
            if let Some(prev_children) = prev.children() {
                let unchanged = prev_children.len() == children.len()
                    && prev_children
                        .iter()
                        .zip(children.iter())
                        .all(|((a_name, a), (b_name, b))| a_name == b_name && Arc::ptr_eq(a, b));
                if unchanged {
                    return Arc::clone(prev);
                }
            }
        }
        Arc::new(MerkleNode::directory(children))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn record(path: &str, content: &str) -> FileRecord {
        FileRecord::from_content(path, content.as_bytes(), Utc::now())
    }

    fn sample() -> Vec<FileRecord> {
        vec![
            record("/repo/src/main.rs", "fn main() {}"),
            record("/repo/src/lib.rs", "pub mod a;"),
            record("/repo/src/a/mod.rs", "pub fn a() {}"),
            record("/repo/docs/README.md", "# Docs"),
        ]
    }

    #[test]
    fn test_identical_records_identical_root() {
        let a = MerkleTree::build(&sample());
        let mut reversed = sample();
        reversed.reverse();
        let b = MerkleTree::build(&reversed);
        assert_eq!(a.root_hash(), b.root_hash());
        assert_eq!(a.file_count(), 4);
        assert!(a.diff(&b).is_empty());
    }

    #[test]
    fn test_single_file_change_is_minimal_diff() {
        let old = MerkleTree::build(&sample());
        let mut records = sample();
        records[2] = record("/repo/src/a/mod.rs", "pub fn a() { 1 }");
        let new = old.rebuild(&records);

        let changes = old.diff(&new);
        assert_eq!(changes.modified, vec!["/repo/src/a/mod.rs".to_string()]);
        assert!(changes.added.is_empty());
        assert!(changes.removed.is_empty());
        assert_ne!(old.root_hash(), new.root_hash());
    }

    #[test]
    fn test_change_propagates_to_every_ancestor() {
        let old = MerkleTree::build(&sample());
        let mut records = sample();
        records[2] = record("/repo/src/a/mod.rs", "changed");
        let new = MerkleTree::build(&records);

        let mut old_node = old.root();
        let mut new_node = new.root();
        for key in ["repo/", "src/", "a/"] {
            assert_ne!(old_node.hash(), new_node.hash());
            old_node = &old_node.children().unwrap()[key];
            new_node = &new_node.children().unwrap()[key];
        }
        assert_ne!(old_node.hash(), new_node.hash());
    }

    #[test]
    fn test_rebuild_reuses_unchanged_subtrees() {
        let old = MerkleTree::build(&sample());
        let mut records = sample();
        records[0] = record("/repo/src/main.rs", "fn main() { run() }");
        let new = old.rebuild(&records);

        let old_repo = &old.root().children().unwrap()["repo/"];
        let new_repo = &new.root().children().unwrap()["repo/"];
        let old_docs = &old_repo.children().unwrap()["docs/"];
        let new_docs = &new_repo.children().unwrap()["docs/"];
        assert!(Arc::ptr_eq(old_docs, new_docs));

        let old_a = &old_repo.children().unwrap()["src/"].children().unwrap()["a/"];
        let new_a = &new_repo.children().unwrap()["src/"].children().unwrap()["a/"];
        assert!(Arc::ptr_eq(old_a, new_a));

        let unchanged = old.rebuild(&sample());
        assert!(Arc::ptr_eq(old.root(), unchanged.root()));
    }

    #[test]
    fn test_added_and_removed_files() {
        let old = MerkleTree::build(&sample());
        let mut records = sample();
        records.retain(|r| !r.path.ends_with("README.md"));
        records.push(record("/repo/src/b.rs", "pub fn b() {}"));
        let new = old.rebuild(&records);

        let changes = old.diff(&new);
        assert_eq!(changes.added, vec!["/repo/src/b.rs".to_string()]);
        assert_eq!(changes.removed, vec!["/repo/docs/README.md".to_string()]);
        assert_eq!(changes.len(), 2);
    }

    #[test]
    fn test_apply_matches_full_build() {
        let old = MerkleTree::build(&sample());
        let updated = vec![record("/repo/src/lib.rs", "pub mod b;")];
        let applied = old.apply(&updated, ["/repo/docs/README.md"]);

        let mut records = sample();
        records.retain(|r| !r.path.ends_with("README.md"));
        records[1] = record("/repo/src/lib.rs", "pub mod b;");
        let built = MerkleTree::build(&records);

        assert_eq!(applied.root_hash(), built.root_hash());
        assert_eq!(applied.file_count(), 3);
    }

    #[test]
    fn test_empty_trees_are_equal() {
        assert_eq!(MerkleTree::empty().root_hash(), MerkleTree::build(&[]).root_hash());
        let all_removed = MerkleTree::build(&sample()).apply(
            &[],
            sample().iter().map(|r| r.path.as_str()).collect::<Vec<_>>(),
        );
        assert_eq!(all_removed.root_hash(), MerkleTree::empty().root_hash());
    }
}
