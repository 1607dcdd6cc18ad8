//! Longest-common-prefix grouping of staged paths.
//!
//! Container invocations mount the fewest host directories that cover every
//! staged input. Directories are inserted into a component trie; each
//! top-level branch collapses to its longest single-child chain.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Default)]
struct Node {
    children: BTreeMap<String, Node>,
    terminal: bool,
}

#[derive(Debug, Default)]
pub struct PathTrie {
    root: Node,
}

impl PathTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the directory that must be visible for `path`. Files insert
    /// their parent; directories insert themselves.
    pub fn add(&mut self, path: &Path) {
        let dir = if path.is_dir() {
            path.to_path_buf()
        } else {
            path.parent().map(Path::to_path_buf).unwrap_or_default()
        };
        let mut node = &mut self.root;
        for component in dir.components() {
            let key = match component {
                Component::RootDir => continue,
                other => other.as_os_str().to_string_lossy().into_owned(),
            };
            node = node.children.entry(key).or_default();
        }
        node.terminal = true;
    }

    /// The minimal set of longest shared prefixes covering every added path.
    pub fn mount_points(&self) -> Vec<PathBuf> {
        let mut result = Vec::new();
        for (name, child) in &self.root.children {
            let mut prefix = PathBuf::from("/");
            prefix.push(name);
            let mut node = child;
            while !node.terminal && node.children.len() == 1 {
                let (name, next) = node.children.iter().next().unwrap();
                prefix.push(name);
                node = next;
            }
            result.push(prefix);
        }
        result
    }

    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty()
    }
}
