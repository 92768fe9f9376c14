//! Content fingerprint of a generated tree, used to confirm that re-running a
//! migration produced byte-identical output.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeSnapshot {
    /// Forward-slash relative path -> short content hash.
    pub files: BTreeMap<String, String>,
    pub directories: usize,
}

impl TreeSnapshot {
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// One hash over every path and content hash, in path order.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (path, hash) in &self.files {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update(hash.as_bytes());
            hasher.update([b'\n']);
        }
        short_hex(&hasher.finalize())
    }
}

pub fn snapshot_tree(root: &Path) -> Result<TreeSnapshot> {
    let mut snapshot = TreeSnapshot::default();
    if !root.exists() {
        return Ok(snapshot);
    }
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        if entry.depth() == 0 {
            continue;
        }
        if entry.file_type().is_dir() {
            snapshot.directories += 1;
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let relative = path
            .strip_prefix(root)
            .with_context(|| format!("{} is outside {}", path.display(), root.display()))?;
        snapshot
            .files
            .insert(display_relative(relative), compute_hash(&bytes));
    }
    Ok(snapshot)
}

fn display_relative(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn compute_hash(bytes: &[u8]) -> String {
    short_hex(&Sha256::digest(bytes))
}

fn short_hex(digest: &[u8]) -> String {
    let mut output = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::snapshot_tree;

    #[test]
    fn snapshot_tracks_paths_and_content() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join("acme/guides")).expect("dirs");
        fs::write(root.join("acme/guides/README.md"), "# Guides\n").expect("write");
        fs::write(root.join("Links.txt"), "").expect("write");

        let first = snapshot_tree(root).expect("snapshot");
        assert_eq!(first.file_count(), 2);
        assert_eq!(first.directories, 2);
        assert!(first.files.contains_key("acme/guides/README.md"));
        assert_eq!(first.digest(), snapshot_tree(root).expect("again").digest());

        fs::write(root.join("Links.txt"), "x\n").expect("rewrite");
        assert_ne!(first.digest(), snapshot_tree(root).expect("changed").digest());
    }

    #[test]
    fn missing_root_is_empty() {
        let temp = tempdir().expect("tempdir");
        let snapshot = snapshot_tree(&temp.path().join("nope")).expect("snapshot");
        assert_eq!(snapshot.file_count(), 0);
    }
}
