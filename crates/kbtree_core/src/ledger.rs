use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::runtime::{IMAGES_LEDGER_FILENAME, LINKS_LEDGER_FILENAME};

/// References the rewrite pass could not map, deduplicated in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnresolvedLedger {
    images: OrderedSet,
    links: OrderedSet,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct OrderedSet {
    items: Vec<String>,
    seen: HashSet<String>,
}

impl OrderedSet {
    fn insert(&mut self, value: &str) -> bool {
        if self.seen.contains(value) {
            return false;
        }
        self.seen.insert(value.to_string());
        self.items.push(value.to_string());
        true
    }

    fn render(&self) -> String {
        if self.items.is_empty() {
            return String::new();
        }
        let mut output = self.items.join("\n");
        output.push('\n');
        output
    }
}

#[derive(Debug, Clone)]
pub struct LedgerFiles {
    pub images_path: PathBuf,
    pub links_path: PathBuf,
}

impl UnresolvedLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the URL was not already recorded.
    pub fn record_image(&mut self, url: &str) -> bool {
        self.images.insert(url.trim())
    }

    /// Returns `true` when the target was not already recorded.
    pub fn record_link(&mut self, target: &str) -> bool {
        self.links.insert(target.trim())
    }

    pub fn images(&self) -> &[String] {
        &self.images.items
    }

    pub fn links(&self) -> &[String] {
        &self.links.items
    }

    pub fn image_count(&self) -> usize {
        self.images.items.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.items.is_empty() && self.links.items.is_empty()
    }

    pub fn merge(&mut self, other: &UnresolvedLedger) {
        for image in other.images() {
            self.record_image(image);
        }
        for link in other.links() {
            self.record_link(link);
        }
    }

    /// Write `Images.txt` and `Links.txt` under `output_root`, one entry per line.
    pub fn write(&self, output_root: &Path) -> Result<LedgerFiles> {
        fs::create_dir_all(output_root)
            .with_context(|| format!("failed to create {}", output_root.display()))?;
        let images_path = output_root.join(IMAGES_LEDGER_FILENAME);
        let links_path = output_root.join(LINKS_LEDGER_FILENAME);
        fs::write(&images_path, self.images.render())
            .with_context(|| format!("failed to write {}", images_path.display()))?;
        fs::write(&links_path, self.links.render())
            .with_context(|| format!("failed to write {}", links_path.display()))?;
        Ok(LedgerFiles {
            images_path,
            links_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::UnresolvedLedger;

    #[test]
    fn entries_are_deduplicated_in_first_seen_order() {
        let mut ledger = UnresolvedLedger::new();
        assert!(ledger.record_link("https://example.com/page"));
        assert!(ledger.record_link("install-5-old"));
        assert!(!ledger.record_link("https://example.com/page"));
        assert!(ledger.record_image("http://old.example.com/a.png"));
        assert!(!ledger.record_image(" http://old.example.com/a.png "));

        assert_eq!(ledger.links(), ["https://example.com/page", "install-5-old"]);
        assert_eq!(ledger.image_count(), 1);
    }

    #[test]
    fn merge_keeps_entries_unique() {
        let mut first = UnresolvedLedger::new();
        first.record_link("a");
        let mut second = UnresolvedLedger::new();
        second.record_link("a");
        second.record_link("b");
        second.record_image("x.png");

        first.merge(&second);
        assert_eq!(first.links(), ["a", "b"]);
        assert_eq!(first.images(), ["x.png"]);
    }

    #[test]
    fn write_emits_one_entry_per_line() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("docs");
        let mut ledger = UnresolvedLedger::new();
        ledger.record_link("install-5-old");
        ledger.record_link("https://example.com/page");

        let files = ledger.write(&root).expect("write");
        assert_eq!(
            fs::read_to_string(&files.links_path).expect("links"),
            "install-5-old\nhttps://example.com/page\n"
        );
        assert_eq!(fs::read_to_string(&files.images_path).expect("images"), "");
        assert!(files.images_path.ends_with("Images.txt"));
    }
}
