//! Content store: where every category and question of the run ended up.
//!
//! Sites are kept side by side for the whole run so links that cross from
//! one site to another still resolve. Lookups always try the current site
//! first and then the remaining sites in the order they were migrated.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedCategory {
    pub id: i64,
    pub name: String,
    pub codename: String,
    pub parent_id: Option<i64>,
    pub local_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedQuestion {
    pub id: i64,
    pub name: String,
    pub codename: String,
    /// Directory holding the question's document and downloaded images.
    pub directory: PathBuf,
    pub document_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Category(i64),
    Question(i64),
}

#[derive(Debug, Clone)]
pub struct SiteContent {
    site: String,
    root: PathBuf,
    categories: BTreeMap<i64, PlacedCategory>,
    resolution_order: Vec<i64>,
    questions: BTreeMap<i64, PlacedQuestion>,
    category_codenames: HashMap<String, i64>,
    question_codenames: HashMap<String, i64>,
    claimed_dirs: HashMap<PathBuf, Claim>,
}

impl SiteContent {
    fn new(site: &str, root: &Path) -> Self {
        Self {
            site: site.to_lowercase(),
            root: root.to_path_buf(),
            categories: BTreeMap::new(),
            resolution_order: Vec::new(),
            questions: BTreeMap::new(),
            category_codenames: HashMap::new(),
            question_codenames: HashMap::new(),
            claimed_dirs: HashMap::new(),
        }
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn category(&self, id: i64) -> Option<&PlacedCategory> {
        self.categories.get(&id)
    }

    pub fn question(&self, id: i64) -> Option<&PlacedQuestion> {
        self.questions.get(&id)
    }

    pub fn category_by_codename(&self, codename: &str) -> Option<&PlacedCategory> {
        self.category_codenames
            .get(&codename_key(codename))
            .and_then(|id| self.categories.get(id))
    }

    pub fn question_by_codename(&self, codename: &str) -> Option<&PlacedQuestion> {
        self.question_codenames
            .get(&codename_key(codename))
            .and_then(|id| self.questions.get(id))
    }

    /// Categories in the order they were resolved (parents before children).
    pub fn categories_in_order(&self) -> impl Iterator<Item = &PlacedCategory> {
        self.resolution_order
            .iter()
            .filter_map(|id| self.categories.get(id))
    }

    pub fn category_count(&self) -> usize {
        self.categories.len()
    }

    pub fn question_count(&self) -> usize {
        self.questions.len()
    }

    pub fn claim_of(&self, directory: &Path) -> Option<Claim> {
        self.claimed_dirs.get(directory).copied()
    }

    /// Insert a resolved category. Returns `false` when the id is already present.
    pub fn insert_category(&mut self, category: PlacedCategory) -> bool {
        if self.categories.contains_key(&category.id) {
            return false;
        }
        let key = codename_key(&category.codename);
        if !key.is_empty() {
            self.category_codenames.entry(key).or_insert(category.id);
        }
        self.claimed_dirs
            .insert(category.local_path.clone(), Claim::Category(category.id));
        self.resolution_order.push(category.id);
        self.categories.insert(category.id, category);
        true
    }

    /// Insert a placed question. Returns `false` when the id is already present.
    pub fn insert_question(&mut self, question: PlacedQuestion) -> bool {
        if self.questions.contains_key(&question.id) {
            return false;
        }
        let key = codename_key(&question.codename);
        if !key.is_empty() {
            self.question_codenames.entry(key).or_insert(question.id);
        }
        self.claimed_dirs
            .insert(question.directory.clone(), Claim::Question(question.id));
        self.questions.insert(question.id, question);
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContentStore {
    sites: Vec<SiteContent>,
}

impl ContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) a site's partition. Re-migrating a site replaces
    /// whatever an earlier pass recorded for it.
    pub fn begin_site(&mut self, site: &str, root: &Path) -> &mut SiteContent {
        let key = site.to_lowercase();
        if let Some(index) = self.sites.iter().position(|entry| entry.site == key) {
            self.sites[index] = SiteContent::new(site, root);
            return &mut self.sites[index];
        }
        self.sites.push(SiteContent::new(site, root));
        let last = self.sites.len() - 1;
        &mut self.sites[last]
    }

    pub fn site(&self, site: &str) -> Option<&SiteContent> {
        let key = site.to_lowercase();
        self.sites.iter().find(|entry| entry.site == key)
    }

    pub fn site_mut(&mut self, site: &str) -> Option<&mut SiteContent> {
        let key = site.to_lowercase();
        self.sites.iter_mut().find(|entry| entry.site == key)
    }

    pub fn sites(&self) -> impl Iterator<Item = &SiteContent> {
        self.sites.iter()
    }

    /// Current site first, then every other site in migration order.
    pub fn search_order<'a>(&'a self, current: &str) -> impl Iterator<Item = &'a SiteContent> {
        let key = current.to_lowercase();
        let first = self.sites.iter().filter(move |entry| entry.site == key);
        let key = current.to_lowercase();
        let rest = self.sites.iter().filter(move |entry| entry.site != key);
        first.chain(rest)
    }

    pub fn find_question_by_codename(&self, current: &str, codename: &str) -> Option<&PlacedQuestion> {
        self.search_order(current)
            .find_map(|site| site.question_by_codename(codename))
    }

    pub fn find_question(&self, current: &str, id: i64) -> Option<&PlacedQuestion> {
        self.search_order(current).find_map(|site| site.question(id))
    }

    pub fn find_category_by_codename(&self, current: &str, codename: &str) -> Option<&PlacedCategory> {
        self.search_order(current)
            .find_map(|site| site.category_by_codename(codename))
    }

    pub fn find_category(&self, current: &str, id: i64) -> Option<&PlacedCategory> {
        self.search_order(current).find_map(|site| site.category(id))
    }
}

fn codename_key(codename: &str) -> String {
    codename.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::{Claim, ContentStore, PlacedCategory, PlacedQuestion};

    fn question(id: i64, codename: &str, dir: &str) -> PlacedQuestion {
        PlacedQuestion {
            id,
            name: codename.to_string(),
            codename: codename.to_string(),
            directory: PathBuf::from(dir),
            document_path: PathBuf::from(dir).join("README.md"),
        }
    }

    #[test]
    fn codename_lookup_is_case_insensitive_and_first_wins() {
        let mut store = ContentStore::new();
        let site = store.begin_site("Acme", Path::new("/out/acme"));
        assert!(site.insert_question(question(1, "Getting-Started", "/out/acme/a")));
        assert!(site.insert_question(question(2, "getting-started", "/out/acme/b")));
        assert!(!site.insert_question(question(1, "other", "/out/acme/c")));

        let found = store
            .find_question_by_codename("acme", "GETTING-STARTED")
            .expect("question");
        assert_eq!(found.id, 1);
        assert_eq!(
            store.site("ACME").and_then(|site| site.claim_of(Path::new("/out/acme/b"))),
            Some(Claim::Question(2))
        );
    }

    #[test]
    fn current_site_wins_over_other_sites() {
        let mut store = ContentStore::new();
        store
            .begin_site("alpha", Path::new("/out/alpha"))
            .insert_question(question(5, "shared", "/out/alpha/shared"));
        store
            .begin_site("beta", Path::new("/out/beta"))
            .insert_question(question(5, "shared", "/out/beta/shared"));

        assert_eq!(
            store.find_question("beta", 5).map(|q| q.directory.clone()),
            Some(PathBuf::from("/out/beta/shared"))
        );
        assert_eq!(
            store.find_question("alpha", 5).map(|q| q.directory.clone()),
            Some(PathBuf::from("/out/alpha/shared"))
        );
        assert_eq!(
            store.find_question("gamma", 5).map(|q| q.directory.clone()),
            Some(PathBuf::from("/out/alpha/shared"))
        );
    }

    #[test]
    fn begin_site_resets_partition() {
        let mut store = ContentStore::new();
        store.begin_site("acme", Path::new("/out/acme")).insert_category(PlacedCategory {
            id: 1,
            name: "Guides".to_string(),
            codename: "guides".to_string(),
            parent_id: None,
            local_path: PathBuf::from("/out/acme/guides"),
        });
        assert_eq!(store.site("acme").map(|site| site.category_count()), Some(1));

        store.begin_site("acme", Path::new("/out/acme"));
        assert_eq!(store.site("acme").map(|site| site.category_count()), Some(0));
        assert_eq!(store.sites().count(), 1);
    }
}
