//! Turns the flat category list into directories and decides where each
//! question's document lives.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

use crate::model::{Category, Question};
use crate::store::{PlacedCategory, PlacedQuestion, SiteContent};

/// File written inside every category and question directory.
pub const DOCUMENT_FILENAME: &str = "README.md";

#[derive(Debug, Error)]
pub enum HierarchyError {
    #[error("category {id} appears more than once in the category list")]
    DuplicateCategory { id: i64 },
    #[error("category {id} names parent {parent_id}, which does not exist")]
    DanglingParent { id: i64, parent_id: i64 },
    #[error("categories {ids:?} form a parent cycle")]
    Cycle { ids: Vec<i64> },
    #[error("failed to create directory {}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Filesystem-safe name used for every generated directory.
///
/// Trims the name, drops characters that are unsafe in paths
/// (`/ \ : * ? " < > |`), collapses each whitespace run (newlines included)
/// into one `-` and lower-cases the result.
pub fn path_segment(name: &str) -> String {
    let mut output = String::with_capacity(name.len());
    let mut pending_dash = false;
    for ch in name.trim().chars() {
        if matches!(ch, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') {
            continue;
        }
        if ch.is_whitespace() {
            pending_dash = !output.is_empty();
            continue;
        }
        if pending_dash {
            output.push('-');
            pending_dash = false;
        }
        output.extend(ch.to_lowercase());
    }
    output
}

fn segment_or_fallback(name: &str, codename: &str, id: i64) -> String {
    let segment = path_segment(name);
    if !segment.is_empty() {
        return segment;
    }
    let segment = path_segment(codename);
    if !segment.is_empty() {
        return segment;
    }
    id.to_string()
}

/// Resolve every category into a directory under the site root.
///
/// Parents are always placed before their children (Kahn's algorithm over
/// the parent pointers). The whole list is validated before anything is
/// written, so a dangling parent or a cycle leaves the store untouched.
pub fn build_hierarchy(
    categories: Vec<Category>,
    site: &mut SiteContent,
) -> Result<Vec<i64>, HierarchyError> {
    let mut by_id: HashMap<i64, Category> = HashMap::with_capacity(categories.len());
    let mut input_order = Vec::with_capacity(categories.len());
    for category in categories {
        let id = category.id;
        if by_id.insert(id, category).is_some() {
            return Err(HierarchyError::DuplicateCategory { id });
        }
        input_order.push(id);
    }

    let mut children: HashMap<i64, Vec<i64>> = HashMap::new();
    let mut queue = VecDeque::new();
    for id in &input_order {
        let category = &by_id[id];
        match category.parent_id {
            None => queue.push_back(*id),
            Some(parent_id) if parent_id == *id => {
                return Err(HierarchyError::Cycle { ids: vec![*id] });
            }
            Some(parent_id) if by_id.contains_key(&parent_id) => {
                children.entry(parent_id).or_default().push(*id);
            }
            Some(parent_id) if site.category(parent_id).is_some() => queue.push_back(*id),
            Some(parent_id) => {
                return Err(HierarchyError::DanglingParent {
                    id: *id,
                    parent_id,
                });
            }
        }
    }

    let mut planned: BTreeMap<i64, PathBuf> = BTreeMap::new();
    let mut claimed: HashMap<PathBuf, i64> = HashMap::new();
    let mut order = Vec::with_capacity(input_order.len());
    while let Some(id) = queue.pop_front() {
        let category = &by_id[&id];
        let base = match category.parent_id {
            Some(parent_id) => planned
                .get(&parent_id)
                .cloned()
                .or_else(|| site.category(parent_id).map(|parent| parent.local_path.clone()))
                .unwrap_or_else(|| site.root().to_path_buf()),
            None => site.root().to_path_buf(),
        };
        let mut path = base.join(segment_or_fallback(
            &category.name,
            &category.codename,
            id,
        ));
        if claimed.contains_key(&path) || site.claim_of(&path).is_some() {
            warn!(
                category = id,
                path = %path.display(),
                "category directory already taken; appending id"
            );
            path = disambiguate(&path, id);
        }
        claimed.insert(path.clone(), id);
        planned.insert(id, path);
        order.push(id);
        if let Some(kids) = children.get(&id) {
            queue.extend(kids.iter().copied());
        }
    }

    if order.len() < input_order.len() {
        let mut ids = input_order
            .iter()
            .copied()
            .filter(|id| !planned.contains_key(id))
            .collect::<Vec<_>>();
        ids.sort_unstable();
        return Err(HierarchyError::Cycle { ids });
    }

    for id in &order {
        let category = &by_id[id];
        let local_path = planned[id].clone();
        ensure_dir(&local_path)?;
        site.insert_category(PlacedCategory {
            id: *id,
            name: category.name.trim().to_string(),
            codename: category.codename.clone(),
            parent_id: category.parent_id,
            local_path,
        });
    }
    Ok(order)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub question: PlacedQuestion,
    /// The derived directory was taken and the id had to be appended.
    pub collided: bool,
    /// The primary category is unknown and the site root was used instead.
    pub fell_back_to_root: bool,
}

/// Decide (and create) the directory of one question.
pub fn place_question(
    question: &Question,
    site: &mut SiteContent,
) -> Result<Placement, HierarchyError> {
    if let Some(existing) = site.question(question.id) {
        return Ok(Placement {
            question: existing.clone(),
            collided: false,
            fell_back_to_root: false,
        });
    }

    let mut fell_back_to_root = false;
    let parent = match question.primary_category() {
        Some(reference) => match site.category(reference.id) {
            Some(category) => category.local_path.clone(),
            None => {
                warn!(
                    question = question.id,
                    category = reference.id,
                    "primary category is unknown; placing question under the site root"
                );
                fell_back_to_root = true;
                site.root().to_path_buf()
            }
        },
        None => site.root().to_path_buf(),
    };

    let mut directory = parent.join(segment_or_fallback(
        &question.name,
        &question.codename,
        question.id,
    ));
    let mut collided = false;
    if site.claim_of(&directory).is_some() {
        warn!(
            question = question.id,
            path = %directory.display(),
            "question directory already taken; appending id"
        );
        directory = disambiguate(&directory, question.id);
        collided = true;
    }
    ensure_dir(&directory)?;

    let placed = PlacedQuestion {
        id: question.id,
        name: question.name.trim().to_string(),
        codename: question.codename.clone(),
        document_path: directory.join(DOCUMENT_FILENAME),
        directory,
    };
    site.insert_question(placed.clone());
    Ok(Placement {
        question: placed,
        collided,
        fell_back_to_root,
    })
}

fn disambiguate(path: &Path, id: i64) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!("{name}-{id}"))
}

fn ensure_dir(path: &Path) -> Result<(), HierarchyError> {
    fs::create_dir_all(path).map_err(|source| HierarchyError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::{HierarchyError, build_hierarchy, path_segment, place_question};
    use crate::model::{Category, CategoryRef, Question};
    use crate::store::ContentStore;

    fn category(id: i64, name: &str, parent_id: Option<i64>) -> Category {
        Category {
            id,
            name: name.to_string(),
            codename: path_segment(name),
            parent_id,
            created_at: None,
            updated_at: None,
            url: None,
        }
    }

    fn question(id: i64, name: &str, categories: &[i64]) -> Question {
        Question {
            id,
            name: name.to_string(),
            codename: path_segment(name),
            accessibility: None,
            description: None,
            is_published: None,
            created_at: None,
            updated_at: None,
            categories: categories
                .iter()
                .map(|id| CategoryRef {
                    id: *id,
                    codename: None,
                })
                .collect(),
            tags: Vec::new(),
        }
    }

    #[test]
    fn path_segment_normalizes_names() {
        assert_eq!(path_segment("  Getting Started  "), "getting-started");
        assert_eq!(path_segment("Setup: Linux/Unix"), "setup-linuxunix");
        assert_eq!(path_segment("Line\r\nBreak   Here"), "line-break-here");
        assert_eq!(path_segment("???"), "");
    }

    #[test]
    fn children_land_inside_their_parent_regardless_of_input_order() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("acme");
        let mut store = ContentStore::new();
        let site = store.begin_site("acme", &root);

        let order = build_hierarchy(
            vec![
                category(3, "Deep", Some(2)),
                category(2, "Setup", Some(1)),
                category(1, "Guides", None),
                category(4, "FAQ", None),
            ],
            site,
        )
        .expect("hierarchy");

        let position = |id: i64| order.iter().position(|entry| *entry == id).expect("id");
        assert!(position(1) < position(2));
        assert!(position(2) < position(3));

        for id in [2, 3] {
            let child = site.category(id).expect("child");
            let parent = site.category(child.parent_id.expect("parent")).expect("parent");
            assert_eq!(child.local_path.parent(), Some(parent.local_path.as_path()));
        }
        assert_eq!(site.category(3).expect("deep").local_path, root.join("guides/setup/deep"));
        assert!(root.join("guides/setup/deep").is_dir());
        assert!(root.join("faq").is_dir());
    }

    #[test]
    fn dangling_parent_fails_fast_without_side_effects() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("acme");
        let mut store = ContentStore::new();
        let site = store.begin_site("acme", &root);

        let error = build_hierarchy(
            vec![category(1, "Guides", None), category(2, "Lost", Some(99))],
            site,
        )
        .expect_err("must fail");
        assert!(matches!(
            error,
            HierarchyError::DanglingParent { id: 2, parent_id: 99 }
        ));
        assert_eq!(site.category_count(), 0);
        assert!(!root.join("guides").exists());
    }

    #[test]
    fn cycles_are_reported_with_their_members() {
        let temp = tempdir().expect("tempdir");
        let mut store = ContentStore::new();
        let site = store.begin_site("acme", temp.path());

        let error = build_hierarchy(
            vec![
                category(1, "Root", None),
                category(2, "A", Some(3)),
                category(3, "B", Some(2)),
                category(4, "C", Some(3)),
            ],
            site,
        )
        .expect_err("must fail");
        match error {
            HierarchyError::Cycle { ids } => assert_eq!(ids, vec![2, 3, 4]),
            other => panic!("unexpected error: {other}"),
        }

        let error = build_hierarchy(vec![category(5, "Self", Some(5))], site).expect_err("self");
        assert!(matches!(error, HierarchyError::Cycle { ids } if ids == vec![5]));
    }

    #[test]
    fn duplicate_category_ids_are_rejected() {
        let temp = tempdir().expect("tempdir");
        let mut store = ContentStore::new();
        let site = store.begin_site("acme", temp.path());
        let error = build_hierarchy(
            vec![category(1, "Guides", None), category(1, "Again", None)],
            site,
        )
        .expect_err("must fail");
        assert!(matches!(error, HierarchyError::DuplicateCategory { id: 1 }));
    }

    #[test]
    fn questions_get_their_own_directory() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("acme");
        let mut store = ContentStore::new();
        let site = store.begin_site("acme", &root);
        build_hierarchy(
            vec![category(1, "Guides", None), category(2, "Setup", Some(1))],
            site,
        )
        .expect("hierarchy");

        let placed = place_question(&question(10, "Install", &[2, 1]), site).expect("place");
        assert_eq!(placed.question.directory, root.join("guides/setup/install"));
        assert_eq!(
            placed.question.document_path,
            root.join("guides/setup/install/README.md")
        );
        assert!(placed.question.directory.is_dir());

        let loose = place_question(&question(11, "Loose: Ends", &[]), site).expect("place");
        assert_eq!(loose.question.directory, root.join("loose-ends"));
    }

    #[test]
    fn colliding_question_names_are_disambiguated_by_id() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("acme");
        let mut store = ContentStore::new();
        let site = store.begin_site("acme", &root);

        let first = place_question(&question(10, "Install", &[]), site).expect("first");
        let second = place_question(&question(12, "install", &[]), site).expect("second");
        assert!(!first.collided);
        assert!(second.collided);
        assert_eq!(second.question.directory, root.join("install-12"));

        let again = place_question(&question(10, "Install", &[]), site).expect("again");
        assert_eq!(again.question.directory, root.join("install"));
        assert!(!again.collided);
    }

    #[test]
    fn unknown_primary_category_falls_back_to_root() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("acme");
        let mut store = ContentStore::new();
        let site = store.begin_site("acme", &root);

        let placed = place_question(&question(10, "Install", &[42]), site).expect("place");
        assert!(placed.fell_back_to_root);
        assert_eq!(placed.question.directory, root.join("install"));
    }
}
