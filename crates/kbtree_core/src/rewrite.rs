//! Image and link rewriting for answer bodies.
//!
//! Tags are located with regular expressions rather than a full HTML parse:
//! `<img ...>` and `<a ...>` start tags are matched as a whole and only the
//! byte range of the `src`/`href` value is replaced, so link text and the
//! rest of the markup are never touched. Markup where an attribute value
//! contains a literal `>` is not recognised.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use reqwest::Url;
use tracing::{debug, warn};

use crate::ledger::UnresolvedLedger;
use crate::store::ContentStore;

static IMG_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<img\b[^>]*>").expect("valid img tag pattern"));
static ANCHOR_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<a\b[^>]*>").expect("valid anchor tag pattern"));
static SRC_ATTR: LazyLock<Regex> = LazyLock::new(|| attribute_pattern("src"));
static HREF_ATTR: LazyLock<Regex> = LazyLock::new(|| attribute_pattern("href"));
static ALT_ATTR: LazyLock<Regex> = LazyLock::new(|| attribute_pattern("alt"));

fn attribute_pattern(name: &str) -> Regex {
    Regex::new(&format!(
        r#"(?is)\s{name}\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#
    ))
    .expect("valid attribute pattern")
}

const DEFAULT_IMAGE_EXTENSION: &str = "jpg";
const SKIPPED_SCHEMES: &[&str] = &["data:", "mailto:", "tel:", "javascript:"];

/// Downloads the bytes behind an image URL.
pub trait ImageFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// One `(matcher, replacement)` substitution for a retired host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyHostRule {
    pub matcher: String,
    pub replacement: String,
}

impl LegacyHostRule {
    pub fn new(matcher: &str, replacement: &str) -> Self {
        Self {
            matcher: matcher.to_string(),
            replacement: replacement.to_string(),
        }
    }
}

/// Ordered legacy-host substitutions; every rule is applied in turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacyHostTable {
    rules: Vec<LegacyHostRule>,
}

impl LegacyHostTable {
    pub fn new(rules: Vec<LegacyHostRule>) -> Self {
        Self {
            rules: rules
                .into_iter()
                .filter(|rule| !rule.matcher.is_empty())
                .collect(),
        }
    }

    pub fn apply(&self, url: &str) -> String {
        self.rules
            .iter()
            .fold(url.to_string(), |current, rule| {
                current.replace(&rule.matcher, &rule.replacement)
            })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewritePolicy {
    pub site: String,
    /// Scheme and host used to absolutize site-relative image paths.
    pub site_base: String,
    /// Hosts whose images are already stable and are left alone.
    pub canonical_asset_hosts: Vec<String>,
    /// Hosts whose links point back into the knowledge base.
    pub internal_domains: Vec<String>,
    pub legacy_hosts: LegacyHostTable,
    pub image_alt: bool,
}

impl RewritePolicy {
    fn is_canonical_asset(&self, host: &str) -> bool {
        host_matches(host, &self.canonical_asset_hosts)
    }

    fn is_internal(&self, host: &str) -> bool {
        host_matches(host, &self.internal_domains)
    }
}

fn host_matches(host: &str, candidates: &[String]) -> bool {
    let host = host.to_ascii_lowercase();
    candidates.iter().any(|candidate| {
        let candidate = candidate.to_ascii_lowercase();
        host == candidate || host.ends_with(&format!(".{candidate}"))
    })
}

/// The document an HTML block is being rewritten for.
#[derive(Debug, Clone, Copy)]
pub struct DocumentContext<'a> {
    pub site: &'a str,
    pub title: &'a str,
    /// Directory of the document; images are saved here and links are
    /// made relative to it.
    pub directory: &'a Path,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteOutcome {
    pub html: String,
    pub images_saved: usize,
    pub images_failed: usize,
    pub links_rewritten: usize,
    pub links_unresolved: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkResolution {
    /// Rewritten to a relative path inside the generated tree.
    Local(String),
    /// Could not be mapped; recorded in the ledger.
    Unresolved,
    /// Not a reference this pass handles (anchors, mailto, already local).
    Ignored,
}

/// Image filenames handed out per document directory for the whole run.
///
/// Every answer of a question writes into the same directory, so names are
/// allocated against what earlier answers already saved there.
#[derive(Debug, Clone, Default)]
pub struct ImageRegistry {
    directories: HashMap<PathBuf, SavedImages>,
}

#[derive(Debug, Clone, Default)]
struct SavedImages {
    by_url: HashMap<String, String>,
    names: HashSet<String>,
}

impl ImageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn saved_name(&self, directory: &Path, url: &str) -> Option<String> {
        self.directories.get(directory)?.by_url.get(url).cloned()
    }

    fn free_name(&self, directory: &Path, candidate: String) -> String {
        match self.directories.get(directory) {
            Some(saved) => unique_name(candidate, &saved.names),
            None => candidate,
        }
    }

    fn record(&mut self, directory: &Path, url: &str, filename: &str) {
        let saved = self.directories.entry(directory.to_path_buf()).or_default();
        saved.names.insert(filename.to_string());
        saved.by_url.insert(url.to_string(), filename.to_string());
    }

    /// Forget every directory under `root`; a site migrated again starts
    /// from the same names a fresh run would hand out.
    pub fn forget_under(&mut self, root: &Path) {
        self.directories
            .retain(|directory, _| !directory.starts_with(root));
    }

    /// Images saved so far, across every directory.
    pub fn saved_count(&self) -> usize {
        self.directories
            .values()
            .map(|saved| saved.by_url.len())
            .sum()
    }
}

pub struct RewriteEngine<'a, F: ImageFetcher + ?Sized> {
    store: &'a ContentStore,
    policy: &'a RewritePolicy,
    fetcher: &'a F,
}

impl<'a, F: ImageFetcher + ?Sized> RewriteEngine<'a, F> {
    pub fn new(store: &'a ContentStore, policy: &'a RewritePolicy, fetcher: &'a F) -> Self {
        Self {
            store,
            policy,
            fetcher,
        }
    }

    /// Rewrite every image and link reference in `html`.
    ///
    /// Download failures are recorded in the ledger; only a failure to write
    /// a downloaded image to disk is returned as an error. Image names are
    /// allocated through `images`, which outlives a single answer.
    pub fn rewrite(
        &self,
        document: &DocumentContext<'_>,
        html: &str,
        images: &mut ImageRegistry,
        ledger: &mut UnresolvedLedger,
    ) -> Result<RewriteOutcome> {
        let mut outcome = RewriteOutcome::default();
        let with_images = self.rewrite_images(document, html, images, ledger, &mut outcome)?;
        let rewritten = self.rewrite_links(document, &with_images, ledger, &mut outcome);
        outcome.html = rewritten;
        Ok(outcome)
    }

    /// Rewrite links only; images are left exactly as they are.
    pub fn link_pass(
        &self,
        document: &DocumentContext<'_>,
        html: &str,
        ledger: &mut UnresolvedLedger,
    ) -> RewriteOutcome {
        let mut outcome = RewriteOutcome::default();
        let rewritten = self.rewrite_links(document, html, ledger, &mut outcome);
        outcome.html = rewritten;
        outcome
    }

    fn rewrite_images(
        &self,
        document: &DocumentContext<'_>,
        html: &str,
        images: &mut ImageRegistry,
        ledger: &mut UnresolvedLedger,
        outcome: &mut RewriteOutcome,
    ) -> Result<String> {
        replace_tags(html, &IMG_TAG, |tag| {
            let Some(attribute) = find_attribute(tag, &SRC_ATTR) else {
                return Ok(None);
            };
            let original = attribute.value.trim();
            let Some(url) = self.image_download_url(original) else {
                return Ok(None);
            };

            let filename = match images.saved_name(document.directory, &url) {
                Some(filename) => filename,
                None => {
                    let filename = images.free_name(document.directory, image_filename(&url));
                    let bytes = match self.fetcher.fetch(&url) {
                        Ok(bytes) => bytes,
                        Err(error) => {
                            warn!(url = %url, error = %error, "image download failed");
                            ledger.record_image(original);
                            outcome.images_failed += 1;
                            return Ok(None);
                        }
                    };
                    let target = document.directory.join(&filename);
                    fs::write(&target, bytes)
                        .with_context(|| format!("failed to write image {}", target.display()))?;
                    outcome.images_saved += 1;
                    images.record(document.directory, &url, &filename);
                    filename
                }
            };

            let mut rewritten = replace_value(tag, &attribute, &format!("./{filename}"));
            if self.policy.image_alt && find_attribute(&rewritten, &ALT_ATTR).is_none() {
                rewritten = insert_alt(&rewritten, &alt_text(document.title, &filename));
            }
            Ok(Some(rewritten))
        })
    }

    /// Absolute URL to download for an image `src`, or `None` when the image
    /// stays as it is.
    fn image_download_url(&self, src: &str) -> Option<String> {
        if src.is_empty() || is_local_reference(src) || has_skipped_scheme(src) {
            return None;
        }
        let absolute = self.absolutize(src)?;
        let parsed = Url::parse(&absolute).ok()?;
        if parsed
            .host_str()
            .is_some_and(|host| self.policy.is_canonical_asset(host))
        {
            return None;
        }
        Some(self.policy.legacy_hosts.apply(&absolute))
    }

    fn absolutize(&self, src: &str) -> Option<String> {
        if let Some(rest) = src.strip_prefix("//") {
            return Some(format!("https://{rest}"));
        }
        if Url::parse(src).is_ok() {
            return Some(src.to_string());
        }
        let base = Url::parse(&format!("{}/", self.policy.site_base.trim_end_matches('/'))).ok()?;
        base.join(src).ok().map(|url| url.to_string())
    }

    fn rewrite_links(
        &self,
        document: &DocumentContext<'_>,
        html: &str,
        ledger: &mut UnresolvedLedger,
        outcome: &mut RewriteOutcome,
    ) -> String {
        let result = replace_tags(html, &ANCHOR_TAG, |tag| {
            let Some(attribute) = find_attribute(tag, &HREF_ATTR) else {
                return Ok(None);
            };
            match self.resolve_link(document.site, document.directory, &attribute.value) {
                LinkResolution::Local(href) => {
                    outcome.links_rewritten += 1;
                    Ok(Some(replace_value(tag, &attribute, &href)))
                }
                LinkResolution::Unresolved => {
                    ledger.record_link(&attribute.value);
                    outcome.links_unresolved += 1;
                    Ok(None)
                }
                LinkResolution::Ignored => Ok(None),
            }
        });
        result.unwrap_or_else(|_| html.to_string())
    }

    /// Map one `href` onto the generated tree.
    pub fn resolve_link(&self, site: &str, document_dir: &Path, href: &str) -> LinkResolution {
        let href = href.trim();
        if href.is_empty()
            || href.starts_with('#')
            || is_local_reference(href)
            || has_skipped_scheme(href)
        {
            return LinkResolution::Ignored;
        }

        let target = self.policy.legacy_hosts.apply(href);
        let (without_fragment, fragment) = match target.split_once('#') {
            Some((head, fragment)) => (head.to_string(), Some(fragment.to_string())),
            None => (target.clone(), None),
        };

        let path = match external_host(&without_fragment) {
            Some((host, path)) => {
                if !self.policy.is_internal(&host) {
                    return LinkResolution::Unresolved;
                }
                path
            }
            None => without_fragment,
        };

        let token = core_token(&path);
        if token.is_empty() {
            return LinkResolution::Unresolved;
        }
        let Some(directory) = self.lookup(site, &token) else {
            debug!(href, token = %token, "link target not found");
            return LinkResolution::Unresolved;
        };

        let mut local = relative_href(document_dir, &directory);
        if let Some(fragment) = fragment.filter(|fragment| !fragment.is_empty()) {
            local.push('#');
            local.push_str(&fragment);
        }
        LinkResolution::Local(local)
    }

    /// Question codename, question id prefix, category codename, category
    /// id prefix; first match wins.
    fn lookup(&self, site: &str, token: &str) -> Option<PathBuf> {
        let id = leading_id(token);
        self.store
            .find_question_by_codename(site, token)
            .map(|question| question.directory.clone())
            .or_else(|| {
                id.and_then(|id| self.store.find_question(site, id))
                    .map(|question| question.directory.clone())
            })
            .or_else(|| {
                self.store
                    .find_category_by_codename(site, token)
                    .map(|category| category.local_path.clone())
            })
            .or_else(|| {
                id.and_then(|id| self.store.find_category(site, id))
                    .map(|category| category.local_path.clone())
            })
    }
}

/// Host and path of an absolute (or scheme-relative) URL.
fn external_host(target: &str) -> Option<(String, String)> {
    let candidate = match target.strip_prefix("//") {
        Some(rest) => format!("https://{rest}"),
        None => target.to_string(),
    };
    let parsed = Url::parse(&candidate).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    Some((host, parsed.path().to_string()))
}

/// The part of a link target that is matched against codenames and ids:
/// last path segment without query, extension or encoded spaces.
pub fn core_token(path: &str) -> String {
    let path = path.split('?').next().unwrap_or("");
    let segment = path
        .split('/')
        .rev()
        .find(|segment| !segment.trim().is_empty())
        .unwrap_or("")
        .replace("%20", "");
    let segment = segment.trim();
    match segment.rsplit_once('.') {
        Some((stem, extension))
            if !stem.is_empty()
                && (1..=5).contains(&extension.len())
                && extension.chars().all(|ch| ch.is_ascii_alphanumeric()) =>
        {
            stem.to_string()
        }
        _ => segment.to_string(),
    }
}

/// Numeric id at the start of a token (`"123-some-title"` or `"123"`).
pub fn leading_id(token: &str) -> Option<i64> {
    let digits = token.chars().take_while(char::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    let rest = &token[digits..];
    if !rest.is_empty() && !rest.starts_with('-') {
        return None;
    }
    token[..digits].parse().ok()
}

/// `./`-prefixed, forward-slash path from one directory to another.
pub fn relative_href(from_dir: &Path, to_dir: &Path) -> String {
    let from = normal_components(from_dir);
    let to = normal_components(to_dir);
    let common = from
        .iter()
        .zip(to.iter())
        .take_while(|(left, right)| left == right)
        .count();

    let mut parts = vec!["..".to_string(); from.len() - common];
    parts.extend(to[common..].iter().cloned());
    if parts.is_empty() {
        return "./".to_string();
    }
    format!("./{}/", parts.join("/"))
}

fn normal_components(path: &Path) -> Vec<String> {
    let mut parts: Vec<String> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            Component::ParentDir => {
                parts.pop();
            }
            Component::RootDir | Component::Prefix(_) => {
                parts.clear();
                parts.push(component.as_os_str().to_string_lossy().to_string());
            }
            Component::CurDir => {}
        }
    }
    parts
}

/// Local filename for a downloaded image: URL basename with spaces turned
/// into hyphens, lower-cased, `.jpg` when there is no extension.
pub fn image_filename(url: &str) -> String {
    let path = Url::parse(url)
        .map(|parsed| parsed.path().to_string())
        .unwrap_or_else(|_| url.split(['?', '#']).next().unwrap_or("").to_string());
    let basename = path
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("image");
    let mut name = basename
        .replace("%20", "-")
        .replace(' ', "-")
        .to_lowercase();
    if Path::new(&name).extension().is_none() {
        name.push('.');
        name.push_str(DEFAULT_IMAGE_EXTENSION);
    }
    name
}

fn unique_name(candidate: String, used: &HashSet<String>) -> String {
    if !used.contains(&candidate) {
        return candidate;
    }
    let path = Path::new(&candidate);
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();
    let extension = path
        .extension()
        .map(|extension| extension.to_string_lossy().to_string())
        .unwrap_or_else(|| DEFAULT_IMAGE_EXTENSION.to_string());
    let mut counter = 2usize;
    loop {
        let next = format!("{stem}-{counter}.{extension}");
        if !used.contains(&next) {
            return next;
        }
        counter += 1;
    }
}

fn alt_text(title: &str, filename: &str) -> String {
    let stem = Path::new(filename)
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();
    let title = title.trim();
    let text = if title.is_empty() {
        stem
    } else {
        format!("{title} - {stem}")
    };
    text.replace('&', "&amp;").replace('"', "&quot;")
}

fn insert_alt(tag: &str, alt: &str) -> String {
    let body = tag.trim_end_matches('>');
    let (body, closing) = match body.strip_suffix('/') {
        Some(body) => (body.trim_end(), " />"),
        None => (body.trim_end(), ">"),
    };
    format!("{body} alt=\"{alt}\"{closing}")
}

fn is_local_reference(value: &str) -> bool {
    value.starts_with("./") || value.starts_with("../")
}

fn has_skipped_scheme(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    SKIPPED_SCHEMES.iter().any(|scheme| lower.starts_with(scheme))
}

struct Attribute {
    value: String,
    start: usize,
    end: usize,
}

fn find_attribute(tag: &str, pattern: &Regex) -> Option<Attribute> {
    let captures = pattern.captures(tag)?;
    let value = captures
        .get(1)
        .or_else(|| captures.get(2))
        .or_else(|| captures.get(3))?;
    Some(Attribute {
        value: value.as_str().to_string(),
        start: value.start(),
        end: value.end(),
    })
}

fn replace_value(tag: &str, attribute: &Attribute, value: &str) -> String {
    format!("{}{}{}", &tag[..attribute.start], value, &tag[attribute.end..])
}

fn replace_tags<E>(html: &str, pattern: &Regex, mut edit: E) -> Result<String>
where
    E: FnMut(&str) -> Result<Option<String>>,
{
    let mut output = String::with_capacity(html.len());
    let mut last = 0usize;
    for found in pattern.find_iter(html) {
        output.push_str(&html[last..found.start()]);
        match edit(found.as_str())? {
            Some(replacement) => output.push_str(&replacement),
            None => output.push_str(found.as_str()),
        }
        last = found.end();
    }
    output.push_str(&html[last..]);
    Ok(output)
}
