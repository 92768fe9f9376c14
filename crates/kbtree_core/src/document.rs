use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

use crate::model::Question;
use crate::store::PlacedCategory;

/// Public URL of a question on the live knowledge base.
pub fn original_url(base: &str, category_codename: Option<&str>, question_codename: &str) -> String {
    let mut url = base.trim_end_matches('/').to_string();
    url.push('/');
    if let Some(category) = category_codename
        .map(str::trim)
        .filter(|category| !category.is_empty())
    {
        url.push_str(category);
        url.push('/');
    }
    url.push_str(question_codename.trim());
    url
}

/// Heading block written at the top of every question document.
pub fn render_question_header(question: &Question, original_url: &str) -> String {
    let mut out = String::new();
    out.push_str(&format!("# {}\n\n", question.name.trim()));
    out.push_str(&format!(
        "**Created At:** {}  \n",
        question.created_at.as_deref().unwrap_or("")
    ));
    out.push_str(&format!(
        "**Updated At:** {}  \n",
        question.updated_at.as_deref().unwrap_or("")
    ));
    out.push_str(&format!(
        "**Original Doc:** [{}]({})  \n",
        question.codename.trim(),
        original_url
    ));
    if let Some(visibility) = question.visibility() {
        out.push_str(&format!("**Visibility:** {}  \n", visibility.as_str()));
    }
    out.push('\n');

    let tags = question
        .tags
        .iter()
        .map(|tag| tag.trim())
        .filter(|tag| !tag.is_empty())
        .collect::<Vec<_>>();
    if !tags.is_empty() {
        out.push_str("**Tags:**\n");
        for tag in tags {
            out.push_str(&format!(
                "<Badge text='{}' vertical='middle' />\n",
                tag.replace('\'', "&#39;")
            ));
        }
        out.push('\n');
    }
    out
}

pub fn render_category_index(category: &PlacedCategory, original_url: &str) -> String {
    let mut out = format!("# {}\n\n", category.name.trim());
    if !category.codename.trim().is_empty() {
        out.push_str(&format!(
            "**Original Doc:** [{}]({})  \n",
            category.codename.trim(),
            original_url
        ));
    }
    out
}

/// Create or truncate `path` with `content`.
pub fn write_document(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))
}

/// Append `content` to `path`, creating the file when missing.
pub fn append_document(path: &Path, content: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(content.as_bytes())
        .with_context(|| format!("failed to append to {}", path.display()))
}
