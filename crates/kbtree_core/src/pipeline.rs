//! One site's migration: categories, then questions, then answers.
//!
//! Each stage depends on the previous one (questions need category
//! directories, answers need question documents), so the stages run in
//! order against a [`MigrationContext`] that carries the content store and
//! the unresolved-reference ledger across every site of the run.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::document::{
    append_document, original_url, render_category_index, render_question_header, write_document,
};
use crate::hierarchy::{DOCUMENT_FILENAME, build_hierarchy, place_question};
use crate::ledger::UnresolvedLedger;
use crate::markdown::{MarkdownOptions, html_to_markdown, sanitize_html};
use crate::model::{Answer, Category, Question};
use crate::rewrite::{DocumentContext, ImageFetcher, ImageRegistry, RewriteEngine, RewritePolicy};
use crate::source::{RecordSource, ResourceKind, fetch_all, fetch_records};
use crate::store::ContentStore;

/// State shared by every site of one run.
#[derive(Debug, Clone, Default)]
pub struct MigrationContext {
    pub store: ContentStore,
    pub images: ImageRegistry,
    pub ledger: UnresolvedLedger,
    pub markdown: MarkdownOptions,
}

impl MigrationContext {
    pub fn new(markdown: MarkdownOptions) -> Self {
        Self {
            store: ContentStore::new(),
            images: ImageRegistry::new(),
            ledger: UnresolvedLedger::new(),
            markdown,
        }
    }
}

/// Everything that differs between sites.
#[derive(Debug, Clone)]
pub struct SitePlan {
    pub site: String,
    pub root: PathBuf,
    pub policy: RewritePolicy,
    /// Base URL of the live knowledge base for "Original Doc" links.
    pub original_base: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    Site { site: String },
    Categories { count: usize },
    Questions { page: u32, count: usize },
    Answers { page: u32, count: usize },
}

impl Progress {
    pub fn message(&self) -> String {
        match self {
            Self::Site { site } => format!("Processing for {site}"),
            Self::Categories { count } => {
                format!("Converting {count} categories into directories")
            }
            Self::Questions { page, count } => {
                format!("Converting {count} questions into files (page {page})")
            }
            Self::Answers { page, count } => {
                format!("Converting {count} answers HTML into Markdown files (page {page})")
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiteReport {
    pub site: String,
    pub categories: usize,
    pub questions: usize,
    pub answers: usize,
    /// Answers whose question was never placed.
    pub orphan_answers: usize,
    pub collisions: usize,
    pub root_fallbacks: usize,
    pub images_saved: usize,
    pub images_failed: usize,
    pub links_rewritten: usize,
    pub links_unresolved: usize,
    pub request_count: usize,
    /// This site's share of the run ledger.
    pub unresolved: UnresolvedLedger,
}

pub fn migrate_site<S, F>(
    source: &mut S,
    fetcher: &F,
    context: &mut MigrationContext,
    plan: &SitePlan,
    progress: &mut dyn FnMut(&Progress),
) -> Result<SiteReport>
where
    S: RecordSource + ?Sized,
    F: ImageFetcher + ?Sized,
{
    let mut report = SiteReport {
        site: plan.site.clone(),
        ..SiteReport::default()
    };
    progress(&Progress::Site {
        site: plan.site.clone(),
    });
    fs::create_dir_all(&plan.root)
        .with_context(|| format!("failed to create {}", plan.root.display()))?;
    context.store.begin_site(&plan.site, &plan.root);
    context.images.forget_under(&plan.root);

    migrate_categories(source, context, plan, &mut report, progress)?;
    migrate_questions(source, context, plan, &mut report, progress)?;
    migrate_answers(source, fetcher, context, plan, &mut report, progress)?;

    report.request_count = source.request_count();
    context.ledger.merge(&report.unresolved);
    Ok(report)
}

fn migrate_categories<S>(
    source: &mut S,
    context: &mut MigrationContext,
    plan: &SitePlan,
    report: &mut SiteReport,
    progress: &mut dyn FnMut(&Progress),
) -> Result<()>
where
    S: RecordSource + ?Sized,
{
    let categories: Vec<Category> = fetch_all(source, ResourceKind::Categories)?;
    progress(&Progress::Categories {
        count: categories.len(),
    });

    let site = context
        .store
        .site_mut(&plan.site)
        .with_context(|| format!("site {} was not started", plan.site))?;
    build_hierarchy(categories, site)
        .with_context(|| format!("failed to build category tree for {}", plan.site))?;

    for category in site.categories_in_order() {
        let url = original_url(&plan.original_base, None, &category.codename);
        write_document(
            &category.local_path.join(DOCUMENT_FILENAME),
            &render_category_index(category, &url),
        )?;
    }
    report.categories = site.category_count();
    Ok(())
}

fn migrate_questions<S>(
    source: &mut S,
    context: &mut MigrationContext,
    plan: &SitePlan,
    report: &mut SiteReport,
    progress: &mut dyn FnMut(&Progress),
) -> Result<()>
where
    S: RecordSource + ?Sized,
{
    let site = context
        .store
        .site_mut(&plan.site)
        .with_context(|| format!("site {} was not started", plan.site))?;

    let mut page = 1u32;
    loop {
        let questions: Vec<Question> = fetch_records(source, ResourceKind::Questions, page)?;
        if questions.is_empty() {
            break;
        }
        progress(&Progress::Questions {
            page,
            count: questions.len(),
        });

        for question in &questions {
            let placement = place_question(question, site)
                .with_context(|| format!("failed to place question {}", question.id))?;
            if placement.collided {
                report.collisions += 1;
            }
            if placement.fell_back_to_root {
                report.root_fallbacks += 1;
            }

            let category_codename = question.primary_category().and_then(|reference| {
                site.category(reference.id)
                    .map(|category| category.codename.clone())
                    .or_else(|| reference.codename.clone())
            });
            let url = original_url(
                &plan.original_base,
                category_codename.as_deref(),
                &question.codename,
            );
            write_document(
                &placement.question.document_path,
                &render_question_header(question, &url),
            )?;
        }
        page += 1;
    }
    report.questions = site.question_count();
    Ok(())
}

fn migrate_answers<S, F>(
    source: &mut S,
    fetcher: &F,
    context: &mut MigrationContext,
    plan: &SitePlan,
    report: &mut SiteReport,
    progress: &mut dyn FnMut(&Progress),
) -> Result<()>
where
    S: RecordSource + ?Sized,
    F: ImageFetcher + ?Sized,
{
    let engine = RewriteEngine::new(&context.store, &plan.policy, fetcher);
    let mut page = 1u32;
    loop {
        let answers: Vec<Answer> = fetch_records(source, ResourceKind::Answers, page)?;
        if answers.is_empty() {
            break;
        }
        progress(&Progress::Answers {
            page,
            count: answers.len(),
        });

        for answer in &answers {
            let Some(question) = context
                .store
                .site(&plan.site)
                .and_then(|site| site.question(answer.question_id))
            else {
                warn!(
                    answer = answer.id,
                    question = answer.question_id,
                    "answer references an unknown question; skipping"
                );
                report.orphan_answers += 1;
                continue;
            };

            let document = DocumentContext {
                site: &plan.site,
                title: &question.name,
                directory: &question.directory,
            };
            let outcome = engine
                .rewrite(
                    &document,
                    &sanitize_html(&answer.body),
                    &mut context.images,
                    &mut report.unresolved,
                )
                .with_context(|| {
                    format!(
                        "failed to rewrite answer {} for {}",
                        answer.id,
                        display_path(&question.document_path)
                    )
                })?;
            let markdown = html_to_markdown(&outcome.html, &context.markdown);
            append_document(&question.document_path, &markdown)?;
            debug!(
                answer = answer.id,
                path = %display_path(&question.document_path),
                "answer written"
            );

            report.answers += 1;
            report.images_saved += outcome.images_saved;
            report.images_failed += outcome.images_failed;
            report.links_rewritten += outcome.links_rewritten;
            report.links_unresolved += outcome.links_unresolved;
        }
        page += 1;
    }
    Ok(())
}

fn display_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
