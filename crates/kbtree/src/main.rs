use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};
use kbtree_core::config::{KbConfig, api_key_variable, load_config};
use kbtree_core::ledger::UnresolvedLedger;
use kbtree_core::pipeline::{MigrationContext, Progress, SiteReport, SitePlan, migrate_site};
use kbtree_core::rewrite::{DocumentContext, ImageFetcher, RewriteEngine};
use kbtree_core::runtime::{
    PathOverrides, ResolutionContext, ResolvedPaths, materialize_config, normalize_for_display,
    resolve_paths,
};
use kbtree_core::source::{HelpjuiceClient, HttpDownloader};
use kbtree_core::store::ContentStore;
use kbtree_core::tree::snapshot_tree;

#[derive(Debug, Parser)]
#[command(
    name = "kbtree",
    version,
    about = "Migrate a hosted knowledge base into a Markdown file tree"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    output_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            output_dir: cli.output_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Write a starter .kbtree/config.toml
    Init(InitArgs),
    /// Migrate every configured site (or the ones named with --site)
    Run(RunArgs),
    /// List configured sites and whether an API key is available
    Sites,
    /// Run the link pass over a local HTML file and print the result
    Rewrite(RewriteArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long = "site", value_name = "NAME", help = "Site to migrate (repeatable)")]
    sites: Vec<String>,
}

#[derive(Debug, Args)]
struct RewriteArgs {
    #[arg(value_name = "FILE")]
    file: PathBuf,
    #[arg(
        long,
        value_name = "PATH",
        help = "Document directory, relative to the site root"
    )]
    document: PathBuf,
    #[arg(long, value_name = "NAME")]
    site: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Run(args)) => run_migration(&runtime, args),
        Some(Commands::Sites) => run_sites(&runtime),
        Some(Commands::Rewrite(args)) => run_rewrite(&runtime, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn setup_logging(verbosity: u8) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let level = match verbosity {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_names(false)
        .with_line_number(false)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let wrote = materialize_config(&paths, args.force)?;

    println!("Initialized kbtree runtime layout");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!("output_root: {}", normalize_for_display(&paths.output_root));
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("wrote_config: {}", format_flag(wrote));
    if !wrote {
        println!("config already exists; pass --force to overwrite");
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_migration(runtime: &RuntimeOptions, args: RunArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let keys = config.site_keys(&args.sites)?;
    let settings = config.http_settings();
    let downloader = HttpDownloader::new(settings.clone())?;
    let mut context = MigrationContext::new(config.markdown_options());
    let started = Instant::now();

    println!("Converting docs into {}", normalize_for_display(&paths.output_root));
    for key in &keys {
        let mut client =
            HelpjuiceClient::new(&config.api_base(&key.site), &key.api_key, settings.clone())?;
        let plan = site_plan(&config, &paths, &key.site);
        let report = migrate_site(
            &mut client,
            &downloader,
            &mut context,
            &plan,
            &mut |event: &Progress| println!("{}", event.message()),
        )
        .with_context(|| format!("migration failed for site {}", key.site))?;
        print_site_report(&report);
    }

    let files = context.ledger.write(&paths.output_root)?;
    let snapshot = snapshot_tree(&paths.output_root)?;

    println!();
    println!("Processing Completed in {:.2?}", started.elapsed());
    println!("sites: {}", context.store.sites().count());
    println!("images_saved: {}", context.images.saved_count());
    println!("unresolved_images: {}", context.ledger.image_count());
    println!("unresolved_links: {}", context.ledger.link_count());
    println!("images_ledger: {}", normalize_for_display(&files.images_path));
    println!("links_ledger: {}", normalize_for_display(&files.links_path));
    println!("tree.files: {}", snapshot.file_count());
    println!("tree.digest: {}", snapshot.digest());
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_sites(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let names = config.site_names();

    println!("sites");
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    if names.is_empty() {
        println!("sites: <none>");
    }
    for name in &names {
        let has_key = config.site_keys(std::slice::from_ref(name)).is_ok();
        println!(
            "site.{name}: key={} env={} output={} legacy_hosts={}",
            format_flag(has_key),
            api_key_variable(name),
            normalize_for_display(&paths.site_root(name)),
            config.rewrite_policy(name).legacy_hosts.len()
        );
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_rewrite(runtime: &RuntimeOptions, args: RewriteArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let site = match args.site {
        Some(site) => site,
        None => match config.site_names().first() {
            Some(site) => site.clone(),
            None => bail!("no site configured; pass --site"),
        },
    };
    let html = fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;

    let policy = config.rewrite_policy(&site);
    if policy.legacy_hosts.is_empty() {
        eprintln!("legacy_hosts: <none>; add [[rewrite.legacy_hosts]] to map retired hosts");
    }
    let store = ContentStore::new();
    let engine = RewriteEngine::new(&store, &policy, &NoDownloads);
    let directory = paths.site_root(&site).join(&args.document);
    let document = DocumentContext {
        site: &site,
        title: "",
        directory: &directory,
    };
    let mut ledger = UnresolvedLedger::new();
    let outcome = engine.link_pass(&document, &html, &mut ledger);

    println!("{}", outcome.html);
    eprintln!("links_rewritten: {}", outcome.links_rewritten);
    eprintln!("links_unresolved: {}", outcome.links_unresolved);
    for link in ledger.links() {
        eprintln!("unresolved: {link}");
    }
    Ok(())
}

/// The offline link pass never touches images.
struct NoDownloads;

impl ImageFetcher for NoDownloads {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        bail!("downloads are disabled: {url}")
    }
}

fn site_plan(config: &KbConfig, paths: &ResolvedPaths, site: &str) -> SitePlan {
    SitePlan {
        site: site.to_string(),
        root: paths.site_root(site),
        policy: config.rewrite_policy(site),
        original_base: config.original_url(site),
    }
}

fn print_site_report(report: &SiteReport) {
    let prefix = format!("site.{}", report.site);
    println!("{prefix}.categories: {}", report.categories);
    println!("{prefix}.questions: {}", report.questions);
    println!("{prefix}.answers: {}", report.answers);
    println!("{prefix}.orphan_answers: {}", report.orphan_answers);
    println!("{prefix}.collisions: {}", report.collisions);
    println!("{prefix}.root_fallbacks: {}", report.root_fallbacks);
    println!("{prefix}.images_saved: {}", report.images_saved);
    println!("{prefix}.images_failed: {}", report.images_failed);
    println!("{prefix}.links_rewritten: {}", report.links_rewritten);
    println!("{prefix}.links_unresolved: {}", report.links_unresolved);
    println!("{prefix}.requests: {}", report.request_count);
    println!("{prefix}.unresolved_images: {}", report.unresolved.image_count());
    println!("{prefix}.unresolved_links: {}", report.unresolved.link_count());
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        output_dir: runtime.output_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, Commands};

    #[test]
    fn parses_repeated_site_flags() {
        let cli = Cli::parse_from(["kbtree", "-vv", "run", "--site", "acme", "--site", "beta"]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Some(Commands::Run(args)) => assert_eq!(args.sites, vec!["acme", "beta"]),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn rewrite_requires_document() {
        assert!(Cli::try_parse_from(["kbtree", "rewrite", "body.html"]).is_err());
        let cli = Cli::try_parse_from([
            "kbtree",
            "--output-dir",
            "out",
            "rewrite",
            "body.html",
            "--document",
            "guides/setup",
        ])
        .expect("parse");
        assert!(matches!(cli.command, Some(Commands::Rewrite(_))));
    }
}
