use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const STATE_DIR_NAME: &str = ".kbtree";
pub const DEFAULT_OUTPUT_DIR: &str = "docs";
pub const IMAGES_LEDGER_FILENAME: &str = "Images.txt";
pub const LINKS_LEDGER_FILENAME: &str = "Links.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        Ok(Self { cwd })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub output_root: PathBuf,
    pub config_path: PathBuf,
    pub root_source: ValueSource,
    pub output_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    /// Directory that receives one site's generated tree.
    pub fn site_root(&self, site: &str) -> PathBuf {
        self.output_root.join(site.trim().to_lowercase())
    }

    pub fn images_ledger_path(&self) -> PathBuf {
        self.output_root.join(IMAGES_LEDGER_FILENAME)
    }

    pub fn links_ledger_path(&self) -> PathBuf {
        self.output_root.join(LINKS_LEDGER_FILENAME)
    }

    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\nstate_dir={}\noutput_root={} ({})\nconfig_path={} ({})\nimages_ledger={}\nlinks_ledger={}",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.output_root),
            self.output_source.as_str(),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
            normalize_for_display(&self.images_ledger_path()),
            normalize_for_display(&self.links_ledger_path()),
        )
    }
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = if let Some(path) = overrides.project_root.as_deref() {
        (absolutize(path, &context.cwd), ValueSource::Flag)
    } else if let Some(value) = non_empty(lookup_env("KBTREE_PROJECT_ROOT")) {
        (
            absolutize(Path::new(value.trim()), &context.cwd),
            ValueSource::Env,
        )
    } else {
        (context.cwd.clone(), ValueSource::Default)
    };

    let state_dir = project_root.join(STATE_DIR_NAME);

    let (output_root, output_source) = if let Some(path) = overrides.output_dir.as_deref() {
        (absolutize(path, &project_root), ValueSource::Flag)
    } else if let Some(value) = non_empty(lookup_env("KBTREE_OUTPUT_DIR")) {
        (
            absolutize(Path::new(value.trim()), &project_root),
            ValueSource::Env,
        )
    } else {
        (project_root.join(DEFAULT_OUTPUT_DIR), ValueSource::Default)
    };

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (absolutize(path, &project_root), ValueSource::Flag)
    } else if let Some(value) = non_empty(lookup_env("KBTREE_CONFIG")) {
        (
            absolutize(Path::new(value.trim()), &project_root),
            ValueSource::Env,
        )
    } else {
        (state_dir.join("config.toml"), ValueSource::Default)
    };

    Ok(ResolvedPaths {
        project_root,
        state_dir,
        output_root,
        config_path,
        root_source,
        output_source,
        config_source,
    })
}

/// Write the commented starter config. Returns `false` when a config already
/// exists and `force` is not set.
pub fn materialize_config(paths: &ResolvedPaths, force: bool) -> Result<bool> {
    write_text_file(&paths.config_path, STARTER_CONFIG, force)
}

const STARTER_CONFIG: &str = r#"# kbtree configuration

[http]
# timeout_ms = 30000
# retries = 2
# retry_delay_ms = 500
# rate_limit_ms = 250
# user_agent = "kbtree/0.1"

[source]
# api_base = "https://{site}.helpjuice.com/api"
# original_url = "https://docs.{site}.com"

[rewrite]
# canonical_asset_hosts = ["s3.amazonaws.com"]
# internal_domains = ["{site}.helpjuice.com", "docs.{site}.com"]
# image_alt = true

# [[rewrite.legacy_hosts]]
# matcher = "http://www.example.com/old"
# replacement = "https://static.example.com/new"

[markdown]
# unknown_tags = "pass-through"

# API keys are read from KBTREE_API_KEY_<SITE> (or a .env file) when not set here.
# [[sites]]
# name = "example"
# api_key = "..."
"#;

fn write_text_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }

    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tempfile::tempdir;

    use super::{
        PathOverrides, ResolutionContext, ValueSource, materialize_config,
        resolve_paths_with_lookup,
    };

    #[test]
    fn resolve_paths_prefers_flag_over_env() {
        let temp = tempdir().expect("tempdir");
        let from_flag = temp.path().join("flag-root");
        let context = ResolutionContext {
            cwd: temp.path().join("cwd"),
        };
        let overrides = PathOverrides {
            project_root: Some(from_flag.clone()),
            ..PathOverrides::default()
        };
        let env = HashMap::from([(
            "KBTREE_PROJECT_ROOT".to_string(),
            temp.path().join("env-root").to_string_lossy().to_string(),
        )]);

        let resolved = resolve_paths_with_lookup(&context, &overrides, |key| env.get(key).cloned())
            .expect("resolve paths");
        assert_eq!(resolved.project_root, from_flag);
        assert_eq!(resolved.root_source, ValueSource::Flag);
        assert_eq!(resolved.output_root, from_flag.join("docs"));
        assert_eq!(resolved.output_source, ValueSource::Default);
    }

    #[test]
    fn relative_env_output_dir_resolves_against_project_root() {
        let temp = tempdir().expect("tempdir");
        let context = ResolutionContext {
            cwd: temp.path().to_path_buf(),
        };
        let env = HashMap::from([("KBTREE_OUTPUT_DIR".to_string(), "out/md".to_string())]);

        let resolved =
            resolve_paths_with_lookup(&context, &PathOverrides::default(), |key| {
                env.get(key).cloned()
            })
            .expect("resolve paths");
        assert_eq!(resolved.output_root, temp.path().join("out/md"));
        assert_eq!(resolved.output_source, ValueSource::Env);
        assert_eq!(resolved.site_root("Zumasys"), temp.path().join("out/md/zumasys"));
        assert!(resolved.images_ledger_path().ends_with("Images.txt"));
        assert!(resolved.links_ledger_path().ends_with("Links.txt"));
    }

    #[test]
    fn materialize_config_respects_force() {
        let temp = tempdir().expect("tempdir");
        let context = ResolutionContext {
            cwd: temp.path().to_path_buf(),
        };
        let paths = resolve_paths_with_lookup(&context, &PathOverrides::default(), |_| None)
            .expect("resolve");

        assert!(materialize_config(&paths, false).expect("first write"));
        assert!(paths.config_path.exists());
        assert!(!materialize_config(&paths, false).expect("second write"));
        assert!(materialize_config(&paths, true).expect("forced write"));
        assert!(paths.diagnostics().contains("config_path="));
    }
}
