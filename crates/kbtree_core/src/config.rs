use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::markdown::{MarkdownOptions, UnknownTags};
use crate::rewrite::{LegacyHostRule, LegacyHostTable, RewritePolicy};

pub const DEFAULT_USER_AGENT: &str = "kbtree/0.1";
pub const DEFAULT_API_BASE: &str = "https://{site}.helpjuice.com/api";
pub const DEFAULT_ORIGINAL_URL: &str = "https://docs.{site}.com";
pub const DEFAULT_CANONICAL_ASSET_HOST: &str = "s3.amazonaws.com";
pub const DEFAULT_INTERNAL_DOMAINS: &[&str] = &["{site}.helpjuice.com", "docs.{site}.com"];
const SITE_PLACEHOLDER: &str = "{site}";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct KbConfig {
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub source: SourceSection,
    #[serde(default)]
    pub rewrite: RewriteSection,
    #[serde(default)]
    pub markdown: MarkdownSection,
    #[serde(default)]
    pub sites: Vec<SiteEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct HttpSection {
    pub timeout_ms: Option<u64>,
    pub retries: Option<usize>,
    pub retry_delay_ms: Option<u64>,
    pub rate_limit_ms: Option<u64>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SourceSection {
    pub api_base: Option<String>,
    pub original_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct RewriteSection {
    pub canonical_asset_hosts: Option<Vec<String>>,
    pub internal_domains: Option<Vec<String>>,
    pub image_alt: Option<bool>,
    #[serde(default)]
    pub legacy_hosts: Vec<LegacyHostEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct LegacyHostEntry {
    pub matcher: String,
    pub replacement: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MarkdownSection {
    pub unknown_tags: Option<UnknownTags>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SiteEntry {
    pub name: String,
    pub api_key: Option<String>,
}

/// One site together with the API key it will be migrated with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteKey {
    pub site: String,
    pub api_key: String,
}

/// HTTP knobs after env/config/default resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSettings {
    pub timeout_ms: u64,
    pub retries: usize,
    pub retry_delay_ms: u64,
    pub rate_limit_ms: u64,
    pub user_agent: String,
}

impl KbConfig {
    /// Resolve HTTP settings: env `KBTREE_HTTP_*` > config > defaults.
    pub fn http_settings(&self) -> HttpSettings {
        HttpSettings {
            timeout_ms: env_u64("KBTREE_HTTP_TIMEOUT_MS")
                .or(self.http.timeout_ms)
                .unwrap_or(30_000),
            retries: env_u64("KBTREE_HTTP_RETRIES")
                .map(|value| value as usize)
                .or(self.http.retries)
                .unwrap_or(2),
            retry_delay_ms: env_u64("KBTREE_HTTP_RETRY_DELAY_MS")
                .or(self.http.retry_delay_ms)
                .unwrap_or(500),
            rate_limit_ms: self.http.rate_limit_ms.unwrap_or(250),
            user_agent: env_string("KBTREE_USER_AGENT")
                .or_else(|| self.http.user_agent.clone())
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
        }
    }

    /// API base for one site, e.g. `https://acme.helpjuice.com/api`.
    pub fn api_base(&self, site: &str) -> String {
        let template = self.source.api_base.as_deref().unwrap_or(DEFAULT_API_BASE);
        expand_site(template, site).trim_end_matches('/').to_string()
    }

    /// Public URL prefix that "Original Doc" links point at.
    pub fn original_url(&self, site: &str) -> String {
        let template = self
            .source
            .original_url
            .as_deref()
            .unwrap_or(DEFAULT_ORIGINAL_URL);
        expand_site(template, site).trim_end_matches('/').to_string()
    }

    pub fn rewrite_policy(&self, site: &str) -> RewritePolicy {
        let canonical_asset_hosts = match &self.rewrite.canonical_asset_hosts {
            Some(hosts) => hosts.iter().map(|host| host.to_lowercase()).collect(),
            None => vec![DEFAULT_CANONICAL_ASSET_HOST.to_string()],
        };
        let internal_domains = match &self.rewrite.internal_domains {
            Some(domains) => domains
                .iter()
                .map(|domain| expand_site(domain, site).to_lowercase())
                .collect(),
            None => DEFAULT_INTERNAL_DOMAINS
                .iter()
                .map(|domain| expand_site(domain, site))
                .collect(),
        };
        let legacy_hosts = LegacyHostTable::new(
            self.rewrite
                .legacy_hosts
                .iter()
                .map(|entry| LegacyHostRule::new(&entry.matcher, &entry.replacement))
                .collect(),
        );
        let site_base = self
            .api_base(site)
            .strip_suffix("/api")
            .map(ToString::to_string)
            .unwrap_or_else(|| self.api_base(site));

        RewritePolicy {
            site: site.to_lowercase(),
            site_base,
            canonical_asset_hosts,
            internal_domains,
            legacy_hosts,
            image_alt: self.rewrite.image_alt.unwrap_or(true),
        }
    }

    pub fn markdown_options(&self) -> MarkdownOptions {
        MarkdownOptions {
            unknown_tags: self.markdown.unknown_tags.unwrap_or_default(),
        }
    }

    pub fn site_names(&self) -> Vec<String> {
        self.sites.iter().map(|site| site.name.clone()).collect()
    }

    /// Build the `site -> api key` mapping for the selected sites (all
    /// configured sites when `selected` is empty).
    pub fn site_keys(&self, selected: &[String]) -> Result<Vec<SiteKey>> {
        self.site_keys_with_lookup(selected, |key| env::var(key).ok())
    }

    fn site_keys_with_lookup<F>(&self, selected: &[String], lookup_env: F) -> Result<Vec<SiteKey>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let names = if selected.is_empty() {
            self.site_names()
        } else {
            selected.to_vec()
        };
        if names.is_empty() {
            bail!("no sites configured; add a [[sites]] entry or pass --site");
        }

        let mut keys = Vec::with_capacity(names.len());
        for name in names {
            let name = name.trim().to_string();
            if name.is_empty() {
                bail!("site name cannot be empty");
            }
            let variable = api_key_variable(&name);
            let from_env = lookup_env(&variable).filter(|value| !value.trim().is_empty());
            let from_config = self
                .sites
                .iter()
                .find(|entry| entry.name.eq_ignore_ascii_case(&name))
                .and_then(|entry| entry.api_key.clone())
                .filter(|value| !value.trim().is_empty());
            let Some(api_key) = from_env.or(from_config) else {
                bail!("no API key for site `{name}`; set {variable} or sites.api_key in config");
            };
            keys.push(SiteKey {
                site: name,
                api_key: api_key.trim().to_string(),
            });
        }
        Ok(keys)
    }
}

/// Env var consulted for a site's API key, e.g. `KBTREE_API_KEY_ACME_DOCS`.
pub fn api_key_variable(site: &str) -> String {
    let suffix = site
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() {
                ch.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect::<String>();
    format!("KBTREE_API_KEY_{suffix}")
}

/// Load and parse a KbConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<KbConfig> {
    if !config_path.exists() {
        return Ok(KbConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: KbConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn expand_site(template: &str, site: &str) -> String {
    template.replace(SITE_PLACEHOLDER, &site.trim().to_lowercase())
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(key: &str) -> Option<u64> {
    env_string(key).and_then(|value| value.parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert!(config.sites.is_empty());
        assert_eq!(config.api_base("Acme"), "https://acme.helpjuice.com/api");
        assert_eq!(config.original_url("Acme"), "https://docs.acme.com");
    }

    #[test]
    fn load_config_parses_all_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[http]
timeout_ms = 5000
rate_limit_ms = 0

[source]
api_base = "http://127.0.0.1:9000/{site}/api/"

[rewrite]
canonical_asset_hosts = ["CDN.example.net"]
image_alt = false

[[rewrite.legacy_hosts]]
matcher = "http://www.jbase.com/r5"
replacement = "https://static.zumasys.com/jbase/r99"

[markdown]
unknown_tags = "bypass"

[[sites]]
name = "acme"
api_key = "secret"
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(config.http.timeout_ms, Some(5000));
        assert_eq!(config.api_base("acme"), "http://127.0.0.1:9000/acme/api");
        assert_eq!(config.markdown_options().unknown_tags, UnknownTags::Bypass);

        let policy = config.rewrite_policy("acme");
        assert_eq!(policy.canonical_asset_hosts, vec!["cdn.example.net".to_string()]);
        assert_eq!(
            policy.internal_domains,
            vec!["acme.helpjuice.com".to_string(), "docs.acme.com".to_string()]
        );
        assert!(!policy.image_alt);
        assert_eq!(policy.site_base, "http://127.0.0.1:9000/acme");
        assert_eq!(
            policy.legacy_hosts.apply("http://www.jbase.com/r5/img.png"),
            "https://static.zumasys.com/jbase/r99/img.png"
        );
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[http\ntimeout_ms = 1").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn site_keys_prefer_env_over_config() {
        let config = KbConfig {
            sites: vec![
                SiteEntry {
                    name: "acme".to_string(),
                    api_key: Some("from-config".to_string()),
                },
                SiteEntry {
                    name: "beta-docs".to_string(),
                    api_key: None,
                },
            ],
            ..KbConfig::default()
        };
        let env = HashMap::from([
            ("KBTREE_API_KEY_ACME".to_string(), "from-env".to_string()),
            ("KBTREE_API_KEY_BETA_DOCS".to_string(), "beta".to_string()),
        ]);

        let keys = config
            .site_keys_with_lookup(&[], |key| env.get(key).cloned())
            .expect("keys");
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].api_key, "from-env");
        assert_eq!(keys[1].site, "beta-docs");
        assert_eq!(keys[1].api_key, "beta");
    }

    #[test]
    fn site_keys_fail_without_key() {
        let config = KbConfig::default();
        let error = config
            .site_keys_with_lookup(&["acme".to_string()], |_| None)
            .expect_err("must fail");
        assert!(error.to_string().contains("KBTREE_API_KEY_ACME"));

        let error = config
            .site_keys_with_lookup(&[], |_| None)
            .expect_err("must fail");
        assert!(error.to_string().contains("no sites configured"));
    }
}
