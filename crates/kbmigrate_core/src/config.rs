use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILENAME: &str = "kbmigrate.toml";
pub const DEFAULT_USER_AGENT: &str = "kbmigrate/0.2";
pub const DEFAULT_SOURCE_API_URL: &str = "https://yourcompany.freshdesk.com/api/v2/";
pub const DEFAULT_SOURCE_LINK_HOST: &str = "helpdesk.yourcompany.com";
pub const DEFAULT_API_VERSION: &str = "v9.2";
pub const DEFAULT_FRENCH_LOCALE_NAME: &str = "French - France";
pub const DEFAULT_CHUNK_SIZE: usize = 50;
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 120_000;

const BUILTIN_ENVIRONMENTS: [(&str, char, &str); 4] = [
    ("dev", 'd', "https://yourorg-dev.crm3.dynamics.com/"),
    ("devportal", 'e', "https://yourorg-devportal.crm3.dynamics.com/"),
    ("staging", 's', "https://yourorg-staging.crm3.dynamics.com/"),
    ("prod", 'p', "https://yourorg-prod.crm3.dynamics.com/"),
];

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MigrationConfig {
    #[serde(default)]
    pub source: SourceSection,
    #[serde(default)]
    pub destination: DestinationSection,
    #[serde(default)]
    pub run: RunSection,
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentSection>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SourceSection {
    pub api_url: Option<String>,
    pub link_host: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct DestinationSection {
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub api_version: Option<String>,
    pub french_locale_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct RunSection {
    pub chunk_size: Option<usize>,
    pub http_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct EnvironmentSection {
    pub key: Option<char>,
    pub org_url: Option<String>,
    pub portal_url: Option<String>,
    pub scope: Option<String>,
}

/// A destination deployment the operator can target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub name: String,
    pub key: char,
    pub org_url: String,
    pub portal_url: String,
    pub scope: String,
    pub refresh_token: Option<String>,
}

impl Environment {
    /// Tag used in persisted filenames: `https://org-<tag>.crm3...` yields `<tag>`.
    pub fn tag(&self) -> String {
        environment_tag(&self.org_url).unwrap_or_else(|| self.name.clone())
    }

    pub fn api_base(&self, api_version: &str) -> String {
        format!("{}api/data/{api_version}/", with_trailing_slash(&self.org_url))
    }
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub api_url: String,
    pub api_key: String,
    pub link_host: String,
    pub user_agent: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct DestinationSettings {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub api_version: String,
    pub french_locale_name: String,
    pub user_agent: String,
    pub timeout_ms: u64,
}

/// Every wait the migration performs between remote calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunTimings {
    pub auth_backoff_base: Duration,
    pub long_write_backoff: Duration,
    pub short_write_backoff: Duration,
    pub number_poll_step: Duration,
    pub creation_settle: Duration,
    pub category_settle: Duration,
}

impl Default for RunTimings {
    fn default() -> Self {
        Self {
            auth_backoff_base: Duration::from_secs(5),
            long_write_backoff: Duration::from_secs(360),
            short_write_backoff: Duration::from_secs(30),
            number_poll_step: Duration::from_secs(5),
            creation_settle: Duration::from_secs(10),
            category_settle: Duration::from_secs(5),
        }
    }
}

impl RunTimings {
    pub fn immediate() -> Self {
        Self {
            auth_backoff_base: Duration::ZERO,
            long_write_backoff: Duration::ZERO,
            short_write_backoff: Duration::ZERO,
            number_poll_step: Duration::ZERO,
            creation_settle: Duration::ZERO,
            category_settle: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub chunk_size: usize,
    pub timings: RunTimings,
}

impl MigrationConfig {
    /// All known environments: built-ins overlaid with `[environments.*]` entries.
    pub fn environments(&self) -> Vec<Environment> {
        self.environments_with(&process_env)
    }

    /// Resolve an environment by single-letter key or by name.
    pub fn environment(&self, selector: &str) -> Result<Environment> {
        self.environment_with(selector, &process_env)
    }

    pub fn source_settings(&self) -> Result<SourceSettings> {
        self.source_settings_with(&process_env)
    }

    pub fn destination_settings(&self) -> Result<DestinationSettings> {
        self.destination_settings_with(&process_env)
    }

    pub fn run_settings(&self) -> RunSettings {
        self.run_settings_with(&process_env)
    }

    fn environments_with(&self, lookup: &dyn Fn(&str) -> Option<String>) -> Vec<Environment> {
        let mut merged: BTreeMap<String, EnvironmentSection> = BUILTIN_ENVIRONMENTS
            .iter()
            .map(|(name, key, org_url)| {
                (
                    (*name).to_string(),
                    EnvironmentSection {
                        key: Some(*key),
                        org_url: Some((*org_url).to_string()),
                        portal_url: None,
                        scope: None,
                    },
                )
            })
            .collect();
        for (name, section) in &self.environments {
            let entry = merged.entry(name.clone()).or_default();
            if section.key.is_some() {
                entry.key = section.key;
            }
            if section.org_url.is_some() {
                entry.org_url = section.org_url.clone();
            }
            if section.portal_url.is_some() {
                entry.portal_url = section.portal_url.clone();
            }
            if section.scope.is_some() {
                entry.scope = section.scope.clone();
            }
        }

        let mut output = Vec::new();
        for (name, section) in merged {
            let Some(org_url) = section.org_url.map(|url| with_trailing_slash(&url)) else {
                continue;
            };
            let key = section
                .key
                .or_else(|| name.chars().next())
                .unwrap_or('?')
                .to_ascii_lowercase();
            let suffix = name.to_ascii_uppercase();
            let scope = lookup(&format!("KB_SCOPE_{suffix}"))
                .or(section.scope)
                .unwrap_or_else(|| format!("{org_url}.default"));
            let portal_url = section
                .portal_url
                .map(|url| with_trailing_slash(&url))
                .unwrap_or_else(|| derive_portal_url(&org_url));
            output.push(Environment {
                refresh_token: lookup(&format!("KB_REFRESH_TOKEN_{suffix}")),
                name,
                key,
                org_url,
                portal_url,
                scope,
            });
        }
        output
    }

    fn environment_with(
        &self,
        selector: &str,
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Environment> {
        let selector = selector.trim().to_ascii_lowercase();
        if selector.is_empty() {
            bail!("environment selection cannot be empty");
        }
        let environments = self.environments_with(lookup);
        let found = environments.iter().find(|env| {
            env.name.eq_ignore_ascii_case(&selector)
                || (selector.chars().count() == 1 && selector.starts_with(env.key))
        });
        match found {
            Some(env) => Ok(env.clone()),
            None => bail!(
                "unknown environment `{selector}`; expected one of: {}",
                environments
                    .iter()
                    .map(|env| format!("{} ({})", env.key, env.name))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }

    fn source_settings_with(
        &self,
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> Result<SourceSettings> {
        let api_key = lookup("KB_SOURCE_API_KEY")
            .ok_or_else(|| anyhow::anyhow!("KB_SOURCE_API_KEY is not set"))?;
        Ok(SourceSettings {
            api_url: with_trailing_slash(
                &lookup("KB_SOURCE_API_URL")
                    .or_else(|| self.source.api_url.clone())
                    .unwrap_or_else(|| DEFAULT_SOURCE_API_URL.to_string()),
            ),
            api_key,
            link_host: lookup("KB_SOURCE_LINK_HOST")
                .or_else(|| self.source.link_host.clone())
                .unwrap_or_else(|| DEFAULT_SOURCE_LINK_HOST.to_string()),
            user_agent: self.user_agent_with(lookup),
            timeout_ms: self.timeout_ms_with(lookup),
        })
    }

    fn destination_settings_with(
        &self,
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> Result<DestinationSettings> {
        let tenant_id = lookup("KB_TENANT_ID")
            .or_else(|| self.destination.tenant_id.clone())
            .ok_or_else(|| anyhow::anyhow!("KB_TENANT_ID is not set"))?;
        let client_id = lookup("KB_CLIENT_ID")
            .or_else(|| self.destination.client_id.clone())
            .ok_or_else(|| anyhow::anyhow!("KB_CLIENT_ID is not set"))?;
        let client_secret = lookup("KB_CLIENT_SECRET")
            .ok_or_else(|| anyhow::anyhow!("KB_CLIENT_SECRET is not set"))?;
        Ok(DestinationSettings {
            tenant_id,
            client_id,
            client_secret,
            api_version: self
                .destination
                .api_version
                .clone()
                .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
            french_locale_name: self
                .destination
                .french_locale_name
                .clone()
                .unwrap_or_else(|| DEFAULT_FRENCH_LOCALE_NAME.to_string()),
            user_agent: self.user_agent_with(lookup),
            timeout_ms: self.timeout_ms_with(lookup),
        })
    }

    fn run_settings_with(&self, lookup: &dyn Fn(&str) -> Option<String>) -> RunSettings {
        let chunk_size = lookup("KB_CHUNK_SIZE")
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|size| *size > 0)
            .or(self.run.chunk_size.filter(|size| *size > 0))
            .unwrap_or(DEFAULT_CHUNK_SIZE);
        RunSettings {
            chunk_size,
            timings: RunTimings::default(),
        }
    }

    fn user_agent_with(&self, lookup: &dyn Fn(&str) -> Option<String>) -> String {
        lookup("KB_USER_AGENT")
            .or_else(|| self.source.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    fn timeout_ms_with(&self, lookup: &dyn Fn(&str) -> Option<String>) -> u64 {
        lookup("KB_HTTP_TIMEOUT_MS")
            .and_then(|value| value.parse::<u64>().ok())
            .or(self.run.http_timeout_ms)
            .unwrap_or(DEFAULT_HTTP_TIMEOUT_MS)
    }
}

/// Load and parse a MigrationConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<MigrationConfig> {
    if !config_path.exists() {
        return Ok(MigrationConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: MigrationConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

/// `https://org-dev.crm3.dynamics.com/` -> `dev`.
pub fn environment_tag(org_url: &str) -> Option<String> {
    let host = url::Url::parse(org_url).ok()?.host_str()?.to_string();
    let first_label = host.split('.').next()?;
    let (_, tag) = first_label.split_once('-')?;
    if tag.is_empty() {
        return None;
    }
    Some(tag.to_string())
}

pub fn derive_portal_url(org_url: &str) -> String {
    with_trailing_slash(org_url).replace("crm3.dynamics.com/", "powerappsportals.com/")
}

fn with_trailing_slash(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    }
}

fn process_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;

    use tempfile::tempdir;

    use super::{
        DEFAULT_CHUNK_SIZE, MigrationConfig, derive_portal_url, environment_tag, load_config,
    };

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect::<BTreeMap<_, _>>();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn missing_config_file_yields_defaults() {
        let temp = tempdir().expect("tempdir");
        let config = load_config(&temp.path().join("kbmigrate.toml")).expect("load");
        assert_eq!(config, MigrationConfig::default());
    }

    #[test]
    fn environment_resolves_by_letter_and_name() {
        let config = MigrationConfig::default();
        let lookup = lookup_from(&[("KB_REFRESH_TOKEN_STAGING", "token-s")]);
        let by_letter = config.environment_with("S", &lookup).expect("letter");
        assert_eq!(by_letter.name, "staging");
        assert_eq!(by_letter.refresh_token.as_deref(), Some("token-s"));
        assert_eq!(by_letter.tag(), "staging");
        let by_name = config.environment_with("devportal", &lookup).expect("name");
        assert_eq!(by_name.key, 'e');
        assert!(config.environment_with("x", &lookup).is_err());
    }

    #[test]
    fn config_file_overrides_builtin_environment() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("kbmigrate.toml");
        fs::write(
            &path,
            "[run]\nchunk_size = 20\n\n[environments.prod]\norg_url = \"https://acme-live.crm3.dynamics.com\"\nscope = \"https://acme-live.crm3.dynamics.com/user_impersonation\"\n",
        )
        .expect("write config");
        let config = load_config(&path).expect("load");
        let env = config
            .environment_with("p", &lookup_from(&[]))
            .expect("prod");
        assert_eq!(env.org_url, "https://acme-live.crm3.dynamics.com/");
        assert_eq!(env.portal_url, "https://acme-live.powerappsportals.com/");
        assert_eq!(env.tag(), "live");
        assert_eq!(
            env.api_base("v9.2"),
            "https://acme-live.crm3.dynamics.com/api/data/v9.2/"
        );
        assert_eq!(config.run_settings_with(&lookup_from(&[])).chunk_size, 20);
    }

    #[test]
    fn env_values_take_precedence_over_file() {
        let config = MigrationConfig::default();
        let lookup = lookup_from(&[("KB_CHUNK_SIZE", "7"), ("KB_SOURCE_API_KEY", "abc")]);
        assert_eq!(config.run_settings_with(&lookup).chunk_size, 7);
        let source = config.source_settings_with(&lookup).expect("source");
        assert_eq!(source.api_key, "abc");
        assert!(source.api_url.ends_with('/'));

        let zero = lookup_from(&[("KB_CHUNK_SIZE", "0")]);
        assert_eq!(config.run_settings_with(&zero).chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(config.source_settings_with(&lookup_from(&[])).is_err());
    }

    #[test]
    fn unusable_chunk_size_env_falls_back_to_file() {
        let mut config = MigrationConfig::default();
        config.run.chunk_size = Some(20);
        let zero = lookup_from(&[("KB_CHUNK_SIZE", "0")]);
        assert_eq!(config.run_settings_with(&zero).chunk_size, 20);
        let garbage = lookup_from(&[("KB_CHUNK_SIZE", "lots")]);
        assert_eq!(config.run_settings_with(&garbage).chunk_size, 20);

        config.run.chunk_size = Some(0);
        assert_eq!(config.run_settings_with(&zero).chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn derives_tag_and_portal_from_org_url() {
        assert_eq!(
            environment_tag("https://yourorg-dev.crm3.dynamics.com/").as_deref(),
            Some("dev")
        );
        assert_eq!(environment_tag("https://plain.example.com/"), None);
        assert_eq!(
            derive_portal_url("https://yourorg-dev.crm3.dynamics.com"),
            "https://yourorg-dev.powerappsportals.com/"
        );
    }
}
