use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::CONFIG_FILENAME;

pub const LOG_FILENAME: &str = "knowledge_article_migration.log";

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
    pub data_dir: Option<PathBuf>,
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
    pub data_dir: PathBuf,
    pub images_dir: PathBuf,
    pub config_path: PathBuf,
    pub log_path: PathBuf,
    pub root_source: ValueSource,
    pub data_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\ndata_dir={} ({})\nimages_dir={}\nconfig_path={} ({})\nlog_path={}",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.data_dir),
            self.data_source.as_str(),
            normalize_for_display(&self.images_dir),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
            normalize_for_display(&self.log_path),
        )
    }

    /// Create `data/` and `data/images/`. Returns the directories that did not exist yet.
    pub fn ensure_layout(&self) -> Result<Vec<PathBuf>> {
        let mut created = Vec::new();
        for dir in [&self.data_dir, &self.images_dir] {
            if !dir.exists() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
                created.push(dir.clone());
            }
        }
        Ok(created)
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
    } else if let Some(value) = lookup_env("KB_PROJECT_ROOT") {
        (
            absolutize(Path::new(value.trim()), &context.cwd),
            ValueSource::Env,
        )
    } else {
        (context.cwd.clone(), ValueSource::Default)
    };

    let (data_dir, data_source) = if let Some(path) = overrides.data_dir.as_deref() {
        (absolutize(path, &project_root), ValueSource::Flag)
    } else if let Some(value) = lookup_env("KB_DATA_DIR") {
        (
            absolutize(Path::new(value.trim()), &project_root),
            ValueSource::Env,
        )
    } else {
        (project_root.join("data"), ValueSource::Default)
    };

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (absolutize(path, &project_root), ValueSource::Flag)
    } else if let Some(value) = lookup_env("KB_CONFIG") {
        (
            absolutize(Path::new(value.trim()), &project_root),
            ValueSource::Env,
        )
    } else {
        (project_root.join(CONFIG_FILENAME), ValueSource::Default)
    };

    Ok(ResolvedPaths {
        images_dir: data_dir.join("images"),
        log_path: project_root.join(LOG_FILENAME),
        project_root,
        data_dir,
        config_path,
        root_source,
        data_source,
        config_source,
    })
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
