use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::hierarchy::CategoryNode;
use crate::mapping::{CategoryRecord, IdentityMap, MigratedArticle, SourceId};

pub const LEDGER_PREFIX: &str = "migrated_articles";
pub const LINK_REFS_PREFIX: &str = "internal_article_references";
pub const CATEGORIES_PREFIX: &str = "imported_categories";
pub const SOURCE_ARTICLES_PREFIX: &str = "freshdesk_articles";
pub const FOLDERS_PREFIX: &str = "folders";

const FOLDER_CSV_HEADER: &str =
    "id,name,description,articles_count,sub_folders_count,parent_folder_id,is_parent_folder,visibility";

/// UTC run timestamp, `YYYYMMDDHHMMSS`. Sorts chronologically as a string.
pub fn utc_timestamp() -> String {
    Utc::now().format("%Y%m%d%H%M%S").to_string()
}

/// Timestamped state files for one destination environment.
#[derive(Debug, Clone)]
pub struct StateFiles {
    data_dir: PathBuf,
    env_tag: String,
}

impl StateFiles {
    pub fn new(data_dir: &Path, env_tag: &str) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            env_tag: env_tag.to_string(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn ledger_path(&self, timestamp: &str, suffix: Option<&str>) -> PathBuf {
        let suffix = suffix.map(|value| format!("_{value}")).unwrap_or_default();
        self.data_dir.join(format!(
            "{LEDGER_PREFIX}_{}_{timestamp}{suffix}.json",
            self.env_tag
        ))
    }

    pub fn save_ledger(&self, map: &IdentityMap, suffix: Option<&str>) -> Result<PathBuf> {
        let path = unused_path(self.ledger_path(&utc_timestamp(), suffix));
        write_json_atomic(&path, map.articles())?;
        tracing::info!("saved identity ledger ({} entries) to {}", map.articles().len(), path.display());
        Ok(path)
    }

    pub fn latest_ledger(&self) -> Result<Option<PathBuf>> {
        latest_snapshot(&self.data_dir, &format!("{LEDGER_PREFIX}_{}_", self.env_tag))
    }

    pub fn load_ledger(&self, path: &Path) -> Result<BTreeMap<SourceId, MigratedArticle>> {
        read_json(path)
    }

    /// Most recent ledger for this environment, or an empty map.
    pub fn load_latest_identity_map(&self) -> Result<(IdentityMap, Option<PathBuf>)> {
        match self.latest_ledger()? {
            Some(path) => {
                let ledger = self.load_ledger(&path)?;
                tracing::info!("resuming from {} ({} entries)", path.display(), ledger.len());
                Ok((IdentityMap::from_ledger(ledger), Some(path)))
            }
            None => Ok((IdentityMap::new(), None)),
        }
    }

    pub fn save_link_refs(&self, map: &IdentityMap) -> Result<PathBuf> {
        let path = unused_path(
            self.data_dir
                .join(format!("{LINK_REFS_PREFIX}_{}.json", utc_timestamp())),
        );
        write_json_atomic(&path, map.link_refs())?;
        tracing::info!("saved internal article references to {}", path.display());
        Ok(path)
    }

    pub fn save_category_snapshot(
        &self,
        categories: &BTreeMap<SourceId, CategoryRecord>,
    ) -> Result<PathBuf> {
        let path = unused_path(self.data_dir.join(format!(
            "{CATEGORIES_PREFIX}_{}_{}_env.json",
            utc_timestamp(),
            self.env_tag
        )));
        write_json_atomic(&path, categories)?;
        Ok(path)
    }

    /// Raw article dump for one source category.
    pub fn save_source_articles<T: Serialize>(
        &self,
        category_id: SourceId,
        articles: &[T],
    ) -> Result<PathBuf> {
        let path = unused_path(self.data_dir.join(format!(
            "{SOURCE_ARTICLES_PREFIX}_{}_category{category_id}.json",
            utc_timestamp()
        )));
        write_json_atomic(&path, &articles)?;
        Ok(path)
    }

    /// Folder listing for one source category.
    pub fn save_folders_csv(&self, category_id: SourceId, folders: &[CategoryNode]) -> Result<PathBuf> {
        let path = unused_path(self.data_dir.join(format!(
            "{FOLDERS_PREFIX}_{}_category{category_id}.csv",
            utc_timestamp()
        )));
        write_atomic(&path, render_folders_csv(folders).as_bytes())?;
        Ok(path)
    }
}

pub fn render_folders_csv(folders: &[CategoryNode]) -> String {
    let mut out = String::from(FOLDER_CSV_HEADER);
    out.push('\n');
    for folder in folders {
        let row = [
            folder.source_id.to_string(),
            csv_field(&folder.name),
            csv_field(folder.description.as_deref().unwrap_or("")),
            folder.article_count.to_string(),
            folder.child_folder_count.to_string(),
            folder
                .parent_id
                .map(|id| id.to_string())
                .unwrap_or_default(),
            folder.is_parent_folder().to_string(),
            folder
                .visibility
                .map(|tier| tier.code().to_string())
                .unwrap_or_default(),
        ];
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// `path`, or the first `<stem>_<n>.<ext>` sibling that does not exist yet.
fn unused_path(path: PathBuf) -> PathBuf {
    if !path.exists() {
        return path;
    }
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();
    let extension = path
        .extension()
        .map(|extension| format!(".{}", extension.to_string_lossy()))
        .unwrap_or_default();
    let mut counter = 2;
    loop {
        let candidate = path.with_file_name(format!("{stem}_{counter}{extension}"));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// Greatest file (by name) in `dir` starting with `prefix` and ending in `.json`.
pub fn latest_snapshot(dir: &Path, prefix: &str) -> Result<Option<PathBuf>> {
    if !dir.exists() {
        return Ok(None);
    }
    let mut best: Option<(String, PathBuf)> = None;
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(rest) = name.strip_prefix(prefix) else {
            continue;
        };
        if !name.ends_with(".json") || !rest.starts_with(|c: char| c.is_ascii_digit()) {
            continue;
        }
        if best.as_ref().is_none_or(|(current, _)| rest > current.as_str()) {
            best = Some((rest.to_string(), entry.path()));
        }
    }
    Ok(best.map(|(_, path)| path))
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value)
        .with_context(|| format!("failed to serialize {}", path.display()))?;
    write_atomic(path, rendered.as_bytes())
}

/// Write to a sibling temp file then rename over the target.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("path has no file name: {}", path.display()))?;
    let temp = parent.join(format!(".{}.tmp", file_name.to_string_lossy()));
    fs::write(&temp, bytes).with_context(|| format!("failed to write {}", temp.display()))?;
    fs::rename(&temp, path)
        .with_context(|| format!("failed to move {} into place", path.display()))?;
    Ok(())
}
