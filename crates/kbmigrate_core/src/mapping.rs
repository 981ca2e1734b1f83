use std::collections::BTreeMap;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type SourceId = i64;

pub const SOURCE_STATUS_DRAFT: i64 = 1;
pub const SOURCE_STATUS_PUBLISHED: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Locale {
    English,
    French,
}

impl Locale {
    pub fn code(self) -> &'static str {
        match self {
            Self::English => "en",
            Self::French => "fr",
        }
    }

    pub fn draft_notice(self) -> &'static str {
        match self {
            Self::English => "Note: This article is currently in draft status",
            Self::French => "Remarque: Cet article est actuellement à l'état de brouillon",
        }
    }
}

/// Destination `statecode`/`statuscode` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
    pub statecode: i32,
    pub statuscode: i32,
}

impl Lifecycle {
    pub const DRAFT: Self = Self {
        statecode: 0,
        statuscode: 2,
    };
    pub const PUBLISHED: Self = Self {
        statecode: 3,
        statuscode: 7,
    };

    pub fn for_source_status(status: i64) -> Result<Self> {
        match status {
            SOURCE_STATUS_DRAFT => Ok(Self::DRAFT),
            SOURCE_STATUS_PUBLISHED => Ok(Self::PUBLISHED),
            other => bail!("unsupported source article status {other}"),
        }
    }

    pub fn source_status(self) -> Option<i64> {
        match self {
            Self::DRAFT => Some(SOURCE_STATUS_DRAFT),
            Self::PUBLISHED => Some(SOURCE_STATUS_PUBLISHED),
            _ => None,
        }
    }

    pub fn is_published(self) -> bool {
        self == Self::PUBLISHED
    }
}

/// One ledger row per migrated source article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigratedArticle {
    #[serde(rename = "en_knowledgearticleid")]
    pub en_article_id: String,
    pub en_title: String,
    #[serde(rename = "en_articlenumber", default)]
    pub en_number: Option<String>,
    #[serde(rename = "fr_knowledgearticleid", default, skip_serializing_if = "Option::is_none")]
    pub fr_article_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fr_title: Option<String>,
    #[serde(rename = "fr_articlenumber", default, skip_serializing_if = "Option::is_none")]
    pub fr_number: Option<String>,
    #[serde(rename = "fd_status")]
    pub source_status: i64,
    #[serde(rename = "dynamics_statecode")]
    pub statecode: i32,
    #[serde(rename = "dynamics_statuscode")]
    pub statuscode: i32,
    #[serde(default)]
    pub attachment_count: usize,
    #[serde(default)]
    pub attachments: Vec<Value>,
    #[serde(default)]
    pub internal_references: Vec<String>,
    #[serde(default)]
    pub en_categorized: bool,
    #[serde(default)]
    pub en_published: bool,
    #[serde(default)]
    pub fr_categorized: bool,
    #[serde(default)]
    pub fr_published: bool,
}

impl MigratedArticle {
    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle {
            statecode: self.statecode,
            statuscode: self.statuscode,
        }
    }

    pub fn article_id(&self, locale: Locale) -> Option<&str> {
        match locale {
            Locale::English => Some(self.en_article_id.as_str()),
            Locale::French => self.fr_article_id.as_deref(),
        }
    }

    pub fn number(&self, locale: Locale) -> Option<&str> {
        match locale {
            Locale::English => self.en_number.as_deref(),
            Locale::French => self.fr_number.as_deref(),
        }
    }

    /// Locales that exist at the destination for this entry.
    pub fn locales(&self) -> Vec<Locale> {
        let mut out = vec![Locale::English];
        if self.fr_article_id.is_some() {
            out.push(Locale::French);
        }
        out
    }
}

/// Fields captured at the moment the destination article is created.
#[derive(Debug, Clone)]
pub struct CreatedArticle {
    pub article_id: String,
    pub title: String,
    pub source_status: i64,
    pub lifecycle: Lifecycle,
    pub attachments: Vec<Value>,
    pub internal_references: Vec<String>,
}

/// Mutations applied to an existing ledger row. Every variant only fills in data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArticleField {
    Number(Locale, String),
    Translation { article_id: String, title: String },
    Categorized(Locale),
    Published(Locale),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRecord {
    #[serde(rename = "categoryid")]
    pub category_id: String,
    pub title: String,
    #[serde(default)]
    pub parent_category_id: Option<String>,
    #[serde(default)]
    pub category_number: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MappingSummary {
    pub articles: usize,
    pub translations: usize,
    pub missing_en_numbers: usize,
    pub missing_fr_numbers: usize,
    pub uncategorized: usize,
    pub unpublished: usize,
    pub internal_links: usize,
    pub unresolved_links: usize,
}

/// Source id -> destination identity, separately for categories, articles and
/// internal-link references.
#[derive(Debug, Clone, Default)]
pub struct IdentityMap {
    articles: BTreeMap<SourceId, MigratedArticle>,
    categories: BTreeMap<SourceId, CategoryRecord>,
    link_refs: BTreeMap<SourceId, Vec<String>>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a persisted ledger. Link references are recovered from each row.
    pub fn from_ledger(articles: BTreeMap<SourceId, MigratedArticle>) -> Self {
        let link_refs = articles
            .iter()
            .filter(|(_, entry)| !entry.internal_references.is_empty())
            .map(|(id, entry)| (*id, entry.internal_references.clone()))
            .collect();
        Self {
            articles,
            categories: BTreeMap::new(),
            link_refs,
        }
    }

    pub fn articles(&self) -> &BTreeMap<SourceId, MigratedArticle> {
        &self.articles
    }

    pub fn categories(&self) -> &BTreeMap<SourceId, CategoryRecord> {
        &self.categories
    }

    pub fn link_refs(&self) -> &BTreeMap<SourceId, Vec<String>> {
        &self.link_refs
    }

    pub fn resolve(&self, source_id: SourceId) -> Option<&MigratedArticle> {
        self.articles.get(&source_id)
    }

    pub fn contains(&self, source_id: SourceId) -> bool {
        self.articles.contains_key(&source_id)
    }

    pub fn category(&self, source_id: SourceId) -> Option<&CategoryRecord> {
        self.categories.get(&source_id)
    }

    pub fn record_category(&mut self, source_id: SourceId, record: CategoryRecord) {
        self.categories.entry(source_id).or_insert(record);
    }

    pub fn replace_categories(&mut self, categories: BTreeMap<SourceId, CategoryRecord>) {
        for (source_id, record) in categories {
            self.record_category(source_id, record);
        }
    }

    /// Register the links discovered in an article. Repeated discovery (English then
    /// French content) accumulates without duplicates.
    pub fn record_links(&mut self, source_id: SourceId, links: &[String]) {
        let entry = self.link_refs.entry(source_id).or_default();
        for link in links {
            if !entry.contains(link) {
                entry.push(link.clone());
            }
        }
        if let Some(article) = self.articles.get_mut(&source_id) {
            for link in links {
                if !article.internal_references.contains(link) {
                    article.internal_references.push(link.clone());
                }
            }
        }
    }

    /// Create the ledger row. A second call for the same source id keeps the first identity.
    pub fn record_created(&mut self, source_id: SourceId, created: CreatedArticle) -> &MigratedArticle {
        let mut references = self.link_refs.get(&source_id).cloned().unwrap_or_default();
        for link in created.internal_references {
            if !references.contains(&link) {
                references.push(link);
            }
        }
        self.articles.entry(source_id).or_insert_with(|| MigratedArticle {
            en_article_id: created.article_id,
            en_title: created.title,
            en_number: None,
            fr_article_id: None,
            fr_title: None,
            fr_number: None,
            source_status: created.source_status,
            statecode: created.lifecycle.statecode,
            statuscode: created.lifecycle.statuscode,
            attachment_count: created.attachments.len(),
            attachments: created.attachments,
            internal_references: references,
            en_categorized: false,
            en_published: false,
            fr_categorized: false,
            fr_published: false,
        })
    }

    /// Apply a field update. Fails only when the row does not exist yet.
    pub fn record(&mut self, source_id: SourceId, field: ArticleField) -> Result<()> {
        let Some(entry) = self.articles.get_mut(&source_id) else {
            bail!("no identity recorded for source article {source_id}");
        };
        match field {
            ArticleField::Number(Locale::English, number) => {
                if entry.en_number.is_none() && !number.is_empty() {
                    entry.en_number = Some(number);
                }
            }
            ArticleField::Number(Locale::French, number) => {
                if entry.fr_number.is_none() && !number.is_empty() {
                    entry.fr_number = Some(number);
                }
            }
            ArticleField::Translation { article_id, title } => {
                if entry.fr_article_id.is_none() {
                    entry.fr_article_id = Some(article_id);
                    entry.fr_title = Some(title);
                }
            }
            ArticleField::Categorized(Locale::English) => entry.en_categorized = true,
            ArticleField::Categorized(Locale::French) => entry.fr_categorized = true,
            ArticleField::Published(Locale::English) => entry.en_published = true,
            ArticleField::Published(Locale::French) => entry.fr_published = true,
        }
        Ok(())
    }

    /// `(source id, locale, destination article id)` for every destination article without a number.
    pub fn missing_numbers(&self) -> Vec<(SourceId, Locale, String)> {
        let mut out = Vec::new();
        for (source_id, entry) in &self.articles {
            for locale in entry.locales() {
                if entry.number(locale).is_none()
                    && let Some(article_id) = entry.article_id(locale)
                {
                    out.push((*source_id, locale, article_id.to_string()));
                }
            }
        }
        out
    }

    pub fn summary(&self, resolvable: impl Fn(&str) -> bool) -> MappingSummary {
        let mut summary = MappingSummary {
            articles: self.articles.len(),
            ..MappingSummary::default()
        };
        for entry in self.articles.values() {
            if entry.fr_article_id.is_some() {
                summary.translations += 1;
                if entry.fr_number.is_none() {
                    summary.missing_fr_numbers += 1;
                }
                if !entry.fr_categorized {
                    summary.uncategorized += 1;
                }
                if !entry.fr_published {
                    summary.unpublished += 1;
                }
            }
            if entry.en_number.is_none() {
                summary.missing_en_numbers += 1;
            }
            if !entry.en_categorized {
                summary.uncategorized += 1;
            }
            if !entry.en_published {
                summary.unpublished += 1;
            }
        }
        for links in self.link_refs.values() {
            summary.internal_links += links.len();
            summary.unresolved_links += links.iter().filter(|link| !resolvable(link)).count();
        }
        summary
    }
}
