use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use serde_json::{Map, Value};

use crate::destination::{DestinationApi, DestinationArticle, WebResource};
use crate::error::RemoteError;
use crate::mapping::{CategoryRecord, Locale, SourceId};
use crate::retry::Reauthenticate;
use crate::session::TokenProvider;
use crate::source::{SourceApi, SourceArticle, SourceCategory, SourceFolder};

pub const ORG_URL: &str = "https://org-dev.crm3.dynamics.com/";

pub fn folder(id: SourceId, visibility: i64, sub_folders: u64, parent: Option<SourceId>) -> SourceFolder {
    SourceFolder {
        id,
        name: format!("folder {id}"),
        description: Some(format!("about {id}")),
        articles_count: 0,
        sub_folders_count: sub_folders,
        visibility: Some(visibility),
        parent_folder_id: parent,
    }
}

pub fn article(id: SourceId, status: i64, html: &str) -> SourceArticle {
    SourceArticle {
        id,
        title: format!("article {id}"),
        description: html.to_string(),
        status,
        created_at: Some("2024-01-01T00:00:00Z".to_string()),
        folder_id: None,
        attachments: Vec::new(),
        extra: Map::new(),
    }
}

/// Issues `token-1`, `token-2`, ... on successive acquisitions.
#[derive(Default)]
pub struct SequentialTokens {
    issued: usize,
}

impl TokenProvider for SequentialTokens {
    fn acquire(&mut self) -> Result<String> {
        self.issued += 1;
        Ok(format!("token-{}", self.issued))
    }
}

#[derive(Default)]
pub struct MockSource {
    pub categories: Vec<SourceCategory>,
    pub folders: BTreeMap<SourceId, Vec<SourceFolder>>,
    pub subfolders: BTreeMap<SourceId, Vec<SourceFolder>>,
    pub articles: BTreeMap<SourceId, Vec<SourceArticle>>,
    pub translations: BTreeMap<SourceId, SourceArticle>,
    pub images: BTreeMap<String, Vec<u8>>,
    /// Categories whose folder listing fails.
    pub failing_categories: BTreeSet<SourceId>,
    /// Folders whose article listing fails.
    pub failing_folders: BTreeSet<SourceId>,
    pub requests: usize,
}

impl SourceApi for MockSource {
    fn list_categories(&mut self) -> Result<Vec<SourceCategory>> {
        self.requests += 1;
        Ok(self.categories.clone())
    }

    fn list_folders(&mut self, category_id: SourceId) -> Result<Vec<SourceFolder>> {
        self.requests += 1;
        if self.failing_categories.contains(&category_id) {
            return Err(RemoteError::Transient("HTTP 502".to_string()).into());
        }
        Ok(self.folders.get(&category_id).cloned().unwrap_or_default())
    }

    fn list_subfolders(&mut self, folder_id: SourceId) -> Result<Vec<SourceFolder>> {
        self.requests += 1;
        Ok(self.subfolders.get(&folder_id).cloned().unwrap_or_default())
    }

    fn list_folder_articles(&mut self, folder_id: SourceId) -> Result<Vec<SourceArticle>> {
        self.requests += 1;
        if self.failing_folders.contains(&folder_id) {
            return Err(RemoteError::Transient("HTTP 502".to_string()).into());
        }
        Ok(self.articles.get(&folder_id).cloned().unwrap_or_default())
    }

    fn get_translation(&mut self, article_id: SourceId, locale: Locale) -> Result<Option<SourceArticle>> {
        self.requests += 1;
        if locale != Locale::French {
            return Ok(None);
        }
        Ok(self.translations.get(&article_id).cloned())
    }

    fn download(&mut self, url: &str) -> Result<Vec<u8>> {
        self.requests += 1;
        self.images.get(url).cloned().ok_or_else(|| {
            RemoteError::Permanent {
                status: 404,
                body: url.to_string(),
            }
            .into()
        })
    }

    fn request_count(&self) -> usize {
        self.requests
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockArticle {
    pub payload: Value,
    pub title: Option<String>,
    pub content: Option<String>,
    pub number: Option<String>,
    pub statecode: Option<i32>,
    pub statuscode: Option<i32>,
    pub category: Option<String>,
    pub reads: usize,
    pub translation_of: Option<(String, String)>,
}

#[derive(Default)]
pub struct MockDestination {
    pub categories: BTreeMap<SourceId, CategoryRecord>,
    pub created_categories: Vec<Value>,
    pub languages: BTreeMap<String, String>,
    pub articles: BTreeMap<String, MockArticle>,
    pub created_order: Vec<String>,
    pub category_links: Vec<(String, String)>,
    pub web_resources: Vec<WebResource>,
    pub patches: Vec<(String, Value)>,
    /// `get_article` calls before a generated number becomes visible.
    pub number_delay: usize,
    /// Articles whose number never appears.
    pub never_numbered: BTreeSet<String>,
    /// Web resource names ending in any of these fail permanently.
    pub failing_resources: Vec<String>,
    /// Titles whose creation fails permanently.
    pub failing_titles: BTreeSet<String>,
    pub fail_category_links: bool,
    pub reauths: usize,
    pub resets: usize,
    pub(crate) next_id: usize,
}

impl MockDestination {
    pub fn with_french() -> Self {
        let mut destination = Self::default();
        destination
            .languages
            .insert("French - France".to_string(), "lang-fr".to_string());
        destination
            .languages
            .insert("English - United States".to_string(), "lang-en".to_string());
        destination
    }

    fn next_guid(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:04}", self.next_id)
    }

    fn insert_article(&mut self, payload: Value) -> String {
        let article_id = self.next_guid("ka");
        let number = format!("KA-{:05}", 1000 + self.next_id);
        let title = payload.get("title").and_then(Value::as_str).map(ToString::to_string);
        let content = payload.get("content").and_then(Value::as_str).map(ToString::to_string);
        self.articles.insert(
            article_id.clone(),
            MockArticle {
                payload,
                title,
                content,
                number: Some(number),
                ..MockArticle::default()
            },
        );
        self.created_order.push(article_id.clone());
        article_id
    }

    pub fn article(&self, article_id: &str) -> &MockArticle {
        &self.articles[article_id]
    }
}

impl Reauthenticate for MockDestination {
    fn reauthenticate(&mut self) -> Result<()> {
        self.reauths += 1;
        Ok(())
    }
}

fn permanent(body: &str) -> anyhow::Error {
    RemoteError::Permanent {
        status: 400,
        body: body.to_string(),
    }
    .into()
}

impl DestinationApi for MockDestination {
    fn list_categories(&mut self) -> Result<BTreeMap<SourceId, CategoryRecord>> {
        Ok(self.categories.clone())
    }

    fn create_category(&mut self, payload: &Value) -> Result<CategoryRecord> {
        let source_id = payload
            .get("revops_freshdeskcategoryid")
            .and_then(Value::as_i64)
            .ok_or_else(|| permanent("missing source id"))?;
        let record = CategoryRecord {
            category_id: self.next_guid("cat"),
            title: payload
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            parent_category_id: None,
            category_number: None,
        };
        self.created_categories.push(payload.clone());
        self.categories.insert(source_id, record.clone());
        Ok(record)
    }

    fn list_languages(&mut self) -> Result<BTreeMap<String, String>> {
        Ok(self.languages.clone())
    }

    fn create_article(&mut self, payload: &Value) -> Result<String> {
        let title = payload.get("title").and_then(Value::as_str).unwrap_or_default();
        if self.failing_titles.contains(title) {
            return Err(permanent("rejected"));
        }
        Ok(self.insert_article(payload.clone()))
    }

    fn get_article(&mut self, article_id: &str) -> Result<DestinationArticle> {
        let delay = self.number_delay;
        let hidden = self.never_numbered.contains(article_id);
        let article = self
            .articles
            .get_mut(article_id)
            .ok_or_else(|| RemoteError::Permanent {
                status: 404,
                body: article_id.to_string(),
            })?;
        article.reads += 1;
        let visible = !hidden && article.reads > delay;
        Ok(DestinationArticle {
            article_id: article_id.to_string(),
            title: article.title.clone(),
            number: if visible { article.number.clone() } else { None },
            content: article.content.clone(),
            statecode: article.statecode,
        })
    }

    fn update_article(&mut self, article_id: &str, patch: &Value) -> Result<()> {
        let article = self
            .articles
            .get_mut(article_id)
            .ok_or_else(|| permanent("unknown article"))?;
        if let Some(content) = patch.get("content").and_then(Value::as_str) {
            article.content = Some(content.to_string());
        }
        if let Some(title) = patch.get("title").and_then(Value::as_str) {
            article.title = Some(title.to_string());
        }
        if let Some(code) = patch.get("statecode").and_then(Value::as_i64) {
            article.statecode = i32::try_from(code).ok();
        }
        if let Some(code) = patch.get("statuscode").and_then(Value::as_i64) {
            article.statuscode = i32::try_from(code).ok();
        }
        if let Some(bind) = patch.get("revops_category@odata.bind").and_then(Value::as_str) {
            article.category = Some(bind.to_string());
        }
        self.patches.push((article_id.to_string(), patch.clone()));
        Ok(())
    }

    fn link_category(&mut self, article_id: &str, category_id: &str) -> Result<()> {
        if self.fail_category_links {
            return Err(RemoteError::Transient("HTTP 503".to_string()).into());
        }
        self.category_links
            .push((article_id.to_string(), category_id.to_string()));
        Ok(())
    }

    fn create_translation(&mut self, article_id: &str, language_locale_id: &str) -> Result<String> {
        let source = self
            .articles
            .get(article_id)
            .cloned()
            .ok_or_else(|| permanent("unknown source article"))?;
        let translated = self.insert_article(source.payload);
        if let Some(entry) = self.articles.get_mut(&translated) {
            entry.translation_of = Some((article_id.to_string(), language_locale_id.to_string()));
        }
        Ok(translated)
    }

    fn create_web_resource(&mut self, resource: &WebResource) -> Result<String> {
        if self
            .failing_resources
            .iter()
            .any(|suffix| resource.name.ends_with(suffix.as_str()))
        {
            return Err(permanent("web resource rejected"));
        }
        self.web_resources.push(resource.clone());
        Ok(format!("{ORG_URL}WebResources/{}", resource.name))
    }

    fn reset_session(&mut self) -> Result<()> {
        self.resets += 1;
        Ok(())
    }
}
