use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::{Client, Response};
use reqwest::header::LINK;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::SourceSettings;
use crate::error::{RemoteError, is_not_found};
use crate::mapping::{Locale, SourceId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceCategory {
    pub id: SourceId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceFolder {
    pub id: SourceId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub articles_count: u64,
    #[serde(default)]
    pub sub_folders_count: u64,
    #[serde(default)]
    pub visibility: Option<i64>,
    #[serde(default)]
    pub parent_folder_id: Option<SourceId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceArticle {
    pub id: SourceId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: i64,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub folder_id: Option<SourceId>,
    #[serde(default)]
    pub attachments: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Paginated read access to the source knowledge base.
pub trait SourceApi {
    fn list_categories(&mut self) -> Result<Vec<SourceCategory>>;
    fn list_folders(&mut self, category_id: SourceId) -> Result<Vec<SourceFolder>>;
    fn list_subfolders(&mut self, folder_id: SourceId) -> Result<Vec<SourceFolder>>;
    fn list_folder_articles(&mut self, folder_id: SourceId) -> Result<Vec<SourceArticle>>;
    /// `Ok(None)` when the article has no variant in `locale`.
    fn get_translation(
        &mut self,
        article_id: SourceId,
        locale: Locale,
    ) -> Result<Option<SourceArticle>>;
    fn download(&mut self, url: &str) -> Result<Vec<u8>>;
    fn request_count(&self) -> usize;
}

pub struct FreshdeskClient {
    client: Client,
    settings: SourceSettings,
    request_count: usize,
}

impl FreshdeskClient {
    pub fn new(settings: SourceSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .user_agent(settings.user_agent.clone())
            .build()
            .context("failed to build source HTTP client")?;
        Ok(Self {
            client,
            settings,
            request_count: 0,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.settings.api_url, path.trim_start_matches('/'))
    }

    fn get(&mut self, url: &str) -> Result<Response> {
        self.request_count += 1;
        let response = self
            .client
            .get(url)
            .basic_auth(&self.settings.api_key, Some(""))
            .header("Content-Type", "application/json")
            .send()
            .with_context(|| format!("failed to call source API {url}"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(RemoteError::from_status(status, body))
                .with_context(|| format!("source API request failed: {url}"));
        }
        Ok(response)
    }

    fn get_paginated<T: DeserializeOwned>(&mut self, path: &str) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut next = Some(self.endpoint(path));
        while let Some(url) = next.take() {
            let response = self.get(&url)?;
            next = response
                .headers()
                .get_all(LINK)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .find_map(next_link);
            let page: Vec<T> = response
                .json()
                .with_context(|| format!("failed to decode source page {url}"))?;
            items.extend(page);
        }
        Ok(items)
    }
}

impl SourceApi for FreshdeskClient {
    fn list_categories(&mut self) -> Result<Vec<SourceCategory>> {
        self.get_paginated("solutions/categories")
    }

    fn list_folders(&mut self, category_id: SourceId) -> Result<Vec<SourceFolder>> {
        self.get_paginated(&format!("solutions/categories/{category_id}/folders"))
    }

    fn list_subfolders(&mut self, folder_id: SourceId) -> Result<Vec<SourceFolder>> {
        self.get_paginated(&format!("solutions/folders/{folder_id}/subfolders"))
    }

    fn list_folder_articles(&mut self, folder_id: SourceId) -> Result<Vec<SourceArticle>> {
        self.get_paginated(&format!("solutions/folders/{folder_id}/articles"))
    }

    fn get_translation(
        &mut self,
        article_id: SourceId,
        locale: Locale,
    ) -> Result<Option<SourceArticle>> {
        let url = self.endpoint(&format!("solutions/articles/{article_id}/{}", locale.code()));
        let response = match self.get(&url) {
            Ok(response) => response,
            Err(error) if is_not_found(&error) => return Ok(None),
            Err(error) => return Err(error),
        };
        let article: SourceArticle = response
            .json()
            .with_context(|| format!("failed to decode translation {url}"))?;
        Ok(Some(article))
    }

    fn download(&mut self, url: &str) -> Result<Vec<u8>> {
        self.request_count += 1;
        let response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("failed to download {url}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::from_status(status, String::new()))
                .with_context(|| format!("failed to download {url}"));
        }
        let bytes = response
            .bytes()
            .with_context(|| format!("failed to read body of {url}"))?;
        Ok(bytes.to_vec())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

/// Extract the `rel="next"` target from a `Link` header value.
pub fn next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let mut pieces = part.split(';');
        let target = pieces.next()?.trim();
        let is_next = pieces.any(|param| {
            let param = param.trim().replace(' ', "");
            param.eq_ignore_ascii_case("rel=\"next\"") || param.eq_ignore_ascii_case("rel=next")
        });
        if !is_next {
            return None;
        }
        let url = target.strip_prefix('<')?.strip_suffix('>')?;
        Some(url.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::{FreshdeskClient, SourceApi, SourceArticle, SourceFolder, next_link};
    use crate::config::SourceSettings;
    use crate::mapping::Locale;

    fn client_for(base: &str) -> FreshdeskClient {
        FreshdeskClient::new(SourceSettings {
            api_url: format!("{base}/api/v2/"),
            api_key: "key".to_string(),
            link_host: "helpdesk.example.com".to_string(),
            user_agent: "kbmigrate-test".to_string(),
            timeout_ms: 5_000,
        })
        .expect("client")
    }

    #[test]
    fn next_link_is_parsed_from_link_header() {
        assert_eq!(
            next_link(r#"<https://x.freshdesk.com/api/v2/solutions/folders/1/articles?page=2>; rel="next""#)
                .as_deref(),
            Some("https://x.freshdesk.com/api/v2/solutions/folders/1/articles?page=2")
        );
        assert_eq!(
            next_link(r#"<https://x/a?page=1>; rel="prev", <https://x/a?page=3>; rel="next""#)
                .as_deref(),
            Some("https://x/a?page=3")
        );
        assert_eq!(next_link(r#"<https://x/a?page=1>; rel="prev""#), None);
    }

    #[test]
    fn source_payloads_decode_with_defaults() {
        let folder: SourceFolder = serde_json::from_str(
            r#"{"id": 7, "name": "FAQ", "description": null, "visibility": 1, "articles_count": 4, "sub_folders_count": 2, "hierarchy": []}"#,
        )
        .expect("folder");
        assert_eq!(folder.sub_folders_count, 2);
        assert_eq!(folder.parent_folder_id, None);

        let article: SourceArticle = serde_json::from_str(
            r#"{"id": 9, "title": "Hello", "description": "<p>x</p>", "status": 2, "created_at": "2024-01-01T00:00:00Z", "tags": ["a"]}"#,
        )
        .expect("article");
        assert_eq!(article.status, 2);
        assert!(article.attachments.is_empty());
        assert!(article.extra.contains_key("tags"));
        let dumped = serde_json::to_value(&article).expect("dump");
        assert_eq!(dumped["tags"][0], "a");
    }

    #[test]
    fn folder_articles_follow_link_header_pages() {
        let mut server = mockito::Server::new();
        let next = format!(
            "<{}/api/v2/solutions/folders/10/articles-page-2>; rel=\"next\"",
            server.url()
        );
        let first = server
            .mock("GET", "/api/v2/solutions/folders/10/articles")
            .match_header("authorization", "Basic a2V5Og==")
            .with_status(200)
            .with_header("link", &next)
            .with_body(r#"[{"id": 1, "title": "One", "status": 2}, {"id": 2, "title": "Two", "status": 1}]"#)
            .expect(1)
            .create();
        let second = server
            .mock("GET", "/api/v2/solutions/folders/10/articles-page-2")
            .match_header("authorization", "Basic a2V5Og==")
            .with_status(200)
            .with_body(r#"[{"id": 3, "title": "Three", "status": 2}]"#)
            .expect(1)
            .create();

        let mut client = client_for(&server.url());
        let articles = client.list_folder_articles(10).expect("articles");

        assert_eq!(
            articles.iter().map(|article| article.id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        first.assert();
        second.assert();
        assert_eq!(client.request_count(), 2);
    }

    #[test]
    fn missing_translation_is_none() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/api/v2/solutions/articles/7/fr")
            .with_status(404)
            .create();
        server
            .mock("GET", "/api/v2/solutions/articles/8/fr")
            .with_status(200)
            .with_body(r#"{"id": 8, "title": "Bonjour", "description": "<p>Salut</p>", "status": 2}"#)
            .create();
        let failing = server
            .mock("GET", "/api/v2/solutions/articles/9/fr")
            .with_status(403)
            .create();

        let mut client = client_for(&server.url());
        assert!(client.get_translation(7, Locale::French).expect("absent").is_none());
        let french = client
            .get_translation(8, Locale::French)
            .expect("present")
            .expect("translation");
        assert_eq!(french.title, "Bonjour");
        assert!(client.get_translation(9, Locale::French).is_err());
        failing.assert();
    }
}
