use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Method;
use reqwest::blocking::Client;
use serde::Serialize;
use serde_json::{Value, json};

use crate::config::{DestinationSettings, Environment, RunTimings};
use crate::error::RemoteError;
use crate::mapping::{CategoryRecord, Lifecycle, SourceId};
use crate::retry::{Reauthenticate, RetryPolicy};
use crate::session::Session;

pub const DEFAULT_CALL_ATTEMPTS: usize = 3;

/// Web resource type code for PNG images.
pub const WEB_RESOURCE_PNG: i32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationArticle {
    pub article_id: String,
    pub title: Option<String>,
    pub number: Option<String>,
    pub content: Option<String>,
    pub statecode: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebResource {
    pub name: String,
    #[serde(rename = "displayname")]
    pub display_name: String,
    pub description: String,
    pub content: String,
    #[serde(rename = "webresourcetype")]
    pub resource_type: i32,
}

/// Write/read access to the destination knowledge base.
pub trait DestinationApi: Reauthenticate {
    fn list_categories(&mut self) -> Result<BTreeMap<SourceId, CategoryRecord>>;
    fn create_category(&mut self, payload: &Value) -> Result<CategoryRecord>;
    /// Display name -> language locale id.
    fn list_languages(&mut self) -> Result<BTreeMap<String, String>>;
    fn create_article(&mut self, payload: &Value) -> Result<String>;
    fn get_article(&mut self, article_id: &str) -> Result<DestinationArticle>;
    fn update_article(&mut self, article_id: &str, patch: &Value) -> Result<()>;
    fn link_category(&mut self, article_id: &str, category_id: &str) -> Result<()>;
    fn create_translation(&mut self, article_id: &str, language_locale_id: &str) -> Result<String>;
    /// Returns the public URL of the created resource.
    fn create_web_resource(&mut self, resource: &WebResource) -> Result<String>;
    /// Drop pooled connections; the next call starts a new session.
    fn reset_session(&mut self) -> Result<()>;
}

pub fn category_lookup_patch(category_id: &str) -> Value {
    json!({ "revops_category@odata.bind": format!("/categories({category_id})") })
}

pub fn lifecycle_patch(lifecycle: Lifecycle) -> Value {
    json!({ "statecode": lifecycle.statecode, "statuscode": lifecycle.statuscode })
}

pub fn content_patch(content: &str, title: Option<&str>) -> Value {
    let mut patch = json!({ "content": content });
    if let Some(title) = title {
        patch["title"] = Value::String(title.to_string());
    }
    patch
}

pub struct DataverseClient {
    client: Client,
    session: Session,
    api_base: String,
    org_url: String,
    timeout: Duration,
    user_agent: String,
    call_policy: RetryPolicy,
    request_count: usize,
}

impl DataverseClient {
    pub fn new(
        settings: &DestinationSettings,
        environment: &Environment,
        session: Session,
        timings: &RunTimings,
    ) -> Result<Self> {
        let timeout = Duration::from_millis(settings.timeout_ms);
        Ok(Self {
            client: build_client(timeout, &settings.user_agent)?,
            session,
            api_base: environment.api_base(&settings.api_version),
            org_url: environment.org_url.clone(),
            timeout,
            user_agent: settings.user_agent.clone(),
            call_policy: RetryPolicy::remote_call(timings, DEFAULT_CALL_ATTEMPTS),
            request_count: 0,
        })
    }

    pub fn request_count(&self) -> usize {
        self.request_count
    }

    /// One remote call with credential-expiry detection and bounded retry.
    ///
    /// Authorization rejections and transport faults refresh the credential and
    /// back off exponentially; any other non-success status is returned at once.
    pub fn call(&mut self, method: Method, endpoint: &str, body: Option<&Value>) -> Result<Option<Value>> {
        let url = if endpoint.starts_with("https://") || endpoint.starts_with("http://") {
            endpoint.to_string()
        } else {
            format!("{}{}", self.api_base, endpoint.trim_start_matches('/'))
        };
        let label = format!("{method} {url}");
        let policy = self.call_policy;
        policy.run(&label, self, |client| client.send_once(&method, &url, body))
    }

    fn send_once(&mut self, method: &Method, url: &str, body: Option<&Value>) -> Result<Option<Value>> {
        let token = self.session.bearer()?;
        self.request_count += 1;
        let mut request = self
            .client
            .request(method.clone(), url)
            .bearer_auth(token)
            .header("Accept", "application/json")
            .header("OData-MaxVersion", "4.0")
            .header("OData-Version", "4.0");
        if *method != Method::GET {
            request = request.header("Prefer", "return=representation");
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .with_context(|| format!("failed to call {method} {url}"))?;
        let status = response.status();
        let text = response
            .text()
            .with_context(|| format!("failed to read response of {method} {url}"))?;
        if !status.is_success() {
            tracing::error!("HTTP error {status} from {method} {url}: {text}");
            return Err(RemoteError::from_status(status, text).into());
        }
        if text.trim().is_empty() {
            return Ok(None);
        }
        let payload = serde_json::from_str(&text)
            .with_context(|| format!("failed to decode response of {method} {url}"))?;
        Ok(Some(payload))
    }

    fn expect_body(&mut self, method: Method, endpoint: &str, body: Option<&Value>) -> Result<Value> {
        self.call(method, endpoint, body)?
            .ok_or_else(|| anyhow::anyhow!("empty response from {endpoint}"))
    }
}

impl Reauthenticate for DataverseClient {
    fn reauthenticate(&mut self) -> Result<()> {
        self.session.refresh()?;
        self.client = build_client(self.timeout, &self.user_agent)?;
        Ok(())
    }
}

impl DestinationApi for DataverseClient {
    fn list_categories(&mut self) -> Result<BTreeMap<SourceId, CategoryRecord>> {
        let mut categories = BTreeMap::new();
        let mut next = Some("categories".to_string());
        while let Some(endpoint) = next.take() {
            let payload = self.expect_body(Method::GET, &endpoint, None)?;
            for item in payload
                .get("value")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                let Some(source_id) = item.get("revops_freshdeskcategoryid").and_then(as_source_id)
                else {
                    continue;
                };
                categories.insert(source_id, category_record(item)?);
            }
            next = payload
                .get("@odata.nextLink")
                .and_then(Value::as_str)
                .map(ToString::to_string);
        }
        Ok(categories)
    }

    fn create_category(&mut self, payload: &Value) -> Result<CategoryRecord> {
        let created = self.expect_body(Method::POST, "categories", Some(payload))?;
        category_record(&created)
    }

    fn list_languages(&mut self) -> Result<BTreeMap<String, String>> {
        let payload = self.expect_body(Method::GET, "languagelocale", None)?;
        let mut languages = BTreeMap::new();
        for item in payload
            .get("value")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            if let (Some(name), Some(id)) = (
                item.get("name").and_then(Value::as_str),
                item.get("languagelocaleid").and_then(Value::as_str),
            ) {
                languages.insert(name.to_string(), id.to_string());
            }
        }
        Ok(languages)
    }

    fn create_article(&mut self, payload: &Value) -> Result<String> {
        let created = self.expect_body(Method::POST, "knowledgearticles", Some(payload))?;
        string_field(&created, "knowledgearticleid")
    }

    fn get_article(&mut self, article_id: &str) -> Result<DestinationArticle> {
        let payload = self.expect_body(
            Method::GET,
            &format!(
                "knowledgearticles({article_id})?$select=articlepublicnumber,title,content,statecode"
            ),
            None,
        )?;
        Ok(DestinationArticle {
            article_id: article_id.to_string(),
            title: optional_string(&payload, "title"),
            number: optional_string(&payload, "articlepublicnumber"),
            content: optional_string(&payload, "content"),
            statecode: payload
                .get("statecode")
                .and_then(Value::as_i64)
                .and_then(|code| i32::try_from(code).ok()),
        })
    }

    fn update_article(&mut self, article_id: &str, patch: &Value) -> Result<()> {
        self.call(
            Method::PATCH,
            &format!("knowledgearticles({article_id})"),
            Some(patch),
        )?;
        Ok(())
    }

    fn link_category(&mut self, article_id: &str, category_id: &str) -> Result<()> {
        let reference = json!({ "@odata.id": format!("{}categories({category_id})", self.api_base) });
        self.call(
            Method::POST,
            &format!("knowledgearticles({article_id})/knowledgearticle_category/$ref"),
            Some(&reference),
        )?;
        Ok(())
    }

    fn create_translation(&mut self, article_id: &str, language_locale_id: &str) -> Result<String> {
        let payload = json!({
            "Source": {
                "@odata.type": "Microsoft.Dynamics.CRM.knowledgearticle",
                "knowledgearticleid": article_id,
            },
            "Language": {
                "@odata.type": "Microsoft.Dynamics.CRM.languagelocale",
                "languagelocaleid": language_locale_id,
            },
            "IsMajor": true,
        });
        let created = self.expect_body(
            Method::POST,
            "CreateKnowledgeArticleTranslation",
            Some(&payload),
        )?;
        string_field(&created, "knowledgearticleid")
    }

    fn create_web_resource(&mut self, resource: &WebResource) -> Result<String> {
        let payload = serde_json::to_value(resource).context("failed to encode web resource")?;
        self.call(Method::POST, "webresourceset", Some(&payload))?;
        Ok(format!("{}WebResources/{}", self.org_url, resource.name))
    }

    fn reset_session(&mut self) -> Result<()> {
        self.client = build_client(self.timeout, &self.user_agent)?;
        Ok(())
    }
}

fn build_client(timeout: Duration, user_agent: &str) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(user_agent.to_string())
        .build()
        .context("failed to build destination HTTP client")
}

fn category_record(item: &Value) -> Result<CategoryRecord> {
    Ok(CategoryRecord {
        category_id: string_field(item, "categoryid")?,
        title: optional_string(item, "title").unwrap_or_default(),
        parent_category_id: optional_string(item, "_parentcategoryid_value"),
        category_number: optional_string(item, "categorynumber"),
    })
}

fn string_field(item: &Value, key: &str) -> Result<String> {
    optional_string(item, key).ok_or_else(|| anyhow::anyhow!("response is missing `{key}`"))
}

fn optional_string(item: &Value, key: &str) -> Option<String> {
    item.get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

fn as_source_id(value: &Value) -> Option<SourceId> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|text| text.trim().parse().ok()))
}
