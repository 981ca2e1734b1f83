use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;

use crate::config::RunTimings;
use crate::content::{Markup, discover};
use crate::destination::{DestinationApi, WEB_RESOURCE_PNG, WebResource};
use crate::mapping::{Locale, SourceId};
use crate::retry::RetryPolicy;
use crate::source::SourceApi;

/// One relocated image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetRecord {
    pub name: String,
    pub source_url: String,
    pub destination_url: String,
    pub local_path: PathBuf,
}

/// Inputs shared by every relocation in a run.
#[derive(Debug, Clone, Copy)]
pub struct AssetScope<'a> {
    pub images_dir: &'a Path,
    pub run_timestamp: &'a str,
    pub link_host: &'a str,
    pub timings: &'a RunTimings,
}

#[derive(Debug, Clone)]
pub struct Relocation {
    pub content: Markup,
    pub assets: Vec<AssetRecord>,
    pub internal_links: Vec<String>,
    pub failed_images: Vec<String>,
}

impl Relocation {
    pub fn render(&self) -> String {
        self.content.render()
    }
}

/// `{source id}_{run timestamp}_{ordinal}`, with a locale marker for translations.
pub fn asset_name(source_id: SourceId, run_timestamp: &str, locale: Locale, index: usize) -> String {
    match locale {
        Locale::English => format!("{source_id}_{run_timestamp}_{index}"),
        other => format!("{source_id}_{run_timestamp}_{}_{index}", other.code()),
    }
}

/// Move every embedded image of one article body to the destination and collect
/// its internal links.
///
/// An image that still fails after the write retries is dropped from the
/// relocation and keeps pointing at its source URL.
pub fn relocate<S, D>(
    source: &mut S,
    destination: &mut D,
    scope: AssetScope<'_>,
    source_id: SourceId,
    locale: Locale,
    title: &str,
    html: &str,
) -> Relocation
where
    S: SourceApi + ?Sized,
    D: DestinationApi + ?Sized,
{
    let discovered = discover(html, scope.link_host);
    let mut content = Markup::parse(html);
    let policy = RetryPolicy::long_write(scope.timings);
    let mut assets = Vec::new();
    let mut failed_images = Vec::new();
    let mut relocated = BTreeMap::new();

    for (index, source_url) in discovered.image_sources.iter().enumerate() {
        let name = asset_name(source_id, scope.run_timestamp, locale, index);
        let local_path = scope.images_dir.join(format!("{name}.png"));
        let label = format!("image {name} for article {source_id}");
        let uploaded = policy.run(&label, destination, |destination| {
            upload_image(source, destination, source_url, &name, &local_path, title)
        });
        match uploaded {
            Ok(destination_url) => {
                tracing::info!("relocated {source_url} to {destination_url}");
                relocated.insert(source_url.clone(), destination_url.clone());
                assets.push(AssetRecord {
                    name,
                    source_url: source_url.clone(),
                    destination_url,
                    local_path,
                });
            }
            Err(error) => {
                tracing::error!("abandoning {label} ({source_url}): {error:#}");
                failed_images.push(source_url.clone());
            }
        }
    }

    let rewritten = content.rewrite_image_sources(&relocated);
    tracing::debug!("article {source_id}: rewrote {rewritten} image references");
    Relocation {
        content,
        assets,
        internal_links: discovered.internal_links,
        failed_images,
    }
}

fn upload_image<S, D>(
    source: &mut S,
    destination: &mut D,
    source_url: &str,
    name: &str,
    local_path: &Path,
    title: &str,
) -> Result<String>
where
    S: SourceApi + ?Sized,
    D: DestinationApi + ?Sized,
{
    let bytes = source.download(source_url)?;
    if let Some(parent) = local_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(local_path, &bytes)
        .with_context(|| format!("failed to stage {}", local_path.display()))?;
    let resource = WebResource {
        name: name.to_string(),
        display_name: name.to_string(),
        description: format!("Image for {title}"),
        content: STANDARD.encode(&bytes),
        resource_type: WEB_RESOURCE_PNG,
    };
    destination.create_web_resource(&resource)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::{AssetScope, asset_name, relocate};
    use crate::config::RunTimings;
    use crate::mapping::Locale;
    use crate::testing::{MockDestination, MockSource, ORG_URL};

    const HTML: &str = concat!(
        r#"<p>See <a href="https://helpdesk.example.com/support/solutions/articles/7-vpn">VPN</a>"#,
        r#" and <a href="https://other.example.org/x">elsewhere</a>.</p>"#,
        r#"<img src="https://cdn.example.com/a.png">"#,
        r#"<img src="https://cdn.example.com/b.png">"#,
        r#"<img src="https://cdn.example.com/c.png"></p>"#,
    );

    fn source_with_images() -> MockSource {
        let mut source = MockSource::default();
        for name in ["a", "b", "c"] {
            source.images.insert(
                format!("https://cdn.example.com/{name}.png"),
                name.as_bytes().to_vec(),
            );
        }
        source
    }

    #[test]
    fn names_are_unique_per_locale_and_ordinal() {
        assert_eq!(asset_name(9, "20250101000000", Locale::English, 2), "9_20250101000000_2");
        assert_eq!(
            asset_name(9, "20250101000000", Locale::French, 2),
            "9_20250101000000_fr_2"
        );
    }

    #[test]
    fn failed_second_image_keeps_its_source_url() {
        let temp = tempdir().expect("tempdir");
        let timings = RunTimings::immediate();
        let scope = AssetScope {
            images_dir: temp.path(),
            run_timestamp: "20250101000000",
            link_host: "helpdesk.example.com",
            timings: &timings,
        };
        let mut source = source_with_images();
        let mut destination = MockDestination {
            failing_resources: vec!["_1".to_string()],
            ..MockDestination::default()
        };

        let relocation = relocate(
            &mut source,
            &mut destination,
            scope,
            9,
            Locale::English,
            "Hello",
            HTML,
        );
        let html = relocation.render();

        assert_eq!(relocation.assets.len(), 2);
        assert_eq!(relocation.failed_images, vec!["https://cdn.example.com/b.png"]);
        assert!(html.contains(&format!(r#"src="{ORG_URL}WebResources/9_20250101000000_0""#)));
        assert!(html.contains(r#"src="https://cdn.example.com/b.png""#));
        assert!(html.contains(&format!(r#"src="{ORG_URL}WebResources/9_20250101000000_2""#)));
        assert!(!html.contains("cdn.example.com/a.png"));
        assert!(temp.path().join("9_20250101000000_0.png").exists());
        assert_eq!(destination.web_resources[0].content, "YQ==");
        assert_eq!(destination.web_resources[0].description, "Image for Hello");
    }

    #[test]
    fn internal_links_are_collected_even_without_images() {
        let temp = tempdir().expect("tempdir");
        let timings = RunTimings::immediate();
        let scope = AssetScope {
            images_dir: temp.path(),
            run_timestamp: "20250101000000",
            link_host: "helpdesk.example.com",
            timings: &timings,
        };
        let mut source = MockSource::default();
        let mut destination = MockDestination::default();
        let html = r#"<p><a href="https://helpdesk.example.com/support/solutions/articles/7-vpn">VPN</a></p>"#;
        let relocation = relocate(
            &mut source,
            &mut destination,
            scope,
            3,
            Locale::English,
            "Links",
            html,
        );
        assert_eq!(
            relocation.internal_links,
            vec!["https://helpdesk.example.com/support/solutions/articles/7-vpn"]
        );
        assert_eq!(relocation.render(), html);
        assert!(destination.web_resources.is_empty());
    }

    #[test]
    fn unreachable_image_is_abandoned_without_retry_storm() {
        let temp = tempdir().expect("tempdir");
        let timings = RunTimings::immediate();
        let scope = AssetScope {
            images_dir: temp.path(),
            run_timestamp: "20250101000000",
            link_host: "helpdesk.example.com",
            timings: &timings,
        };
        let mut source = MockSource::default();
        let mut destination = MockDestination::default();
        let relocation = relocate(
            &mut source,
            &mut destination,
            scope,
            4,
            Locale::French,
            "Gone",
            r#"<img src="https://cdn.example.com/missing.png">"#,
        );
        assert_eq!(relocation.failed_images.len(), 1);
        assert_eq!(source.requests, 1);
        assert_eq!(destination.reauths, 0);
    }
}
