use std::collections::BTreeMap;
use std::sync::OnceLock;

use anyhow::Result;
use regex::Regex;
use serde::Serialize;

use crate::content::{LinkTarget, Markup};
use crate::destination::{DestinationApi, content_patch};
use crate::mapping::{IdentityMap, Locale, SourceId};

fn article_id_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"articles/(\d+)").ok())
        .as_ref()
}

/// Source article id embedded in a source knowledge-base URL.
pub fn source_article_id(url: &str) -> Option<SourceId> {
    article_id_pattern()?
        .captures(url)
        .and_then(|captures| captures.get(1))
        .and_then(|id| id.as_str().parse().ok())
}

pub fn portal_article_url(portal_url: &str, number: &str) -> String {
    let base = portal_url.trim_end_matches('/');
    format!("{base}/knowledgebase/article/{number}/")
}

/// Every discovered internal link whose target is migrated and numbered.
pub fn build_link_targets(map: &IdentityMap, portal_url: &str) -> BTreeMap<String, LinkTarget> {
    let mut targets = BTreeMap::new();
    for url in map.link_refs().values().flatten() {
        let Some(entry) = source_article_id(url).and_then(|id| map.resolve(id)) else {
            continue;
        };
        let Some(number) = entry.number(Locale::English) else {
            continue;
        };
        let target = LinkTarget {
            url: portal_article_url(portal_url, number),
            is_published: entry.lifecycle().is_published(),
        };
        tracing::debug!(
            "mapped {url} to {} ({})",
            target.url,
            if target.is_published { "published" } else { "draft" }
        );
        targets.insert(url.clone(), target);
    }
    targets
}

/// True when `url` would be rewritten by the current map.
pub fn is_resolvable(map: &IdentityMap, url: &str) -> bool {
    source_article_id(url)
        .and_then(|id| map.resolve(id))
        .is_some_and(|entry| entry.en_number.is_some())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkReport {
    pub targets: usize,
    pub articles_checked: usize,
    pub articles_updated: usize,
    pub links_rewritten: usize,
    pub failures: usize,
}

/// Rewrite internal links in every migrated article and translation.
///
/// Content is written back only when at least one anchor changed. Rewritten
/// hrefs no longer match a source URL, so rerunning after a later batch only
/// touches links whose targets became resolvable since.
pub fn rewrite_internal_links<D: DestinationApi + ?Sized>(
    destination: &mut D,
    map: &IdentityMap,
    portal_url: &str,
) -> LinkReport {
    let targets = build_link_targets(map, portal_url);
    let mut report = LinkReport {
        targets: targets.len(),
        ..LinkReport::default()
    };
    tracing::info!("found {} internal URLs to update", targets.len());
    if targets.is_empty() {
        return report;
    }

    for (source_id, entry) in map.articles() {
        for locale in entry.locales() {
            let Some(article_id) = entry.article_id(locale) else {
                continue;
            };
            report.articles_checked += 1;
            match rewrite_article(destination, article_id, &targets, locale) {
                Ok(0) => {}
                Ok(changed) => {
                    report.articles_updated += 1;
                    report.links_rewritten += changed;
                    tracing::info!(
                        "updated {changed} links in {} article {source_id}",
                        locale.code()
                    );
                }
                Err(error) => {
                    report.failures += 1;
                    tracing::error!(
                        "error updating links in {} article {source_id}: {error:#}",
                        locale.code()
                    );
                }
            }
        }
    }
    tracing::info!("updated internal links in {} articles", report.articles_updated);
    report
}

fn rewrite_article<D: DestinationApi + ?Sized>(
    destination: &mut D,
    article_id: &str,
    targets: &BTreeMap<String, LinkTarget>,
    locale: Locale,
) -> Result<usize> {
    let current = destination.get_article(article_id)?;
    let mut markup = Markup::parse(current.content.as_deref().unwrap_or_default());
    let changed = markup.rewrite_links(targets, locale);
    if changed > 0 {
        destination.update_article(article_id, &content_patch(&markup.render(), None))?;
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{build_link_targets, portal_article_url, rewrite_internal_links, source_article_id};
    use crate::destination::DestinationApi;
    use crate::mapping::{ArticleField, CreatedArticle, IdentityMap, Lifecycle, Locale};
    use crate::testing::MockDestination;

    const PORTAL: &str = "https://org-dev.powerappsportals.com/";
    const LINK_TO_A: &str = "https://helpdesk.example.com/support/solutions/articles/100-vpn-setup";

    fn migrate(
        destination: &mut MockDestination,
        map: &mut IdentityMap,
        source_id: i64,
        lifecycle: Lifecycle,
        html: &str,
        links: &[&str],
    ) -> String {
        let article_id = destination
            .create_article(&json!({ "title": format!("article {source_id}"), "content": html }))
            .expect("create");
        let links: Vec<String> = links.iter().map(ToString::to_string).collect();
        map.record_links(source_id, &links);
        map.record_created(
            source_id,
            CreatedArticle {
                article_id: article_id.clone(),
                title: format!("article {source_id}"),
                source_status: lifecycle.source_status().unwrap_or_default(),
                lifecycle,
                attachments: Vec::new(),
                internal_references: links,
            },
        );
        let number = destination.article(&article_id).number.clone().expect("number");
        map.record(source_id, ArticleField::Number(Locale::English, number))
            .expect("number");
        article_id
    }

    fn linking_html() -> String {
        format!(r#"<p>See <a href="{LINK_TO_A}" title="VPN">setup</a>.</p>"#)
    }

    #[test]
    fn source_ids_and_portal_urls() {
        assert_eq!(source_article_id(LINK_TO_A), Some(100));
        assert_eq!(source_article_id("https://helpdesk.example.com/support/home"), None);
        assert_eq!(
            portal_article_url(PORTAL, "KA-01001"),
            "https://org-dev.powerappsportals.com/knowledgebase/article/KA-01001/"
        );
    }

    #[test]
    fn link_to_published_article_is_rewritten() {
        let mut destination = MockDestination::default();
        let mut map = IdentityMap::new();
        let a = migrate(&mut destination, &mut map, 100, Lifecycle::PUBLISHED, "<p>A</p>", &[]);
        let b = migrate(
            &mut destination,
            &mut map,
            200,
            Lifecycle::PUBLISHED,
            &linking_html(),
            &[LINK_TO_A],
        );

        let report = rewrite_internal_links(&mut destination, &map, PORTAL);
        assert_eq!(report.articles_updated, 1);
        let number_a = destination.article(&a).number.clone().expect("number");
        let content = destination.article(&b).content.clone().expect("content");
        assert_eq!(
            content,
            format!(
                r#"<p>See <a href="{}" title="VPN">setup</a>.</p>"#,
                portal_article_url(PORTAL, &number_a)
            )
        );
    }

    #[test]
    fn link_to_draft_gains_notice_and_rerun_is_stable() {
        let mut destination = MockDestination::default();
        let mut map = IdentityMap::new();
        migrate(&mut destination, &mut map, 100, Lifecycle::DRAFT, "<p>A</p>", &[]);
        let b = migrate(
            &mut destination,
            &mut map,
            200,
            Lifecycle::PUBLISHED,
            &linking_html(),
            &[LINK_TO_A],
        );

        rewrite_internal_links(&mut destination, &map, PORTAL);
        let content = destination.article(&b).content.clone().expect("content");
        assert!(content.contains(r#"title="VPN (Note: This article is currently in draft status)""#));

        let patches = destination.patches.len();
        let again = rewrite_internal_links(&mut destination, &map, PORTAL);
        assert_eq!(again.articles_updated, 0);
        assert_eq!(destination.patches.len(), patches);
    }

    #[test]
    fn link_to_unmigrated_article_is_left_alone() {
        let mut destination = MockDestination::default();
        let mut map = IdentityMap::new();
        let b = migrate(
            &mut destination,
            &mut map,
            200,
            Lifecycle::PUBLISHED,
            &linking_html(),
            &[LINK_TO_A],
        );

        assert!(build_link_targets(&map, PORTAL).is_empty());
        let report = rewrite_internal_links(&mut destination, &map, PORTAL);
        assert_eq!(report.articles_updated, 0);
        assert_eq!(destination.article(&b).content.as_deref(), Some(linking_html().as_str()));
        assert!(destination.patches.is_empty());
        assert_eq!(map.summary(|url| super::is_resolvable(&map, url)).unresolved_links, 1);
    }

    #[test]
    fn french_translation_links_get_french_notice() {
        let mut destination = MockDestination::default();
        let mut map = IdentityMap::new();
        migrate(&mut destination, &mut map, 100, Lifecycle::DRAFT, "<p>A</p>", &[]);
        migrate(&mut destination, &mut map, 200, Lifecycle::PUBLISHED, "<p>B</p>", &[LINK_TO_A]);
        let french = destination
            .create_article(&json!({ "title": "B fr", "content": linking_html() }))
            .expect("create");
        map.record(
            200,
            ArticleField::Translation {
                article_id: french.clone(),
                title: "B fr".to_string(),
            },
        )
        .expect("translation");

        rewrite_internal_links(&mut destination, &map, PORTAL);
        let content = destination.article(&french).content.clone().expect("content");
        assert!(content.contains("Remarque: Cet article est actuellement"));
    }
}
