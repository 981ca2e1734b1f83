use std::thread::sleep;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use serde_json::{Value, json};

use crate::assets::{AssetScope, Relocation, relocate};
use crate::config::RunTimings;
use crate::destination::{DestinationApi, category_lookup_patch, content_patch, lifecycle_patch};
use crate::error::RemoteError;
use crate::mapping::{ArticleField, CreatedArticle, IdentityMap, Lifecycle, Locale, SourceId};
use crate::retry::RetryPolicy;
use crate::source::{SourceApi, SourceArticle};

/// A source article annotated with where it lands at the destination.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedArticle {
    #[serde(flatten)]
    pub article: SourceArticle,
    #[serde(rename = "dynamics_category_id")]
    pub category_id: String,
    #[serde(rename = "dynamics_isinternal")]
    pub is_internal: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct MigrationContext<'a> {
    pub assets: AssetScope<'a>,
    /// Destination language locale id for French translations, when one exists.
    pub french_locale_id: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Migrated,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocaleOutcome {
    pub article_id: String,
    pub number: Option<String>,
    pub categorized: bool,
    pub published: bool,
    pub images_relocated: usize,
    pub images_failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArticleOutcome {
    pub source_id: SourceId,
    pub title: String,
    pub status: OutcomeStatus,
    pub english: Option<LocaleOutcome>,
    pub french: Option<LocaleOutcome>,
    pub error: Option<String>,
}

impl ArticleOutcome {
    fn new(article: &SourceArticle, status: OutcomeStatus) -> Self {
        Self {
            source_id: article.id,
            title: article.title.clone(),
            status,
            english: None,
            french: None,
            error: None,
        }
    }
}

/// Migrate one article and, when it exists, its French variant.
///
/// Never fails: any error is logged and reported in the outcome so the caller
/// can move on to the next article.
pub fn migrate_article<S, D>(
    source: &mut S,
    destination: &mut D,
    context: MigrationContext<'_>,
    queued: &QueuedArticle,
    map: &mut IdentityMap,
) -> ArticleOutcome
where
    S: SourceApi + ?Sized,
    D: DestinationApi + ?Sized,
{
    let article = &queued.article;
    let mut outcome = ArticleOutcome::new(article, OutcomeStatus::Migrated);
    let (english_id, lifecycle) = match migrate_english(source, destination, context, queued, map) {
        Ok((english, lifecycle)) => {
            let english_id = english.article_id.clone();
            outcome.english = Some(english);
            (english_id, lifecycle)
        }
        Err(error) => {
            tracing::error!("failed to migrate article {} ({}): {error:#}", article.id, article.title);
            outcome.status = OutcomeStatus::Failed;
            outcome.error = Some(format!("{error:#}"));
            return outcome;
        }
    };

    match migrate_french(source, destination, context, queued, &english_id, lifecycle, map) {
        Ok(french) => outcome.french = french,
        Err(error) => {
            tracing::error!("failed to migrate French variant of {}: {error:#}", article.id);
            outcome.error = Some(format!("French variant: {error:#}"));
        }
    }
    outcome
}

fn migrate_english<S, D>(
    source: &mut S,
    destination: &mut D,
    context: MigrationContext<'_>,
    queued: &QueuedArticle,
    map: &mut IdentityMap,
) -> Result<(LocaleOutcome, Lifecycle)>
where
    S: SourceApi + ?Sized,
    D: DestinationApi + ?Sized,
{
    let article = &queued.article;
    let timings = context.assets.timings;
    let lifecycle = Lifecycle::for_source_status(article.status)?;
    if !lifecycle.is_published() {
        tracing::info!("article {} is a draft and stays a draft", article.id);
    }

    let relocation = relocate(
        source,
        destination,
        context.assets,
        article.id,
        Locale::English,
        &article.title,
        &article.description,
    );
    let payload = creation_payload(queued, &relocation);
    tracing::info!("migrating article {}", article.id);
    let article_id = RetryPolicy::long_write(timings).run(
        &format!("create article {}", article.id),
        destination,
        |destination| destination.create_article(&payload),
    )?;
    map.record_created(
        article.id,
        CreatedArticle {
            article_id: article_id.clone(),
            title: article.title.clone(),
            source_status: article.status,
            lifecycle,
            attachments: article.attachments.clone(),
            internal_references: relocation.internal_links.clone(),
        },
    );
    map.record_links(article.id, &relocation.internal_links);
    tracing::info!("created article {} as {article_id}", article.id);

    let outcome = finish_locale(
        destination,
        timings,
        article.id,
        Locale::English,
        &article_id,
        &queued.category_id,
        lifecycle,
        &relocation,
        map,
    )?;
    Ok((outcome, lifecycle))
}

fn migrate_french<S, D>(
    source: &mut S,
    destination: &mut D,
    context: MigrationContext<'_>,
    queued: &QueuedArticle,
    english_id: &str,
    lifecycle: Lifecycle,
    map: &mut IdentityMap,
) -> Result<Option<LocaleOutcome>>
where
    S: SourceApi + ?Sized,
    D: DestinationApi + ?Sized,
{
    let source_id = queued.article.id;
    let Some(translation) = source.get_translation(source_id, Locale::French)? else {
        tracing::debug!("no French variant for article {source_id}");
        return Ok(None);
    };
    let Some(locale_id) = context.french_locale_id else {
        tracing::warn!("article {source_id} has a French variant but no French locale is configured");
        return Ok(None);
    };
    tracing::info!("French variant found for article {source_id}");
    let timings = context.assets.timings;

    let relocation = relocate(
        source,
        destination,
        context.assets,
        source_id,
        Locale::French,
        &translation.title,
        &translation.description,
    );
    let translated_id = RetryPolicy::long_write(timings).run(
        &format!("create French translation of {source_id}"),
        destination,
        |destination| destination.create_translation(english_id, locale_id),
    )?;
    map.record(
        source_id,
        ArticleField::Translation {
            article_id: translated_id.clone(),
            title: translation.title.clone(),
        },
    )?;
    map.record_links(source_id, &relocation.internal_links);

    let patch = content_patch(&relocation.render(), Some(&translation.title));
    RetryPolicy::long_write(timings).run(
        &format!("update French content of {source_id}"),
        destination,
        |destination| destination.update_article(&translated_id, &patch),
    )?;

    let outcome = finish_locale(
        destination,
        timings,
        source_id,
        Locale::French,
        &translated_id,
        &queued.category_id,
        lifecycle,
        &relocation,
        map,
    )?;
    Ok(Some(outcome))
}

/// Number, categorize and publish one created destination article.
#[allow(clippy::too_many_arguments)]
fn finish_locale<D: DestinationApi + ?Sized>(
    destination: &mut D,
    timings: &RunTimings,
    source_id: SourceId,
    locale: Locale,
    article_id: &str,
    category_id: &str,
    lifecycle: Lifecycle,
    relocation: &Relocation,
    map: &mut IdentityMap,
) -> Result<LocaleOutcome> {
    settle(timings.creation_settle);
    let number = poll_number(destination, timings, article_id);
    match &number {
        Some(number) => map.record(source_id, ArticleField::Number(locale, number.clone()))?,
        None => tracing::warn!(
            "no article number yet for {} article {source_id}; left for backfill",
            locale.code()
        ),
    }

    settle(timings.category_settle);
    let categorized = match assign_category(destination, timings, article_id, category_id) {
        Ok(()) => {
            map.record(source_id, ArticleField::Categorized(locale))?;
            true
        }
        Err(error) => {
            tracing::warn!(
                "failed to categorize {} article {source_id} after all retries: {error:#}",
                locale.code()
            );
            false
        }
    };

    let published = match set_lifecycle(destination, timings, article_id, lifecycle) {
        Ok(()) => {
            map.record(source_id, ArticleField::Published(locale))?;
            true
        }
        Err(error) => {
            tracing::error!(
                "failed to set status of {} article {source_id}: {error:#}",
                locale.code()
            );
            false
        }
    };

    Ok(LocaleOutcome {
        article_id: article_id.to_string(),
        number,
        categorized,
        published,
        images_relocated: relocation.assets.len(),
        images_failed: relocation.failed_images.len(),
    })
}

pub fn creation_payload(queued: &QueuedArticle, relocation: &Relocation) -> Value {
    let article = &queued.article;
    let mut payload = json!({
        "title": article.title,
        "revops_freshdeskarticleid": article.id,
        "content": relocation.render(),
        "isinternal": queued.is_internal,
    });
    if let Some(created_at) = &article.created_at {
        payload["publishon"] = Value::String(created_at.clone());
    }
    payload
}

/// Wait for the destination to generate the public number. `None` once polling is exhausted.
pub fn poll_number<D: DestinationApi + ?Sized>(
    destination: &mut D,
    timings: &RunTimings,
    article_id: &str,
) -> Option<String> {
    let polled = RetryPolicy::polling(timings).run(
        &format!("article number of {article_id}"),
        destination,
        |destination| {
            destination
                .get_article(article_id)?
                .number
                .ok_or_else(|| RemoteError::NotYetAvailable(format!("number of {article_id}")).into())
        },
    );
    match polled {
        Ok(number) => {
            tracing::info!("article {article_id} has number {number}");
            Some(number)
        }
        Err(error) => {
            tracing::warn!("could not retrieve number of {article_id}: {error:#}");
            None
        }
    }
}

/// Both category writes: the lookup field and the relationship link.
pub fn assign_category<D: DestinationApi + ?Sized>(
    destination: &mut D,
    timings: &RunTimings,
    article_id: &str,
    category_id: &str,
) -> Result<()> {
    let patch = category_lookup_patch(category_id);
    RetryPolicy::short_write(timings).run(
        &format!("categorize {article_id}"),
        destination,
        |destination| {
            destination.update_article(article_id, &patch)?;
            destination.link_category(article_id, category_id)
        },
    )
}

pub fn set_lifecycle<D: DestinationApi + ?Sized>(
    destination: &mut D,
    timings: &RunTimings,
    article_id: &str,
    lifecycle: Lifecycle,
) -> Result<()> {
    let patch = lifecycle_patch(lifecycle);
    RetryPolicy::short_write(timings).run(
        &format!("set status of {article_id}"),
        destination,
        |destination| destination.update_article(article_id, &patch),
    )
}

fn settle(delay: Duration) {
    if !delay.is_zero() {
        sleep(delay);
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::{MigrationContext, OutcomeStatus, QueuedArticle, migrate_article};
    use crate::assets::AssetScope;
    use crate::config::RunTimings;
    use crate::mapping::{IdentityMap, Lifecycle, Locale, SOURCE_STATUS_DRAFT, SOURCE_STATUS_PUBLISHED};
    use crate::source::SourceArticle;
    use crate::testing::{MockDestination, MockSource, article};

    fn queued(source: SourceArticle) -> QueuedArticle {
        QueuedArticle {
            article: source,
            category_id: "cat-9".to_string(),
            is_internal: false,
        }
    }

    fn run_one(
        source: &mut MockSource,
        destination: &mut MockDestination,
        item: &QueuedArticle,
        map: &mut IdentityMap,
    ) -> super::ArticleOutcome {
        let temp = tempdir().expect("tempdir");
        let timings = RunTimings::immediate();
        let context = MigrationContext {
            assets: AssetScope {
                images_dir: temp.path(),
                run_timestamp: "20250101000000",
                link_host: "helpdesk.example.com",
                timings: &timings,
            },
            french_locale_id: Some("lang-fr"),
        };
        migrate_article(source, destination, context, item, map)
    }

    #[test]
    fn published_article_walks_every_state() {
        let mut source = MockSource::default();
        let mut destination = MockDestination::with_french();
        destination.number_delay = 2;
        let mut map = IdentityMap::new();
        let item = queued(article(5, SOURCE_STATUS_PUBLISHED, "<p>Hello</p>"));

        let outcome = run_one(&mut source, &mut destination, &item, &mut map);
        assert_eq!(outcome.status, OutcomeStatus::Migrated);
        let english = outcome.english.expect("english");
        assert!(english.categorized && english.published);
        assert!(outcome.french.is_none());

        let created = destination.article(&english.article_id);
        assert!(created.payload.get("statecode").is_none());
        assert_eq!(created.payload["revops_freshdeskarticleid"], 5);
        assert_eq!(created.payload["publishon"], "2024-01-01T00:00:00Z");
        assert_eq!(created.statecode, Some(3));
        assert_eq!(created.statuscode, Some(7));
        assert_eq!(created.category.as_deref(), Some("/categories(cat-9)"));
        assert_eq!(
            destination.category_links,
            vec![(english.article_id.clone(), "cat-9".to_string())]
        );

        let entry = map.resolve(5).expect("entry");
        assert_eq!(entry.en_article_id, english.article_id);
        assert_eq!(entry.en_number, english.number);
        assert!(entry.en_number.is_some());
        assert!(entry.en_categorized && entry.en_published);
        assert_eq!(entry.lifecycle(), Lifecycle::PUBLISHED);
    }

    #[test]
    fn missing_number_is_recorded_as_absent() {
        let mut source = MockSource::default();
        let mut destination = MockDestination::default();
        destination.never_numbered.insert("ka-0001".to_string());
        let mut map = IdentityMap::new();
        let item = queued(article(6, SOURCE_STATUS_DRAFT, "<p>Draft</p>"));

        let outcome = run_one(&mut source, &mut destination, &item, &mut map);
        assert_eq!(outcome.status, OutcomeStatus::Migrated);
        assert_eq!(destination.article("ka-0001").reads, 5);
        let entry = map.resolve(6).expect("entry");
        assert_eq!(entry.en_number, None);
        assert!(entry.en_published);
        assert_eq!(destination.article("ka-0001").statecode, Some(0));
        assert_eq!(map.missing_numbers().len(), 1);
    }

    #[test]
    fn category_failure_does_not_abort_migration() {
        let mut source = MockSource::default();
        let mut destination = MockDestination {
            fail_category_links: true,
            ..MockDestination::default()
        };
        let mut map = IdentityMap::new();
        let item = queued(article(7, SOURCE_STATUS_PUBLISHED, "<p>x</p>"));

        let outcome = run_one(&mut source, &mut destination, &item, &mut map);
        let english = outcome.english.expect("english");
        assert!(!english.categorized);
        assert!(english.published);
        assert_eq!(destination.reauths, 1);
        assert!(!map.resolve(7).expect("entry").en_categorized);
    }

    #[test]
    fn french_variant_mirrors_the_english_flow() {
        let mut source = MockSource::default();
        let mut translation = article(8, SOURCE_STATUS_PUBLISHED, "<p>Bonjour</p>");
        translation.title = "Bonjour".to_string();
        source.translations.insert(8, translation);
        let mut destination = MockDestination::with_french();
        let mut map = IdentityMap::new();
        let item = queued(article(8, SOURCE_STATUS_PUBLISHED, "<p>Hello</p>"));

        let outcome = run_one(&mut source, &mut destination, &item, &mut map);
        let english = outcome.english.expect("english");
        let french = outcome.french.expect("french");
        let translated = destination.article(&french.article_id);
        assert_eq!(
            translated.translation_of,
            Some((english.article_id.clone(), "lang-fr".to_string()))
        );
        assert_eq!(translated.title.as_deref(), Some("Bonjour"));
        assert_eq!(translated.content.as_deref(), Some("<p>Bonjour</p>"));
        assert_eq!(translated.statecode, Some(3));

        let entry = map.resolve(8).expect("entry");
        assert_eq!(entry.fr_article_id.as_deref(), Some(french.article_id.as_str()));
        assert_eq!(entry.fr_title.as_deref(), Some("Bonjour"));
        assert!(entry.number(Locale::French).is_some());
        assert!(entry.fr_categorized && entry.fr_published);
    }

    #[test]
    fn creation_failure_is_caught_and_reported() {
        let mut source = MockSource::default();
        let mut destination = MockDestination::default();
        destination.failing_titles.insert("article 9".to_string());
        let mut map = IdentityMap::new();
        let item = queued(article(
            9,
            SOURCE_STATUS_PUBLISHED,
            r#"<p><a href="https://helpdesk.example.com/support/solutions/articles/3-vpn">x</a></p>"#,
        ));

        let outcome = run_one(&mut source, &mut destination, &item, &mut map);
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert!(outcome.error.is_some());
        assert!(!map.contains(9));
        assert!(map.link_refs().is_empty());
        let summary = map.summary(|_| false);
        assert_eq!((summary.internal_links, summary.unresolved_links), (0, 0));
    }

    #[test]
    fn unsupported_status_is_rejected_before_creation() {
        let mut source = MockSource::default();
        let mut destination = MockDestination::default();
        let mut map = IdentityMap::new();
        let item = queued(article(10, 4, "<p>x</p>"));

        let outcome = run_one(&mut source, &mut destination, &item, &mut map);
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert!(destination.articles.is_empty());
    }
}
