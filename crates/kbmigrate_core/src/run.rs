use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::articles::{ArticleOutcome, MigrationContext, OutcomeStatus, QueuedArticle, migrate_article, poll_number};
use crate::assets::AssetScope;
use crate::config::RunTimings;
use crate::destination::DestinationApi;
use crate::hierarchy::{CategoryNode, ImportReport, collect_folders, import_categories};
use crate::links::{LinkReport, is_resolvable, rewrite_internal_links};
use crate::mapping::{ArticleField, IdentityMap, MappingSummary, SourceId};
use crate::persist::{StateFiles, utc_timestamp};
use crate::source::{SourceApi, SourceCategory};

/// Everything a migration run needs besides the two remote systems.
#[derive(Debug, Clone, Copy)]
pub struct RunPlan<'a> {
    pub files: &'a StateFiles,
    pub assets: AssetScope<'a>,
    pub portal_url: &'a str,
    pub french_locale_name: &'a str,
    pub chunk_size: usize,
    pub import_categories: bool,
}

#[derive(Debug, Clone)]
pub struct CategoryTree {
    pub category: SourceCategory,
    pub folders: Vec<CategoryNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub missing: usize,
    pub updated: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub index: usize,
    pub articles: usize,
    pub migrated: usize,
    pub failed: usize,
    pub backfill: BackfillReport,
    pub links: LinkReport,
    pub ledger_path: PathBuf,
    pub outcomes: Vec<ArticleOutcome>,
}

/// A source listing that still failed after retries. The run continues without it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadFailure {
    pub entity: &'static str,
    pub source_id: SourceId,
    pub error: String,
}

impl ReadFailure {
    fn new(entity: &'static str, source_id: SourceId, error: &anyhow::Error) -> Self {
        Self {
            entity,
            source_id,
            error: format!("{error:#}"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Hierarchy {
    pub report: ImportReport,
    pub trees: Vec<CategoryTree>,
    /// Categories whose folders could not be listed.
    pub unreadable: Vec<ReadFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: String,
    pub categories: ImportReport,
    pub articles_total: usize,
    pub skipped_existing: usize,
    pub skipped_folders: Vec<SourceId>,
    pub read_failures: Vec<ReadFailure>,
    pub batches: Vec<BatchReport>,
    pub summary: MappingSummary,
}

#[derive(Debug, Clone, Default)]
pub struct Download {
    pub articles: Vec<QueuedArticle>,
    /// Folders without a destination category; their articles are not queued.
    pub skipped_folders: Vec<SourceId>,
    pub unreadable_folders: Vec<ReadFailure>,
}

/// Read the source tree and create whatever the destination is missing.
///
/// Destination categories are loaded first and seed the identity map, so only
/// nodes without a counterpart are created. With `create` unset nothing is
/// written and the existing destination categories are used as-is.
pub fn import_hierarchy<S, D>(
    source: &mut S,
    destination: &mut D,
    files: &StateFiles,
    map: &mut IdentityMap,
    create: bool,
) -> Result<Hierarchy>
where
    S: SourceApi + ?Sized,
    D: DestinationApi + ?Sized,
{
    let existing = destination
        .list_categories()
        .context("failed to list destination categories")?;
    let snapshot = files.save_category_snapshot(&existing)?;
    tracing::info!(
        "{} destination categories saved to {}",
        existing.len(),
        snapshot.display()
    );
    map.replace_categories(existing);

    let categories = source
        .list_categories()
        .context("failed to list source categories")?;
    let mut hierarchy = Hierarchy::default();
    for category in categories {
        match collect_folders(source, &category) {
            Ok(folders) => hierarchy.trees.push(CategoryTree { category, folders }),
            Err(error) => {
                tracing::warn!(
                    "skipping category {} ({}): {error:#}",
                    category.id,
                    category.name
                );
                hierarchy
                    .unreadable
                    .push(ReadFailure::new("category", category.id, &error));
            }
        }
    }

    if !create {
        tracing::info!("no categories were added");
        return Ok(hierarchy);
    }
    let top_level: Vec<CategoryNode> = hierarchy
        .trees
        .iter()
        .map(|tree| CategoryNode::from_category(&tree.category))
        .collect();
    hierarchy
        .report
        .absorb(import_categories(destination, &top_level, map));
    for tree in &hierarchy.trees {
        hierarchy
            .report
            .absorb(import_categories(destination, &tree.folders, map));
    }
    Ok(hierarchy)
}

/// List each folder's articles and annotate them with their destination category.
pub fn download_articles<S: SourceApi + ?Sized>(
    source: &mut S,
    folders: &[CategoryNode],
    map: &IdentityMap,
) -> Download {
    let mut download = Download::default();
    for folder in folders {
        let Some(category) = map.category(folder.source_id) else {
            tracing::error!(
                "folder {} ({}) has no destination category; skipping its articles",
                folder.source_id,
                folder.name
            );
            download.skipped_folders.push(folder.source_id);
            continue;
        };
        let articles = match source.list_folder_articles(folder.source_id) {
            Ok(articles) => articles,
            Err(error) => {
                tracing::warn!(
                    "failed to list articles of folder {} ({}): {error:#}",
                    folder.source_id,
                    folder.name
                );
                download
                    .unreadable_folders
                    .push(ReadFailure::new("folder", folder.source_id, &error));
                continue;
            }
        };
        for mut article in articles {
            article.folder_id.get_or_insert(folder.source_id);
            download.articles.push(QueuedArticle {
                article,
                category_id: category.category_id.clone(),
                is_internal: folder.is_internal(),
            });
        }
    }
    tracing::info!("downloaded {} articles", download.articles.len());
    download
}

/// Articles still lacking a destination counterpart.
pub fn pending_articles(articles: Vec<QueuedArticle>, map: &IdentityMap) -> (Vec<QueuedArticle>, usize) {
    let before = articles.len();
    let pending: Vec<QueuedArticle> = articles
        .into_iter()
        .filter(|queued| !map.contains(queued.article.id))
        .collect();
    let skipped = before - pending.len();
    if skipped > 0 {
        tracing::info!("skipping {skipped} articles already migrated");
    }
    (pending, skipped)
}

/// Retry number retrieval for every destination article still missing one.
pub fn backfill_numbers<D: DestinationApi + ?Sized>(
    destination: &mut D,
    timings: &RunTimings,
    map: &mut IdentityMap,
) -> Result<BackfillReport> {
    let missing = map.missing_numbers();
    let mut report = BackfillReport {
        missing: missing.len(),
        updated: 0,
    };
    tracing::info!("checking {} missing article numbers", missing.len());
    for (source_id, locale, article_id) in missing {
        if let Some(number) = poll_number(destination, timings, &article_id) {
            tracing::info!(
                "updated article number for {} article {source_id}: {number}",
                locale.code()
            );
            map.record(source_id, ArticleField::Number(locale, number))?;
            report.updated += 1;
        }
    }
    tracing::info!("updated {} article numbers", report.updated);
    Ok(report)
}

/// Migrate `articles` in fixed-size batches, reconciling and persisting after each.
pub fn run_batches<S, D>(
    source: &mut S,
    destination: &mut D,
    plan: RunPlan<'_>,
    context: MigrationContext<'_>,
    articles: &[QueuedArticle],
    map: &mut IdentityMap,
    first_index: usize,
) -> Result<Vec<BatchReport>>
where
    S: SourceApi + ?Sized,
    D: DestinationApi + ?Sized,
{
    let timings = plan.assets.timings;
    let mut reports = Vec::new();
    for (offset, batch) in articles.chunks(plan.chunk_size.max(1)).enumerate() {
        let index = first_index + offset;
        tracing::info!("=== processing batch {index} ({} articles) ===", batch.len());
        if let Err(error) = destination.reauthenticate() {
            tracing::warn!("failed to refresh credentials before batch {index}: {error:#}");
        }

        let outcomes: Vec<ArticleOutcome> = batch
            .iter()
            .map(|queued| migrate_article(source, destination, context, queued, map))
            .collect();

        if let Err(error) = destination.reset_session() {
            tracing::warn!("failed to reset destination session after batch {index}: {error:#}");
        }
        let backfill = backfill_numbers(destination, timings, map)?;
        let links = rewrite_internal_links(destination, map, plan.portal_url);
        let ledger_path = plan
            .files
            .save_ledger(map, Some(&format!("batch{index:03}")))?;

        let migrated = count(&outcomes, OutcomeStatus::Migrated);
        let failed = count(&outcomes, OutcomeStatus::Failed);
        tracing::info!("batch {index}: {migrated} migrated, {failed} failed");
        reports.push(BatchReport {
            index,
            articles: batch.len(),
            migrated,
            failed,
            backfill,
            links,
            ledger_path,
            outcomes,
        });

        if let Err(error) = destination.reauthenticate() {
            tracing::warn!("failed to refresh credentials after batch {index}: {error:#}");
        }
    }
    Ok(reports)
}

/// Full migration: hierarchy, then every category's articles in batches.
pub fn run_migration<S, D>(
    source: &mut S,
    destination: &mut D,
    plan: RunPlan<'_>,
    map: &mut IdentityMap,
) -> Result<RunReport>
where
    S: SourceApi + ?Sized,
    D: DestinationApi + ?Sized,
{
    let started_at = utc_timestamp();
    let hierarchy = import_hierarchy(source, destination, plan.files, map, plan.import_categories)?;

    let french_locale_id = match destination.list_languages() {
        Ok(languages) => languages.get(plan.french_locale_name).cloned(),
        Err(error) => {
            tracing::warn!("failed to list destination languages: {error:#}");
            None
        }
    };
    if french_locale_id.is_none() {
        tracing::warn!(
            "language `{}` not found at destination; French variants will be skipped",
            plan.french_locale_name
        );
    }
    let context = MigrationContext {
        assets: plan.assets,
        french_locale_id: french_locale_id.as_deref(),
    };

    let mut report = RunReport {
        started_at,
        categories: hierarchy.report,
        articles_total: 0,
        skipped_existing: 0,
        skipped_folders: Vec::new(),
        read_failures: hierarchy.unreadable,
        batches: Vec::new(),
        summary: MappingSummary::default(),
    };
    for tree in &hierarchy.trees {
        tracing::info!(
            "category {} ({}): {} folders",
            tree.category.id,
            tree.category.name,
            tree.folders.len()
        );
        plan.files.save_folders_csv(tree.category.id, &tree.folders)?;
        let download = download_articles(source, &tree.folders, map);
        plan.files
            .save_source_articles(tree.category.id, &download.articles)?;
        report.articles_total += download.articles.len();
        report.skipped_folders.extend(download.skipped_folders);
        report.read_failures.extend(download.unreadable_folders);

        let (pending, skipped) = pending_articles(download.articles, map);
        report.skipped_existing += skipped;
        let first_index = report.batches.len() + 1;
        let batches = run_batches(source, destination, plan, context, &pending, map, first_index)?;
        report.batches.extend(batches);
        plan.files.save_link_refs(map)?;
    }
    report.summary = summarize(map);
    Ok(report)
}

/// Backfill numbers on a resumed ledger and save it as the `_final` snapshot.
pub fn final_reconciliation<D: DestinationApi + ?Sized>(
    destination: &mut D,
    timings: &RunTimings,
    files: &StateFiles,
    map: &mut IdentityMap,
) -> Result<(BackfillReport, MappingSummary, PathBuf)> {
    let backfill = backfill_numbers(destination, timings, map)?;
    let path = files.save_ledger(map, Some("final"))?;
    let summary = summarize(map);
    if summary.missing_en_numbers > 0 || summary.missing_fr_numbers > 0 {
        tracing::warn!(
            "still missing {} English and {} French article numbers",
            summary.missing_en_numbers,
            summary.missing_fr_numbers
        );
    } else {
        tracing::info!("all articles have article numbers");
    }
    Ok((backfill, summary, path))
}

pub fn summarize(map: &IdentityMap) -> MappingSummary {
    map.summary(|url| is_resolvable(map, url))
}

fn count(outcomes: &[ArticleOutcome], status: OutcomeStatus) -> usize {
    outcomes.iter().filter(|outcome| outcome.status == status).count()
}
