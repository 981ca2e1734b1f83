use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use kbmigrate_core::assets::AssetScope;
use kbmigrate_core::config::{Environment, MigrationConfig, RunTimings, load_config};
use kbmigrate_core::destination::DataverseClient;
use kbmigrate_core::links::rewrite_internal_links;
use kbmigrate_core::logging::init_logging;
use kbmigrate_core::mapping::{IdentityMap, MappingSummary};
use kbmigrate_core::persist::{StateFiles, utc_timestamp};
use kbmigrate_core::run::{RunPlan, final_reconciliation, import_hierarchy, run_migration, summarize};
use kbmigrate_core::runtime::{
    PathOverrides, ResolutionContext, ResolvedPaths, normalize_for_display, resolve_paths,
};
use kbmigrate_core::session::{OAuthTokenProvider, Session};
use kbmigrate_core::source::{FreshdeskClient, SourceApi};
use tracing_appender::non_blocking::WorkerGuard;

#[derive(Debug, Parser)]
#[command(
    name = "kbmigrate",
    version,
    about = "Migrate a Freshdesk knowledge base into Dynamics 365 knowledge articles"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Import categories and migrate every article in batches")]
    Run(RunArgs),
    #[command(about = "Import the category and folder hierarchy only")]
    Categories(CategoriesArgs),
    #[command(
        name = "backfill-numbers",
        about = "Fetch missing article numbers and save a final ledger"
    )]
    BackfillNumbers(EnvArgs),
    #[command(about = "Rewrite internal links using the latest ledger")]
    Relink(EnvArgs),
    #[command(about = "Summarize the latest ledger")]
    Status(EnvArgs),
    #[command(about = "List configured destination environments")]
    Envs,
}

#[derive(Debug, Args)]
struct EnvArgs {
    #[arg(long, value_name = "KEY", help = "Environment key or name (d, e, s, p)")]
    env: Option<String>,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long, value_name = "KEY", help = "Environment key or name (d, e, s, p)")]
    env: Option<String>,
    #[arg(long, conflicts_with = "no_import_categories", help = "Import categories without asking")]
    yes: bool,
    #[arg(long, help = "Use existing destination categories without asking")]
    no_import_categories: bool,
    #[arg(long, value_name = "N", help = "Articles per batch")]
    chunk_size: Option<usize>,
    #[arg(long, help = "Ignore the latest ledger and migrate every article")]
    fresh: bool,
}

#[derive(Debug, Args)]
struct CategoriesArgs {
    #[arg(long, value_name = "KEY", help = "Environment key or name (d, e, s, p)")]
    env: Option<String>,
    #[arg(long, help = "Import categories without asking")]
    yes: bool,
}

/// Resolved paths, configuration and the selected environment for one command.
struct Workspace {
    paths: ResolvedPaths,
    config: MigrationConfig,
    environment: Environment,
    files: StateFiles,
    _log_guard: WorkerGuard,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Run(args)) => run_run(&runtime, args),
        Some(Commands::Categories(args)) => run_categories(&runtime, args),
        Some(Commands::BackfillNumbers(args)) => run_backfill_numbers(&runtime, args),
        Some(Commands::Relink(args)) => run_relink(&runtime, args),
        Some(Commands::Status(args)) => run_status(&runtime, args),
        Some(Commands::Envs) => run_envs(&runtime),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn run_run(runtime: &RuntimeOptions, args: RunArgs) -> Result<()> {
    let workspace = open_workspace(runtime, args.env.as_deref())?;
    let (mut map, resumed_from) = if args.fresh {
        (IdentityMap::new(), None)
    } else {
        workspace.files.load_latest_identity_map()?
    };
    let import_categories = if args.yes {
        true
    } else if args.no_import_categories {
        false
    } else {
        confirm("Import Freshdesk categories? (y/n): ")?
    };

    let source_settings = workspace.config.source_settings()?;
    let destination_settings = workspace.config.destination_settings()?;
    let run_settings = workspace.config.run_settings();
    let chunk_size = args.chunk_size.unwrap_or(run_settings.chunk_size).max(1);
    let link_host = source_settings.link_host.clone();

    let mut source = FreshdeskClient::new(source_settings)?;
    let mut destination = connect_destination(&workspace, &run_settings.timings)?;

    let run_timestamp = utc_timestamp();
    let plan = RunPlan {
        files: &workspace.files,
        assets: AssetScope {
            images_dir: &workspace.paths.images_dir,
            run_timestamp: &run_timestamp,
            link_host: &link_host,
            timings: &run_settings.timings,
        },
        portal_url: &workspace.environment.portal_url,
        french_locale_name: &destination_settings.french_locale_name,
        chunk_size,
        import_categories,
    };
    tracing::info!(
        "starting migration to {} ({}) with batches of {chunk_size}",
        workspace.environment.name,
        workspace.environment.org_url
    );
    let report = run_migration(&mut source, &mut destination, plan, &mut map)?;

    println!("migration complete");
    println!("environment: {}", workspace.environment.name);
    println!(
        "resumed_from: {}",
        resumed_from
            .as_deref()
            .map(normalize_for_display)
            .unwrap_or_else(|| "<none>".to_string())
    );
    println!("categories_created: {}", report.categories.created);
    println!("categories_existing: {}", report.categories.existing);
    println!("categories_failed: {}", report.categories.failures.len());
    println!("articles_total: {}", report.articles_total);
    println!("articles_skipped_existing: {}", report.skipped_existing);
    println!("folders_skipped: {}", report.skipped_folders.len());
    println!("source_reads_failed: {}", report.read_failures.len());
    for failure in &report.read_failures {
        println!("unreadable: {} {}: {}", failure.entity, failure.source_id, failure.error);
    }
    println!("batches: {}", report.batches.len());
    println!(
        "articles_failed: {}",
        report.batches.iter().map(|batch| batch.failed).sum::<usize>()
    );
    println!("source_requests: {}", source.request_count());
    println!("destination_requests: {}", destination.request_count());
    print_summary(&report.summary);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", workspace.paths.diagnostics());
    }
    Ok(())
}

fn run_categories(runtime: &RuntimeOptions, args: CategoriesArgs) -> Result<()> {
    let workspace = open_workspace(runtime, args.env.as_deref())?;
    let create = args.yes || confirm("Import Freshdesk categories? (y/n): ")?;

    let run_settings = workspace.config.run_settings();
    let mut source = FreshdeskClient::new(workspace.config.source_settings()?)?;
    let mut destination = connect_destination(&workspace, &run_settings.timings)?;

    let mut map = IdentityMap::new();
    let hierarchy =
        import_hierarchy(&mut source, &mut destination, &workspace.files, &mut map, create)?;
    for tree in &hierarchy.trees {
        let csv = workspace
            .files
            .save_folders_csv(tree.category.id, &tree.folders)?;
        println!(
            "category {} ({}): {} folders -> {}",
            tree.category.id,
            tree.category.name,
            tree.folders.len(),
            normalize_for_display(&csv)
        );
    }
    let report = &hierarchy.report;
    println!("categories_created: {}", report.created);
    println!("categories_existing: {}", report.existing);
    println!("categories_failed: {}", report.failures.len());
    println!("categories_unreadable: {}", hierarchy.unreadable.len());
    for failure in &hierarchy.unreadable {
        println!("unreadable: {} {}: {}", failure.entity, failure.source_id, failure.error);
    }
    for failure in &report.failures {
        println!(
            "failed: {} ({}){}: {}",
            failure.source_id,
            failure.name,
            if failure.ordering_violation { " [ordering]" } else { "" },
            failure.error
        );
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", workspace.paths.diagnostics());
    }
    Ok(())
}

fn run_backfill_numbers(runtime: &RuntimeOptions, args: EnvArgs) -> Result<()> {
    let workspace = open_workspace(runtime, args.env.as_deref())?;
    let mut map = load_required_ledger(&workspace)?;
    let run_settings = workspace.config.run_settings();
    let mut destination = connect_destination(&workspace, &run_settings.timings)?;

    let (backfill, summary, path) = final_reconciliation(
        &mut destination,
        &run_settings.timings,
        &workspace.files,
        &mut map,
    )?;
    println!("numbers_missing_before: {}", backfill.missing);
    println!("numbers_updated: {}", backfill.updated);
    println!("ledger: {}", normalize_for_display(&path));
    print_summary(&summary);
    if summary.missing_en_numbers > 0 || summary.missing_fr_numbers > 0 {
        println!("note: remaining numbers may need manual intervention or a later rerun");
    }
    Ok(())
}

fn run_relink(runtime: &RuntimeOptions, args: EnvArgs) -> Result<()> {
    let workspace = open_workspace(runtime, args.env.as_deref())?;
    let map = load_required_ledger(&workspace)?;
    let run_settings = workspace.config.run_settings();
    let mut destination = connect_destination(&workspace, &run_settings.timings)?;

    let report = rewrite_internal_links(&mut destination, &map, &workspace.environment.portal_url);
    let refs = workspace.files.save_link_refs(&map)?;
    println!("link_targets: {}", report.targets);
    println!("articles_checked: {}", report.articles_checked);
    println!("articles_updated: {}", report.articles_updated);
    println!("links_rewritten: {}", report.links_rewritten);
    println!("failures: {}", report.failures);
    println!("references: {}", normalize_for_display(&refs));
    Ok(())
}

fn run_status(runtime: &RuntimeOptions, args: EnvArgs) -> Result<()> {
    let workspace = open_workspace(runtime, args.env.as_deref())?;
    let Some(path) = workspace.files.latest_ledger()? else {
        println!("environment: {}", workspace.environment.name);
        println!("ledger: <none>");
        return Ok(());
    };
    let map = IdentityMap::from_ledger(workspace.files.load_ledger(&path)?);
    println!("environment: {}", workspace.environment.name);
    println!("ledger: {}", normalize_for_display(&path));
    print_summary(&summarize(&map));
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", workspace.paths.diagnostics());
    }
    Ok(())
}

fn run_envs(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    for environment in config.environments() {
        println!(
            "{} {}: {} (portal {}, tag {}, refresh_token {})",
            environment.key,
            environment.name,
            environment.org_url,
            environment.portal_url,
            environment.tag(),
            format_flag(environment.refresh_token.is_some())
        );
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn open_workspace(runtime: &RuntimeOptions, env_selector: Option<&str>) -> Result<Workspace> {
    let paths = resolve_runtime_paths(runtime)?;
    paths.ensure_layout()?;
    let log_guard = init_logging(&paths.log_path)?;
    let config = load_config(&paths.config_path)?;

    let environment = match env_selector {
        Some(selector) => config.environment(selector)?,
        None => prompt_environment(&config)?,
    };
    let files = StateFiles::new(&paths.data_dir, &environment.tag());
    tracing::info!(
        "using environment {} ({}), data in {}",
        environment.name,
        environment.org_url,
        normalize_for_display(&paths.data_dir)
    );
    Ok(Workspace {
        paths,
        config,
        environment,
        files,
        _log_guard: log_guard,
    })
}

fn connect_destination(
    workspace: &Workspace,
    timings: &RunTimings,
) -> Result<DataverseClient> {
    let settings = workspace.config.destination_settings()?;
    let session = Session::new(Box::new(OAuthTokenProvider::new(
        &settings,
        &workspace.environment,
    )?));
    DataverseClient::new(&settings, &workspace.environment, session, timings)
}

fn load_required_ledger(workspace: &Workspace) -> Result<IdentityMap> {
    let (map, path) = workspace.files.load_latest_identity_map()?;
    if path.is_none() {
        bail!(
            "no migrated_articles ledger for `{}` in {}",
            workspace.environment.name,
            normalize_for_display(workspace.files.data_dir())
        );
    }
    Ok(map)
}

fn prompt_environment(config: &MigrationConfig) -> Result<Environment> {
    let choices = config
        .environments()
        .iter()
        .map(|environment| format!("{}={}", environment.key, environment.name))
        .collect::<Vec<_>>()
        .join(", ");
    let answer = prompt(&format!("Select environment ({choices}): "))?;
    config.environment(&answer)
}

fn confirm(question: &str) -> Result<bool> {
    let answer = prompt(question)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn prompt(question: &str) -> Result<String> {
    let mut stdout = io::stdout();
    write!(stdout, "{question}").context("failed to write prompt")?;
    stdout.flush().context("failed to flush prompt")?;
    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("failed to read answer")?;
    Ok(answer.trim().to_string())
}

fn print_summary(summary: &MappingSummary) {
    println!("entries: {}", summary.articles);
    println!("translations: {}", summary.translations);
    println!("missing_en_numbers: {}", summary.missing_en_numbers);
    println!("missing_fr_numbers: {}", summary.missing_fr_numbers);
    println!("uncategorized: {}", summary.uncategorized);
    println!("unpublished: {}", summary.unpublished);
    println!("internal_links: {}", summary.internal_links);
    println!("unresolved_links: {}", summary.unresolved_links);
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
