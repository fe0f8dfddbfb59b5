use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use hitcounters_core::cache::MemoryCache;
use hitcounters_core::config::load_config;
use hitcounters_core::counters::HitCounters;
use hitcounters_core::hooks::{
    MagicWord, PopularPageLine, ViewedPage, Viewer, footer_view_count, magic_word_value,
    on_page_view, popular_page_line, statistics_extras,
};
use hitcounters_core::migrate::{latest_version, pending_migration_count, run_migrations};
use hitcounters_core::runtime::{
    InitOptions, MIGRATIONS_POLICY_MESSAGE, PathOverrides, ResolutionContext, ResolvedPaths,
    ensure_runtime_ready, init_layout, inspect_runtime, normalize_for_display, resolve_paths,
};
use hitcounters_core::sqlite_store::{SqliteCounterStore, load_stored_counter_stats};
use hitcounters_core::store::{CounterStore, PageId, PageRecord, PageRef, TopPage};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Parser)]
#[command(
    name = "hitcounters",
    version,
    about = "Page view counters backed by SQLite"
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
    Init(InitArgs),
    Db(DbArgs),
    Page(PageArgs),
    #[command(about = "Record page views as an ordinary reader would")]
    View(ViewArgs),
    #[command(about = "Show the view count of one page")]
    Count(CountArgs),
    #[command(about = "Show total views across the site")]
    Total(TotalArgs),
    #[command(about = "List the most viewed content pages")]
    Top(TopArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Skip writing .hitcounters/config.toml")]
    no_config: bool,
    #[arg(long, help = "Overwrite config.toml if it already exists")]
    force: bool,
}

#[derive(Debug, Args)]
struct DbArgs {
    #[command(subcommand)]
    command: DbSubcommand,
}

#[derive(Debug, Subcommand)]
enum DbSubcommand {
    Migrate,
    Stats,
}

#[derive(Debug, Args)]
struct PageArgs {
    #[command(subcommand)]
    command: PageSubcommand,
}

#[derive(Debug, Subcommand)]
enum PageSubcommand {
    #[command(about = "Register or update page metadata")]
    Add {
        id: PageId,
        title: String,
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        namespace: i32,
        #[arg(long)]
        redirect: bool,
        #[arg(long, default_value_t = 0)]
        length: u64,
    },
}

#[derive(Debug, Args)]
struct ViewArgs {
    #[arg(required = true)]
    ids: Vec<PageId>,
    #[arg(long, default_value_t = 1)]
    repeat: u32,
    #[arg(long, help = "View as a bot account")]
    bot: bool,
    #[arg(long, help = "View as a sysop")]
    sysop: bool,
    #[arg(long, help = "View with the exempt preference set")]
    exempt: bool,
}

#[derive(Debug, Args)]
struct CountArgs {
    id: PageId,
}

#[derive(Debug, Args)]
struct TotalArgs {
    #[arg(long, help = "Total edits, used for the views-per-edit ratio")]
    edits: Option<u64>,
}

#[derive(Debug, Args)]
struct TopArgs {
    #[arg(long, allow_negative_numbers = true)]
    limit: Option<i64>,
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Db(DbArgs { command })) => match command {
            DbSubcommand::Migrate => run_db_migrate(&runtime),
            DbSubcommand::Stats => run_db_stats(&runtime),
        },
        Some(Commands::Page(PageArgs { command })) => match command {
            PageSubcommand::Add {
                id,
                title,
                namespace,
                redirect,
                length,
            } => run_page_add(
                &runtime,
                PageRecord {
                    page_id: id,
                    namespace,
                    title,
                    is_redirect: redirect,
                    length,
                },
            ),
        },
        Some(Commands::View(args)) => run_view(&runtime, args),
        Some(Commands::Count(CountArgs { id })) => run_count(&runtime, id),
        Some(Commands::Total(args)) => run_total(&runtime, args),
        Some(Commands::Top(args)) => run_top(&runtime, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            materialize_config: !args.no_config,
            force: args.force,
        },
    )?;

    println!("Initialized hitcounters runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    println!("policy: {MIGRATIONS_POLICY_MESSAGE}");
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_db_migrate(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = run_migrations(&paths)?;

    println!("db migrate");
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("applied: {}", report.applied.len());
    for migration in &report.applied {
        println!("  - v{:03} {}", migration.version, migration.name);
    }
    println!("schema_version: {}", report.current_version);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_db_stats(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    let stored = load_stored_counter_stats(&paths)?;

    println!("db stats");
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("db_exists: {}", format_flag(status.db_exists));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    match stored {
        Some(stored) => {
            println!(
                "schema_version: {} (latest {})",
                stored.schema_version,
                latest_version()
            );
            println!("counters.rows: {}", stored.counter_rows);
            println!("counters.total_views: {}", stored.total_views);
            println!("pages.rows: {}", stored.page_rows);
        }
        None => println!("counters.storage: <not migrated> (run `hitcounters db migrate`)"),
    }
    if status.db_exists {
        let pending = pending_migration_count(&paths)?;
        println!("migrations.pending: {pending}");
    }
    if !status.warnings.is_empty() {
        println!("warnings:");
        for warning in &status.warnings {
            println!("  - {warning}");
        }
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_page_add(runtime: &RuntimeOptions, record: PageRecord) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let store = open_store(&paths)?;
    store
        .upsert_page(&record)
        .with_context(|| format!("failed to store page {}", record.page_id))?;

    println!("page add");
    println!("page_id: {}", record.page_id);
    println!("namespace: {}", record.namespace);
    println!("title: {}", record.title);
    println!("redirect: {}", format_flag(record.is_redirect));
    println!("length: {}", record.length);
    println!("countable: {}", format_flag(record.page_ref().is_countable()));
    Ok(())
}

fn run_view(runtime: &RuntimeOptions, args: ViewArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let counters = open_counters(&paths)?;
    let config = counters.config().clone();
    let viewer = Viewer {
        is_bot: args.bot,
        is_sysop: args.sysop,
        exempt: args.exempt,
    };

    let mut viewed_pages = Vec::with_capacity(args.ids.len());
    for id in &args.ids {
        let record = counters
            .store()
            .page(*id)
            .with_context(|| format!("failed to look up page {id}"))?;
        let viewed = match record {
            Some(record) => ViewedPage {
                page: record.page_ref(),
                exists: true,
            },
            None => ViewedPage {
                page: PageRef::new(*id, 0),
                exists: false,
            },
        };
        viewed_pages.push(viewed);
    }

    let mut recorded = 0u64;
    let mut skipped = 0u64;
    for _ in 0..args.repeat {
        for viewed in &viewed_pages {
            if on_page_view(&counters, &config, &viewer, viewed) {
                recorded += 1;
            } else {
                skipped += 1;
            }
        }
    }
    counters.flush();
    let stats = counters.deferred_stats();

    println!("view");
    println!("recorded: {recorded}");
    println!("skipped: {skipped}");
    println!("update_frequency: {}", config.update_frequency);
    println!("writes_applied: {}", stats.applied);
    println!("writes_failed: {}", stats.failed);
    if config.disable_counters {
        println!("counters: disabled");
    }
    for viewed in viewed_pages.iter().filter(|viewed| !viewed.exists) {
        println!(
            "missing_page: {} (run `hitcounters page add`)",
            viewed.page.id
        );
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_count(runtime: &RuntimeOptions, id: PageId) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let counters = open_counters(&paths)?;
    let record = counters
        .store()
        .page(id)
        .with_context(|| format!("failed to look up page {id}"))?;
    let page = record
        .as_ref()
        .map(PageRecord::page_ref)
        .unwrap_or_else(|| PageRef::new(id, 0));

    println!("count");
    println!("page_id: {id}");
    println!(
        "title: {}",
        record
            .as_ref()
            .map(|record| record.title.as_str())
            .unwrap_or("<unknown>")
    );
    println!(
        "views: {}",
        counters
            .get_page_view_count(&page)
            .map(|count| count.to_string())
            .unwrap_or_else(|| "<none>".to_string())
    );
    if let Some(value) = magic_word_value(
        &counters,
        counters.config(),
        MagicWord::NumberOfPageViews,
        &page,
    ) {
        println!("magic.{}: {value}", MagicWord::NumberOfPageViews.id());
    }
    if let Some(record) = &record
        && let Some(footer) = footer_view_count(&counters, counters.config(), record)
    {
        println!(
            "footer: {} count={} length={}",
            footer.message_key, footer.count, footer.length
        );
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_total(runtime: &RuntimeOptions, args: TotalArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let counters = open_counters(&paths)?;

    println!("total");
    println!(
        "views: {}",
        counters
            .get_site_total_views()
            .map(|total| total.to_string())
            .unwrap_or_else(|| "<unavailable>".to_string())
    );
    if let Some(value) = magic_word_value(
        &counters,
        counters.config(),
        MagicWord::NumberOfViews,
        &PageRef::new(0, 0),
    ) {
        println!("magic.{}: {value}", MagicWord::NumberOfViews.id());
    }
    if let Some(edits) = args.edits {
        let extras = statistics_extras(&counters, counters.config(), edits, Some(0));
        println!("edits: {edits}");
        println!("views_per_edit: {}", extras.views_per_edit);
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct TopPageOutput {
    #[serde(flatten)]
    page: TopPage,
    line: PopularPageLine,
}

fn run_top(runtime: &RuntimeOptions, args: TopArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let counters = open_counters(&paths)?;
    let limit = args
        .limit
        .unwrap_or_else(|| i64::from(counters.config().top_pages_default_limit));
    let rows = counters.list_top_pages(limit);

    if args.json {
        let output: Vec<TopPageOutput> = rows
            .into_iter()
            .map(|page| TopPageOutput {
                line: popular_page_line(&page, counters.config()),
                page,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("top pages");
    println!("limit: {limit}");
    println!("count: {}", rows.len());
    for (rank, row) in rows.iter().enumerate() {
        let line = popular_page_line(row, counters.config());
        let params = line
            .params
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(",");
        println!(
            "{}. [{}:{}] {} ({} {})",
            rank + 1,
            row.namespace,
            row.page_id,
            row.title,
            line.message_key,
            params
        );
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn open_store(paths: &ResolvedPaths) -> Result<SqliteCounterStore> {
    let status = inspect_runtime(paths)?;
    ensure_runtime_ready(paths, &status)?;
    SqliteCounterStore::open(&paths.db_path)
}

fn open_counters(paths: &ResolvedPaths) -> Result<HitCounters> {
    let store = open_store(paths)?;
    let config = load_config(&paths.config_path)?.resolve();
    info!(
        db_path = %normalize_path(&paths.db_path),
        update_frequency = config.update_frequency,
        disable_counters = config.disable_counters,
        "opened counter store"
    );
    HitCounters::new(Arc::new(store), Arc::new(MemoryCache::new()), config)
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

    let paths = resolve_paths(&context, &overrides)?;
    if paths.project_root.is_file() {
        bail!(
            "project root {} is a file, not a directory",
            normalize_path(&paths.project_root)
        );
    }
    Ok(paths)
}

fn normalize_path(path: &Path) -> String {
    normalize_for_display(path)
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
