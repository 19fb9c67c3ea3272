//! Binary entry point for the vecmaint maintenance CLI.
#![forbid(unsafe_code)]

#[path = "cli/config.rs"]
mod config;
#[path = "cli/ui.rs"]
mod ui;

use std::error::Error;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use vecmaint::admin::{
    clean_orphans, clean_wal, commit_wal, configure_purge, export_wal, inspect_collection,
    rebuild, store_info, tune, wal_info, CleanOptions, CleanOutcome, CollectionRef, CommitOptions,
    InspectOptions, MaintOptions, OrphanOutcome, PurgeMode, PurgeOutcome, RebuildOutcome,
    RebuildRequest, StoreInfoOptions, TopicScheme, TuneOutcome, TuneRequest,
};
use vecmaint::catalog::DEFAULT_DATABASE;
use vecmaint::config::{ConfigOverrides, Metric, RuntimeOverrides};
use vecmaint::logging::init_logging;
use vecmaint::store::human_bytes;
use vecmaint::Store;

use config::CliConfig;
use ui::{format_duration, Theme, Ui};

#[derive(Parser, Debug)]
#[command(
    name = "vecmaint",
    version,
    about = "Integrity and maintenance tooling for persistent vector stores",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[arg(
        long,
        global = true,
        value_name = "DIRECTIVE",
        help = "Log filter directive (overridden by RUST_LOG)"
    )]
    log_level: Option<String>,

    #[arg(
        long,
        global = true,
        env = "VECMAINT_CONFIG",
        value_name = "FILE",
        help = "CLI config file"
    )]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, help = "Color theme")]
    theme: Option<ThemeArg>,

    #[arg(short, long, global = true, help = "Plain output without decorations")]
    quiet: bool,

    #[arg(
        long,
        global = true,
        default_value = "default",
        help = "Tenant segment of WAL topics"
    )]
    topic_tenant: String,

    #[arg(
        long,
        global = true,
        default_value = "default",
        help = "Namespace segment of WAL topics"
    )]
    topic_namespace: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct StoreArg {
    #[arg(
        value_name = "STORE",
        help = "Store directory or a name from [stores] in the CLI config"
    )]
    store: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct CollectionArgs {
    #[arg(short = 'c', long = "collection", value_name = "NAME")]
    name: String,

    #[arg(short = 'd', long, value_name = "DATABASE", default_value = DEFAULT_DATABASE)]
    database: String,
}

impl CollectionArgs {
    fn to_ref(&self) -> CollectionRef {
        CollectionRef::new(&self.name).in_database(&self.database)
    }
}

#[derive(Args, Debug, Default)]
struct RuntimeArgs {
    #[arg(long, value_name = "N", help = "hnsw:search_ef")]
    search_ef: Option<usize>,

    #[arg(long, value_name = "N", help = "hnsw:num_threads")]
    num_threads: Option<usize>,

    #[arg(long, value_name = "F", help = "hnsw:resize_factor")]
    resize_factor: Option<f64>,

    #[arg(long, value_name = "N", help = "hnsw:batch_size")]
    batch_size: Option<usize>,

    #[arg(long, value_name = "N", help = "hnsw:sync_threshold")]
    sync_threshold: Option<usize>,
}

impl From<&RuntimeArgs> for RuntimeOverrides {
    fn from(args: &RuntimeArgs) -> Self {
        RuntimeOverrides {
            search_ef: args.search_ef,
            num_threads: args.num_threads,
            resize_factor: args.resize_factor,
            batch_size: args.batch_size,
            sync_threshold: args.sync_threshold,
        }
    }
}

#[derive(Args, Debug)]
struct RebuildCmd {
    #[command(flatten)]
    store: StoreArg,

    #[command(flatten)]
    collection: CollectionArgs,

    #[arg(long, value_name = "METRIC", help = "hnsw:space (l2, cosine, ip)")]
    space: Option<Metric>,

    #[arg(long = "m", value_name = "N", help = "hnsw:M")]
    m: Option<usize>,

    #[arg(long, value_name = "N", help = "hnsw:construction_ef")]
    construction_ef: Option<usize>,

    #[command(flatten)]
    runtime: RuntimeArgs,

    #[arg(long, help = "Delete the replaced directory instead of keeping a backup")]
    no_backup: bool,

    #[arg(long, value_name = "DIR", help = "Parent directory of the staging copy")]
    staging_dir: Option<PathBuf>,

    #[arg(long, value_name = "N", help = "Vectors copied per batch")]
    copy_batch_size: Option<usize>,

    #[arg(short = 'y', long, help = "Do not ask for confirmation")]
    yes: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Summarize every collection of a store")]
    Info {
        #[command(flatten)]
        store: StoreArg,

        #[arg(long, value_name = "NAME", help = "Collection to leave out (repeatable)")]
        skip: Vec<String>,

        #[arg(short, long, help = "Open every index to measure it")]
        verbose: bool,

        #[arg(long, help = "Redact filesystem paths")]
        privacy: bool,
    },

    #[command(subcommand, about = "Per-collection operations")]
    Collection(CollectionCommand),

    #[command(subcommand, about = "Write-ahead log operations")]
    Wal(WalCommand),

    #[command(subcommand, about = "Store-level housekeeping")]
    Db(DbCommand),
}

#[derive(Subcommand, Debug)]
enum CollectionCommand {
    #[command(about = "Inspect one collection")]
    Info {
        #[command(flatten)]
        store: StoreArg,

        #[command(flatten)]
        collection: CollectionArgs,

        #[arg(short, long, help = "Open the index to measure it")]
        verbose: bool,
    },

    #[command(about = "Rebuild the vector segment from its live elements")]
    Rebuild(RebuildCmd),

    #[command(about = "Change runtime parameters without a rebuild")]
    Config {
        #[command(flatten)]
        store: StoreArg,

        #[command(flatten)]
        collection: CollectionArgs,

        #[command(flatten)]
        runtime: RuntimeArgs,

        #[arg(short = 'y', long, help = "Do not ask for confirmation")]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum WalCommand {
    #[command(about = "Row counts per topic and the retention setting")]
    Info {
        #[command(flatten)]
        store: StoreArg,
    },

    #[command(about = "Switch automatic purging off or on")]
    Config {
        #[command(flatten)]
        store: StoreArg,

        #[arg(long, value_enum, value_name = "MODE")]
        purge: PurgeArg,

        #[arg(short = 'y', long, help = "Do not ask for confirmation")]
        yes: bool,
    },

    #[command(about = "Delete rows already incorporated into the indexes")]
    Clean {
        #[command(flatten)]
        store: StoreArg,

        #[arg(long, value_name = "NAME", help = "Collection to leave untouched (repeatable)")]
        exclude: Vec<String>,

        #[arg(long, value_name = "N", help = "Sequence ids per delete statement")]
        batch_size: Option<usize>,

        #[arg(short = 'y', long, help = "Do not ask for confirmation")]
        yes: bool,
    },

    #[command(about = "Write every row as JSON lines")]
    Export {
        #[command(flatten)]
        store: StoreArg,

        #[arg(short, long, value_name = "FILE", help = "Output file (stdout when omitted)")]
        out: Option<PathBuf>,
    },

    #[command(about = "Apply pending rows to the vector segments")]
    Commit {
        #[command(flatten)]
        store: StoreArg,

        #[arg(long, value_name = "NAME", help = "Collection to leave untouched (repeatable)")]
        exclude: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum DbCommand {
    #[command(about = "Delete segment directories no collection owns")]
    Clean {
        #[command(flatten)]
        store: StoreArg,

        #[arg(long, help = "List the directories without deleting them")]
        dry_run: bool,

        #[arg(short = 'y', long, help = "Do not ask for confirmation")]
        yes: bool,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum ThemeArg {
    Auto,
    Light,
    Dark,
    Plain,
}

impl From<ThemeArg> for Theme {
    fn from(theme: ThemeArg) -> Self {
        match theme {
            ThemeArg::Auto => Theme::Auto,
            ThemeArg::Light => Theme::Light,
            ThemeArg::Dark => Theme::Dark,
            ThemeArg::Plain => Theme::Plain,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum PurgeArg {
    Off,
    Auto,
}

impl From<PurgeArg> for PurgeMode {
    fn from(mode: PurgeArg) -> Self {
        match mode {
            PurgeArg::Off => PurgeMode::Off,
            PurgeArg::Auto => PurgeMode::Auto,
        }
    }
}

struct Ctx {
    format: OutputFormat,
    config: CliConfig,
    opts: MaintOptions,
    ui: Ui,
}

impl Ctx {
    fn store(&self, arg: &StoreArg) -> Result<Store, Box<dyn Error>> {
        let root = self.config.resolve_store(arg.store.as_deref())?;
        Ok(Store::open(root)?)
    }

    fn text(&self) -> bool {
        self.format == OutputFormat::Text
    }
}

impl Command {
    /// Whether the command can write to the store.
    fn mutates(&self) -> bool {
        match self {
            Command::Info { .. } => false,
            Command::Collection(CollectionCommand::Info { .. }) => false,
            Command::Collection(_) => true,
            Command::Wal(WalCommand::Info { .. } | WalCommand::Export { .. }) => false,
            Command::Wal(_) => true,
            Command::Db(DbCommand::Clean { dry_run, .. }) => !dry_run,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let mutates = cli.command.mutates();
    if let Err(err) = run(cli) {
        eprintln!("error: {err}");
        if mutates {
            eprintln!("catalog changes were rolled back");
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let config = CliConfig::load(cli.config.clone())?;
    let level = cli
        .log_level
        .clone()
        .or_else(|| config.log_level().map(str::to_string))
        .unwrap_or_else(|| "warn".to_string());
    init_logging(&level)?;
    let theme = cli
        .theme
        .map(Theme::from)
        .or_else(|| config.theme())
        .unwrap_or(Theme::Auto);
    let opts = MaintOptions {
        topics: TopicScheme {
            tenant: cli.topic_tenant.clone(),
            namespace: cli.topic_namespace.clone(),
        },
        ..MaintOptions::default()
    };
    let ctx = Ctx {
        format: cli.format,
        config,
        opts,
        ui: Ui::new(theme, cli.quiet),
    };

    match cli.command {
        Command::Info {
            store,
            skip,
            verbose,
            privacy,
        } => {
            let store = ctx.store(&store)?;
            let info = StoreInfoOptions {
                skip,
                verbose,
                privacy,
            };
            let report = store_info(&store, &ctx.opts, &info)?;
            emit(&ctx, &report, |ui| ui.store(&report))?;
        }
        Command::Collection(cmd) => run_collection(&ctx, cmd)?,
        Command::Wal(cmd) => run_wal(&ctx, cmd)?,
        Command::Db(DbCommand::Clean {
            store,
            dry_run,
            yes,
        }) => {
            let store = ctx.store(&store)?;
            let outcome = clean_orphans(&store, dry_run, |dirs| {
                if ctx.text() {
                    ctx.ui.orphans("Orphaned segment directories", dirs);
                }
                ctx.ui
                    .confirm(&format!("Delete {} directories?", dirs.len()), yes)
            })?;
            emit(&ctx, &outcome, |ui| match &outcome {
                OrphanOutcome::NothingToDo => ui.done("No orphaned segment directories"),
                OrphanOutcome::DryRun(dirs) => ui.orphans("Would delete", dirs),
                OrphanOutcome::Cancelled(_) => ui.note("Cancelled; nothing was deleted"),
                OrphanOutcome::Removed(dirs) => {
                    let freed: u64 = dirs.iter().map(|d| d.size_bytes).sum();
                    ui.done(&format!(
                        "Deleted {} directories, freed {}",
                        dirs.len(),
                        human_bytes(freed)
                    ));
                }
            })?;
        }
    }
    Ok(())
}

fn run_collection(ctx: &Ctx, cmd: CollectionCommand) -> Result<(), Box<dyn Error>> {
    match cmd {
        CollectionCommand::Info {
            store,
            collection,
            verbose,
        } => {
            let store = ctx.store(&store)?;
            let report = inspect_collection(
                &store,
                &ctx.opts,
                &collection.to_ref(),
                &InspectOptions { verbose },
            )?;
            emit(ctx, &report, |ui| ui.collection(&report))?;
        }
        CollectionCommand::Rebuild(cmd) => {
            let store = ctx.store(&cmd.store)?;
            let runtime = RuntimeOverrides::from(&cmd.runtime);
            let overrides = ConfigOverrides {
                space: cmd.space,
                m: cmd.m,
                construction_ef: cmd.construction_ef,
                ..ConfigOverrides::from(runtime)
            };
            let request = RebuildRequest {
                collection: cmd.collection.to_ref(),
                overrides,
                backup: !cmd.no_backup && ctx.config.backup().unwrap_or(true),
                staging_root: cmd
                    .staging_dir
                    .clone()
                    .or_else(|| ctx.config.staging_dir().cloned()),
                batch_size: cmd.copy_batch_size.or(ctx.config.batch_size()),
            };
            // The spinner would fight the prompt for the terminal.
            let task = cmd
                .yes
                .then(|| ctx.ui.spinner(format!("Rebuilding {}", cmd.collection.name)));
            let outcome = rebuild(&store, &ctx.opts, &request, |plan| {
                if ctx.text() && !cmd.yes {
                    ctx.ui.rebuild_plan(plan);
                }
                ctx.ui.confirm("Proceed with the rebuild?", cmd.yes)
            });
            if let Some(task) = task {
                task.stop();
            }
            let outcome = outcome?;
            emit(ctx, &outcome, |ui| match &outcome {
                RebuildOutcome::NothingToDo(report) => {
                    ui.done(&format!(
                        "{}: nothing to rebuild (no side-car and no configuration change)",
                        report.name
                    ));
                }
                RebuildOutcome::Cancelled(_) => ui.note("Cancelled; nothing was changed"),
                RebuildOutcome::Rebuilt(report) => {
                    ui.done(&format!(
                        "Rebuilt {} with {} vectors in {}",
                        report.plan.collection,
                        report.copied_vectors,
                        format_duration(Duration::from_secs_f64(report.duration_ms / 1_000.0))
                    ));
                    if let Some(path) = &report.backup_path {
                        ui.note(&format!("Backup kept at {}", path.display()));
                    }
                    ui.gap();
                    ui.collection(&report.after);
                }
            })?;
        }
        CollectionCommand::Config {
            store,
            collection,
            runtime,
            yes,
        } => {
            let store = ctx.store(&store)?;
            let request = TuneRequest {
                collection: collection.to_ref(),
                overrides: RuntimeOverrides::from(&runtime),
            };
            let outcome = tune(&store, &ctx.opts, &request, |changes| {
                if ctx.text() {
                    ctx.ui.changes(changes);
                }
                ctx.ui.confirm("Apply these changes?", yes)
            })?;
            emit(ctx, &outcome, |ui| match &outcome {
                TuneOutcome::Unchanged => ui.done("Configuration already matches"),
                TuneOutcome::Cancelled(_) => ui.note("Cancelled; nothing was changed"),
                TuneOutcome::Applied(changes) => {
                    ui.done(&format!("Applied {} change(s)", changes.len()));
                }
            })?;
        }
    }
    Ok(())
}

fn run_wal(ctx: &Ctx, cmd: WalCommand) -> Result<(), Box<dyn Error>> {
    match cmd {
        WalCommand::Info { store } => {
            let store = ctx.store(&store)?;
            let info = wal_info(&store, &ctx.opts)?;
            emit(ctx, &info, |ui| ui.wal(&info))?;
        }
        WalCommand::Config { store, purge, yes } => {
            let store = ctx.store(&store)?;
            let outcome = configure_purge(&store, purge.into(), |old, new| {
                ctx.ui.confirm(
                    &format!("Change automatically_purge from {old} to {new}?"),
                    yes,
                )
            })?;
            emit(ctx, &outcome, |ui| match &outcome {
                PurgeOutcome::Unchanged {
                    automatically_purge,
                } => ui.done(&format!(
                    "automatically_purge is already {automatically_purge}"
                )),
                PurgeOutcome::Cancelled => ui.note("Cancelled; nothing was changed"),
                PurgeOutcome::Applied { old, new } => {
                    ui.done(&format!("automatically_purge: {old} -> {new}"))
                }
            })?;
        }
        WalCommand::Clean {
            store,
            exclude,
            batch_size,
            yes,
        } => {
            let store = ctx.store(&store)?;
            let mut exclude = exclude;
            exclude.extend(ctx.config.wal_exclude().iter().cloned());
            let defaults = CleanOptions::default();
            let clean = CleanOptions {
                exclude,
                batch_size: batch_size.unwrap_or(defaults.batch_size),
            };
            let outcome = clean_wal(&store, &ctx.opts, &clean, |plan| {
                if ctx.text() {
                    ctx.ui.retention(plan);
                }
                ctx.ui.confirm(
                    &format!("Delete {} WAL rows?", plan.total_qualifying),
                    yes,
                )
            })?;
            emit(ctx, &outcome, |ui| match &outcome {
                CleanOutcome::NothingToDo(_) => ui.done("No WAL rows to delete"),
                CleanOutcome::Cancelled(_) => ui.note("Cancelled; nothing was deleted"),
                CleanOutcome::Cleaned(report) => ui.done(&format!(
                    "Deleted {} rows; store size {} -> {}",
                    report.rows_deleted,
                    human_bytes(report.size_before),
                    human_bytes(report.size_after)
                )),
            })?;
        }
        WalCommand::Export { store, out } => {
            let store = ctx.store(&store)?;
            let rows = match &out {
                Some(path) => {
                    let mut writer = BufWriter::new(File::create(path)?);
                    let rows = export_wal(&store, &mut writer)?;
                    writer.flush()?;
                    rows
                }
                None => {
                    let stdout = io::stdout();
                    let mut writer = BufWriter::new(stdout.lock());
                    let rows = export_wal(&store, &mut writer)?;
                    writer.flush()?;
                    rows
                }
            };
            if let Some(path) = out {
                report_export(ctx, rows, &path);
            }
        }
        WalCommand::Commit { store, exclude } => {
            let store = ctx.store(&store)?;
            let commit = CommitOptions { exclude };
            let report = commit_wal(&store, &ctx.opts, &commit)?;
            emit(ctx, &report, |ui| ui.commit(&report))?;
        }
    }
    Ok(())
}

fn report_export(ctx: &Ctx, rows: u64, path: &Path) {
    match ctx.format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({ "rows": rows, "path": path.display().to_string() })
        ),
        OutputFormat::Text => ctx
            .ui
            .done(&format!("Exported {rows} rows to {}", path.display())),
    }
}

fn emit<T, F>(ctx: &Ctx, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: serde::Serialize,
    F: Fn(&Ui),
{
    match ctx.format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(&ctx.ui),
    }
    Ok(())
}
