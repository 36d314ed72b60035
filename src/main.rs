use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{ArgAction, ColorChoice, CommandFactory, Parser, ValueEnum};
use clap_complete::Shell;
use is_terminal::IsTerminal;
use serde::{Deserialize, Serialize};

mod error;
mod filter;
mod indexer;
mod predicate;
mod render;
mod report;
mod tags;
mod window;

use crate::error::ReportError;
use crate::filter::ResourceFilter;
use crate::predicate::PredicateSet;
use crate::render::{RenderOptions, RenderOrder};
use crate::report::YamlReportLoader;
use crate::tags::TagFilter;
use crate::window::PruneOutcome;

static ENABLE_COLOR: OnceLock<bool> = OnceLock::new();

const DEFAULT_REPORT_DIR: &str = "/var/lib/puppet/reports";
const DEFAULT_HOURS: f64 = 12.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum OutputFmt { Text, Json }

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TextFormat { Lines, Table }

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum LogFormat { Text, Json }

#[derive(Clone, Copy, Debug, ValueEnum, Serialize, Deserialize)]
enum LogLevel { Error, Warn, Info, Debug, Trace }

#[derive(Parser, Debug)]
#[command(
    name = "reportreader",
    about = "Puppet report reader",
    long_about = "Indexes stored Puppet run reports, narrows them to a recent time window and a host, and prints the resources that changed or failed together with the run logs.",
    after_long_help = "Examples:\n  reportreader -s web1 -t 6\n  reportreader -s 'web*' -c -v --include-tags deploy\n  reportreader -l -t 24\n  reportreader --filter 'out_of_sync_count > 0, skipped' --all-resources\n  reportreader -t 72 --prune --dry-run",
    color = ColorChoice::Auto
)]
struct Args {
    /// Only reports from the last N hours (fractions allowed)
    #[arg(long, short = 't', default_value_t = DEFAULT_HOURS)]
    time: f64,
    /// Ignore the time window and read every selected report
    #[arg(long, default_value_t = false, conflicts_with = "prune")]
    no_window: bool,
    /// Host name, index from --list-hosts, glob, or `all`
    #[arg(long, short = 's')]
    hostname: Option<String>,
    #[arg(long, short = 'c', default_value_t = false)]
    changes: bool,
    #[arg(long, short = 'l', default_value_t = false)]
    logs: bool,
    #[arg(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,
    #[arg(long, short = 'f', default_value = DEFAULT_REPORT_DIR)]
    reportdir: String,
    /// Comma separated clauses such as `failed` or `change_count > 0`; replaces the default changes filter
    #[arg(long)]
    filter: Vec<String>,
    /// Do not restrict resources by predicate
    #[arg(long, default_value_t = false, conflicts_with = "filter")]
    all_resources: bool,
    #[arg(long, conflicts_with = "exclude_tags")]
    include_tags: Option<String>,
    #[arg(long)]
    exclude_tags: Option<String>,
    /// Resources hidden from the changes view unless failed
    #[arg(long, num_args = 0.., value_delimiter = ',')]
    ignore_resources: Vec<String>,
    /// Permanently delete reports older than the time window
    #[arg(long, default_value_t = false)]
    prune: bool,
    #[arg(long, default_value_t = false, requires = "prune")]
    dry_run: bool,
    #[arg(long, default_value_t = false)]
    list_hosts: bool,
    #[arg(long, value_enum, default_value = "lines")]
    text_format: TextFormat,
    #[arg(long, short = 'o', value_enum, default_value = "text")]
    output: OutputFmt,
    #[arg(long, short = 'j')]
    json_path: Option<String>,
    #[arg(long)]
    csv_path: Option<String>,
    #[arg(long, default_value = indexer::DEFAULT_ARCHIVE_DIR)]
    archive_dir: String,
    #[arg(long, default_value_t = false)]
    progress: bool,
    #[arg(long, short = 'C', default_value_t = false)]
    no_color: bool,
    #[arg(long, default_value_t = false)]
    force_color: bool,
    #[arg(short = 'q', long, default_value_t = false)]
    quiet: bool,
    #[arg(long)]
    log_level: Option<LogLevel>,
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
    #[arg(long)]
    log_path: Option<String>,
    #[arg(long)]
    config: Option<String>,
    #[arg(long, value_enum)]
    completions: Option<Shell>,
    #[arg(long)]
    completions_out: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AppConfig {
    report_dir: Option<String>,
    hours: Option<f64>,
    archive_dir: Option<String>,
    filter: Option<Vec<String>>,
    include_tags: Option<String>,
    exclude_tags: Option<String>,
    ignore_resources: Option<Vec<String>>,
    verbose: Option<u8>,
    output: Option<OutputFmt>,
    text_format: Option<TextFormat>,
    log_format: Option<LogFormat>,
    log_path: Option<String>,
    progress: Option<bool>,
}

#[derive(Debug, Default)]
struct RunSummary {
    files: usize,
    loaded: usize,
    skipped: usize,
    pruned: Option<PruneOutcome>,
}

fn main() {
    let mut args = Args::parse();
    if let Some(sh) = args.completions {
        let mut cmd = Args::command();
        if let Some(path) = args.completions_out.as_ref() {
            if let Ok(mut f) = std::fs::File::create(path) { clap_complete::generate(sh, &mut cmd, "reportreader", &mut f); } else { clap_complete::generate(sh, &mut cmd, "reportreader", &mut std::io::stdout()); }
        } else {
            clap_complete::generate(sh, &mut cmd, "reportreader", &mut std::io::stdout());
        }
        return;
    }
    let config_problem = load_config(&mut args);
    init_logging(&args);
    if let Some(msg) = config_problem { log::warn!("{}", msg); }
    let term = std::env::var("TERM").unwrap_or_default();
    let no_color_env = std::env::var_os("NO_COLOR").is_some();
    let color_default = std::io::stdout().is_terminal() && !no_color_env && term != "dumb";
    let enable_color = if args.force_color { true } else { color_default && !args.no_color };
    let _ = ENABLE_COLOR.set(enable_color);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    if let Err(e) = run(&args, Utc::now(), &mut out) {
        let _ = out.flush();
        eprintln!("Error: {:#}", e);
        std::process::exit(exit_code(&e));
    }
}

/// Reads `--config` or `./reportreader.toml`; returns a message to log once logging is up.
fn load_config(args: &mut Args) -> Option<String> {
    let (path, explicit) = match args.config.clone() {
        Some(p) => (p, true),
        None => ("reportreader.toml".to_string(), false),
    };
    let s = match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) if explicit => return Some(format!("Could not read config {}: {}", path, e)),
        Err(_) => return None,
    };
    match toml::from_str::<AppConfig>(&s) {
        Ok(cfg) => { apply_config(args, cfg); None }
        Err(e) => Some(format!("Ignoring config {}: {}", path, e)),
    }
}

fn apply_config(args: &mut Args, cfg: AppConfig) {
    if args.reportdir == DEFAULT_REPORT_DIR && let Some(v) = cfg.report_dir { args.reportdir = v; }
    if args.time == DEFAULT_HOURS && let Some(v) = cfg.hours { args.time = v; }
    if args.archive_dir == indexer::DEFAULT_ARCHIVE_DIR && let Some(v) = cfg.archive_dir { args.archive_dir = v; }
    if args.filter.is_empty() && !args.all_resources && let Some(v) = cfg.filter { args.filter = v; }
    if args.include_tags.is_none() && args.exclude_tags.is_none() {
        args.include_tags = cfg.include_tags;
        if args.include_tags.is_none() { args.exclude_tags = cfg.exclude_tags; }
    }
    if args.ignore_resources.is_empty() && let Some(v) = cfg.ignore_resources { args.ignore_resources = v; }
    if args.verbose == 0 && let Some(v) = cfg.verbose { args.verbose = v; }
    if args.output == OutputFmt::Text && let Some(v) = cfg.output { args.output = v; }
    if args.text_format == TextFormat::Lines && let Some(v) = cfg.text_format { args.text_format = v; }
    if args.log_format.is_none() && let Some(v) = cfg.log_format { args.log_format = Some(v); }
    if args.log_path.is_none() && let Some(v) = cfg.log_path { args.log_path = Some(v); }
    if let Some(v) = cfg.progress { args.progress = args.progress || v; }
}

fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
    if args.quiet {
        builder.filter_level(log::LevelFilter::Error);
    } else if let Some(lvl) = args.log_level {
        let f = match lvl { LogLevel::Error => log::LevelFilter::Error, LogLevel::Warn => log::LevelFilter::Warn, LogLevel::Info => log::LevelFilter::Info, LogLevel::Debug => log::LevelFilter::Debug, LogLevel::Trace => log::LevelFilter::Trace };
        builder.filter_level(f);
    } else if args.verbose > 0 {
        let f = if args.verbose >= 3 { log::LevelFilter::Trace } else if args.verbose == 2 { log::LevelFilter::Debug } else { log::LevelFilter::Info };
        builder.filter_level(f);
    }
    match args.log_format {
        Some(LogFormat::Json) => {
            builder.format(|buf, record| {
                let obj = serde_json::json!({
                    "ts": chrono::Local::now().to_rfc3339(),
                    "level": record.level().to_string(),
                    "target": record.target(),
                    "msg": record.args().to_string(),
                });
                writeln!(buf, "{}", obj)
            });
        }
        Some(LogFormat::Text) => {
            builder.format(|buf, record| {
                let ts = chrono::Local::now().format("%H:%M:%S");
                writeln!(buf, "[{:<5} {}] {}", record.level(), ts, record.args())
            });
        }
        None => {}
    }
    if let Some(path) = args.log_path.as_ref() {
        match std::fs::File::create(path) {
            Ok(f) => { builder.target(env_logger::Target::Pipe(Box::new(f))); }
            Err(e) => eprintln!("Failed to open log file {}: {}", path, e),
        }
    }
    builder.init();
}

fn exit_code(e: &anyhow::Error) -> i32 {
    match e.downcast_ref::<ReportError>() {
        Some(re) if re.is_selection() => 2,
        Some(re) if !re.is_fatal() => { log::debug!("Stopped on a per-file error: {}", re); 1 }
        _ => 1,
    }
}

fn paint(s: &str, code: &str) -> String {
    if *ENABLE_COLOR.get().unwrap_or(&false) { format!("\x1b[{}m{}\x1b[0m", code, s) } else { s.to_string() }
}

fn build_filter(args: &Args) -> anyhow::Result<ResourceFilter> {
    let mut f = ResourceFilter { tags: TagFilter::new(args.include_tags.as_deref(), args.exclude_tags.as_deref())?, ..Default::default() };
    if args.all_resources {
        f.predicates = PredicateSet::new();
    } else if !args.filter.is_empty() {
        let mut set = PredicateSet::new();
        for expr in &args.filter { set.extend_from_expr(expr)?; }
        f.predicates = set;
    }
    if !args.ignore_resources.is_empty() { f.ignore_resources = args.ignore_resources.clone(); }
    let clauses: Vec<String> = f.predicates.iter().map(|p| p.to_string()).collect();
    log::debug!("Resource filter: [{}], ignoring {:?}", clauses.join(" | "), f.ignore_resources);
    Ok(f)
}

fn run(args: &Args, now: DateTime<Utc>, out: &mut dyn Write) -> anyhow::Result<RunSummary> {
    let index = indexer::index_reports(Path::new(&args.reportdir), &args.archive_dir)?;
    log::info!("Found {} report files for {} hosts under {}", index.files.len(), index.hosts.len(), args.reportdir);
    let mut summary = RunSummary::default();
    if args.list_hosts {
        write!(out, "{}", render::render_host_index(&index, args.text_format == TextFormat::Table))?;
        return Ok(summary);
    }
    let filter = build_filter(args)?;
    let selected = index.select(args.hostname.as_deref())?;
    let (candidates, stale, order) = if args.no_window {
        (selected, vec![], RenderOrder::Chronological)
    } else {
        let split = window::partition(&selected, args.time, now)?;
        log::info!("{} reports since {} ({} older)", split.within.len(), split.cutoff, split.stale.len());
        (split.within, split.stale, RenderOrder::Preserve)
    };
    summary.files = candidates.len();

    let pb = if args.progress { Some(indicatif::ProgressBar::new_spinner()) } else { None };
    if let Some(ref pb) = pb { pb.set_message(format!("Loading {} reports", candidates.len())); }
    let (records, failures) = report::load_reports(&YamlReportLoader, &candidates, pb.as_ref());
    if let Some(pb) = pb { pb.finish_and_clear(); }
    summary.loaded = records.len();
    summary.skipped = failures.len();
    log::info!("Loaded {} records ({} skipped)", records.len(), failures.len());

    let ordered = render::order_reports(&records, order);
    let opts = RenderOptions { verbose: args.verbose > 0, color: *ENABLE_COLOR.get().unwrap_or(&false) };
    let show_logs = args.logs;
    let show_changes = args.changes || !args.logs;
    let filtered = if show_changes { filter.filter_reports(&ordered) } else { vec![] };

    if args.output == OutputFmt::Text {
        if show_changes { write!(out, "{}", render::render_changes(&filtered, opts))?; }
        if show_logs { write!(out, "{}", render::render_logs(&ordered, opts))?; }
    }
    if args.output == OutputFmt::Json || args.json_path.is_some() {
        let doc = match (show_changes, show_logs) {
            (true, true) => serde_json::json!({ "changes": render::changes_value(&filtered)?, "logs": render::logs_value(&ordered)? }),
            (true, false) => render::changes_value(&filtered)?,
            _ => render::logs_value(&ordered)?,
        };
        let text = serde_json::to_string_pretty(&doc)?;
        if args.output == OutputFmt::Json { writeln!(out, "{}", text)?; }
        if let Some(p) = args.json_path.as_ref() { std::fs::write(p, &text).with_context(|| format!("writing {}", p))?; }
    }
    if let Some(p) = args.csv_path.as_ref() && show_changes {
        render::write_csv(Path::new(p), &filtered).with_context(|| format!("writing {}", p))?;
    }

    if args.prune {
        log::warn!("Pruning {} reports older than {} hours", stale.len(), args.time);
        let outcome = window::prune(&stale, args.dry_run);
        let verb = if outcome.dry_run { "Would remove" } else { "Removed" };
        let line = format!("{} {} stale reports, {} failures", verb, outcome.removed.len(), outcome.failures.len());
        let code = if outcome.failures.is_empty() { "32" } else { "31" };
        if args.output == OutputFmt::Text { writeln!(out, "{}", paint(&line, code))?; } else { log::info!("{}", line); }
        summary.pruned = Some(outcome);
    }
    Ok(summary)
}
