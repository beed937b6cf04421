use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use std::{path::PathBuf, sync::Arc};
use traysmith::{
    analysis::{MatchConfidence, TrayDependencyAnalysisRequest, TrayDependencyAnalysisService},
    config::AppConfig,
    export::{TrayDependencyExportRequest, TrayDependencyExportService},
    index_cache::PackageIndexCache,
    issues::TrayDependencyIssue,
    task::{CancellationToken, ProgressCallback, TrayDependencyProgress},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "json" => Some(OutputFormat::Json),
            "text" => Some(OutputFormat::Text),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq)]
enum CliAction {
    Help,
    Version,
    Command {
        command: CliCommand,
        format: OutputFormat,
    },
}

#[derive(Debug, PartialEq)]
enum CliCommand {
    Index(Option<PathBuf>),
    Export(TrayOptions),
    Analyze(AnalyzeOptions),
    ConfigShow,
    ConfigSet { field: String, value: String },
}

/// Inputs shared by `export` and `analyze`. Unset values fall back to the
/// saved config.
#[derive(Debug, Default, PartialEq)]
struct TrayOptions {
    tray: Option<PathBuf>,
    mods: Option<PathBuf>,
    key: Option<String>,
    out: Option<PathBuf>,
    quiet: bool,
}

#[derive(Debug, Default, PartialEq)]
struct AnalyzeOptions {
    tray: TrayOptions,
    csv: Option<PathBuf>,
    unused_csv: Option<PathBuf>,
    min_matches: Option<usize>,
    min_confidence: Option<MatchConfidence>,
    top: Option<usize>,
    max: Option<usize>,
    export_matched: bool,
    export_unused: bool,
}

/// Returns whether the command succeeded.
pub fn run() -> Result<bool> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match parse_args(&args)? {
        CliAction::Help => {
            print_help();
            Ok(true)
        }
        CliAction::Version => {
            println!("traysmith v{}", env!("CARGO_PKG_VERSION"));
            Ok(true)
        }
        CliAction::Command { command, format } => run_command(command, format),
    }
}

fn parse_args(args: &[String]) -> Result<CliAction> {
    let (format, tokens) = parse_global_options(args)?;
    let Some(head) = tokens.first() else {
        return Ok(CliAction::Help);
    };
    let rest = tokens.get(1..).unwrap_or(&[]);
    let command = match head.as_str() {
        "-h" | "--help" | "help" => return Ok(CliAction::Help),
        "-V" | "--version" | "version" => return Ok(CliAction::Version),
        "index" => {
            if rest.len() > 1 {
                bail!("index takes at most one mods directory");
            }
            CliCommand::Index(rest.first().map(PathBuf::from))
        }
        "export" => CliCommand::Export(parse_tray_options(rest)?),
        "analyze" => CliCommand::Analyze(parse_analyze_options(rest)?),
        "config" => parse_config_command(rest)?,
        other => bail!("Unknown command: {other} (see 'traysmith --help')"),
    };
    Ok(CliAction::Command { command, format })
}

fn parse_global_options(args: &[String]) -> Result<(OutputFormat, Vec<String>)> {
    let mut format = OutputFormat::Text;
    let mut tokens = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let value = if let Some(value) = arg.strip_prefix("--format=") {
            value.to_string()
        } else if arg == "--format" {
            next_value(&mut iter, "--format")?
        } else {
            tokens.push(arg.to_string());
            continue;
        };
        format = OutputFormat::parse(&value)
            .ok_or_else(|| anyhow!("Unknown format: {value} (use 'json' or 'text')"))?;
    }
    Ok((format, tokens))
}

fn parse_config_command(args: &[String]) -> Result<CliCommand> {
    match args.first().map(|value| value.as_str()).unwrap_or("show") {
        "show" => Ok(CliCommand::ConfigShow),
        "set" => {
            let field = args
                .get(1)
                .ok_or_else(|| anyhow!("config set requires a field name"))?;
            let value = args.get(2).map(|value| value.as_str()).unwrap_or("");
            Ok(CliCommand::ConfigSet {
                field: field.to_string(),
                value: value.to_string(),
            })
        }
        other => bail!("Unknown config command: {other} (use 'show' or 'set')"),
    }
}

fn next_value<'a>(iter: &mut impl Iterator<Item = &'a String>, flag: &str) -> Result<String> {
    iter.next()
        .map(|value| value.to_string())
        .ok_or_else(|| anyhow!("{flag} requires a value"))
}

/// Splits `--flag=value` and `--flag value` forms.
fn flag_value<'a>(
    arg: &str,
    iter: &mut impl Iterator<Item = &'a String>,
) -> Result<(String, Option<String>)> {
    if let Some((flag, value)) = arg.split_once('=') {
        return Ok((flag.to_string(), Some(value.to_string())));
    }
    let takes_value = !matches!(
        arg,
        "--quiet" | "-q" | "--export-matched" | "--export-unused"
    );
    if takes_value {
        Ok((arg.to_string(), Some(next_value(iter, arg)?)))
    } else {
        Ok((arg.to_string(), None))
    }
}

fn parse_tray_flag(options: &mut TrayOptions, flag: &str, value: Option<String>) -> bool {
    match (flag, value) {
        ("--tray", Some(value)) => options.tray = Some(PathBuf::from(value)),
        ("--mods", Some(value)) => options.mods = Some(PathBuf::from(value)),
        ("--key", Some(value)) => options.key = Some(value),
        ("--out", Some(value)) => options.out = Some(PathBuf::from(value)),
        ("--quiet" | "-q", _) => options.quiet = true,
        _ => return false,
    }
    true
}

fn parse_tray_options(args: &[String]) -> Result<TrayOptions> {
    let mut options = TrayOptions::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let (flag, value) = flag_value(arg, &mut iter)?;
        if !parse_tray_flag(&mut options, &flag, value) {
            bail!("Unknown export option: {arg}");
        }
    }
    Ok(options)
}

fn parse_analyze_options(args: &[String]) -> Result<AnalyzeOptions> {
    let mut options = AnalyzeOptions::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let (flag, value) = flag_value(arg, &mut iter)?;
        if parse_tray_flag(&mut options.tray, &flag, value.clone()) {
            continue;
        }
        match (flag.as_str(), value) {
            ("--csv", Some(value)) => options.csv = Some(PathBuf::from(value)),
            ("--unused-csv", Some(value)) => options.unused_csv = Some(PathBuf::from(value)),
            ("--min-matches", Some(value)) => {
                options.min_matches = Some(parse_number("--min-matches", &value)?)
            }
            ("--min-confidence", Some(value)) => {
                options.min_confidence =
                    Some(value.parse().map_err(|err: String| anyhow!(err))?)
            }
            ("--top", Some(value)) => options.top = Some(parse_number("--top", &value)?),
            ("--max", Some(value)) => options.max = Some(parse_number("--max", &value)?),
            ("--export-matched", _) => options.export_matched = true,
            ("--export-unused", _) => options.export_unused = true,
            _ => bail!("Unknown analyze option: {arg}"),
        }
    }
    Ok(options)
}

fn parse_number(flag: &str, value: &str) -> Result<usize> {
    value
        .parse()
        .with_context(|| format!("{flag} expects a non-negative number, got {value:?}"))
}

fn run_command(command: CliCommand, format: OutputFormat) -> Result<bool> {
    let mut config = AppConfig::load_or_create()?;
    match command {
        CliCommand::Index(mods) => index_mods(&config, mods, format),
        CliCommand::Export(options) => export_tray(&config, options, format),
        CliCommand::Analyze(options) => analyze_tray(&config, options, format),
        CliCommand::ConfigShow => {
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
                OutputFormat::Text => {
                    println!("Config: {}", AppConfig::path()?.display());
                    println!("{}", serde_json::to_string_pretty(&config)?);
                }
            }
            Ok(true)
        }
        CliCommand::ConfigSet { field, value } => {
            config.set_field(&field, &value)?;
            config.save()?;
            println!("Set {field}");
            Ok(true)
        }
    }
}

fn required_path(flag: Option<PathBuf>, saved: &Option<PathBuf>, name: &str) -> Result<PathBuf> {
    flag.or_else(|| saved.clone())
        .ok_or_else(|| anyhow!("{name} is not set (pass it or use 'traysmith config set')"))
}

fn progress_printer(quiet: bool) -> Option<ProgressCallback> {
    if quiet {
        return None;
    }
    Some(Arc::new(|progress: TrayDependencyProgress| {
        eprintln!(
            "[{:>3}%] {}: {}",
            progress.percent,
            progress.stage.label(),
            progress.detail
        );
    }))
}

#[derive(Serialize)]
struct IndexSummary {
    mods_root: PathBuf,
    packages: usize,
    resources: usize,
    failures: Vec<IndexFailure>,
}

#[derive(Serialize)]
struct IndexFailure {
    path: PathBuf,
    message: String,
}

fn index_mods(config: &AppConfig, mods: Option<PathBuf>, format: OutputFormat) -> Result<bool> {
    let mods_root = required_path(mods, &config.mods_root, "mods_root")?;
    let cache = PackageIndexCache::new();
    let snapshot = cache
        .get_snapshot(&mods_root, None, &CancellationToken::new())
        .with_context(|| format!("index {}", mods_root.display()))?;

    let summary = IndexSummary {
        mods_root: snapshot.root().to_path_buf(),
        packages: snapshot.package_count(),
        resources: snapshot.resource_count(),
        failures: snapshot
            .failures()
            .iter()
            .map(|failure| IndexFailure {
                path: failure.path.clone(),
                message: failure.message.clone(),
            })
            .collect(),
    };
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        OutputFormat::Text => {
            println!("Mods root: {}", summary.mods_root.display());
            println!("Packages:  {}", summary.packages);
            println!("Resources: {}", summary.resources);
            if !summary.failures.is_empty() {
                println!("Unreadable packages: {}", summary.failures.len());
                for failure in &summary.failures {
                    println!("  {}: {}", failure.path.display(), failure.message);
                }
            }
        }
    }
    Ok(true)
}

fn export_tray(config: &AppConfig, options: TrayOptions, format: OutputFormat) -> Result<bool> {
    let request = TrayDependencyExportRequest {
        tray_root: required_path(options.tray, &config.tray_root, "tray_root")?,
        mods_root: required_path(options.mods, &config.mods_root, "mods_root")?,
        tray_item_key: options
            .key
            .ok_or_else(|| anyhow!("--key is required"))?,
        export_root: Some(required_path(options.out, &config.export_root, "export_root")?),
    };
    let service = TrayDependencyExportService::new(Arc::new(PackageIndexCache::new()));
    let result = service
        .export_async(request, progress_printer(options.quiet), CancellationToken::new())
        .join()?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Text => {
            println!("Tray item: {}", result.tray_item_key);
            if let Some(dir) = &result.tray_export_dir {
                println!("Tray files: {} -> {}", result.copied_tray_file_count(), dir.display());
            }
            if let Some(dir) = &result.mods_export_dir {
                println!("Mod files:  {} -> {}", result.copied_mod_file_count(), dir.display());
            }
            println!(
                "Matches:    {} direct, {} transitive",
                result.direct_match_count, result.transitive_match_count
            );
            print_issues(&result.issues);
            println!("{}", if result.success { "Export complete." } else { "Export failed." });
        }
    }
    Ok(result.success)
}

fn analyze_tray(config: &AppConfig, options: AnalyzeOptions, format: OutputFormat) -> Result<bool> {
    let tray = options.tray;
    let export_root = tray.out.or_else(|| config.export_root.clone());
    let unused_output_csv = options.unused_csv.or_else(|| {
        if config.write_unused_report {
            export_root.as_ref().map(|root| root.join("unused_packages.csv"))
        } else {
            None
        }
    });
    let request = TrayDependencyAnalysisRequest {
        tray_root: required_path(tray.tray, &config.tray_root, "tray_root")?,
        mods_root: required_path(tray.mods, &config.mods_root, "mods_root")?,
        tray_item_key: tray.key.ok_or_else(|| anyhow!("--key is required"))?,
        min_match_count: options.min_matches.unwrap_or(config.min_match_count),
        min_confidence: options.min_confidence.unwrap_or(config.min_confidence),
        top_n: options.top.unwrap_or(config.top_n),
        max_package_count: options.max.unwrap_or(config.max_package_count),
        output_csv: options.csv,
        unused_output_csv,
        export_root,
        export_matched: options.export_matched,
        export_unused: options.export_unused,
    };
    let service = TrayDependencyAnalysisService::new(Arc::new(PackageIndexCache::new()));
    let result = service
        .analyze_async(request, progress_printer(tray.quiet), CancellationToken::new())
        .join()?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Text => {
            println!(
                "Tray item: {} ({} references, {} matched packages)",
                result.tray_item_key, result.requested_signal_count, result.matched_package_count
            );
            if result.rows.is_empty() {
                println!("No packages passed the filters.");
            } else {
                println!("{:<8} {:>7} {:>8}  {}", "CONF", "MATCHES", "RATE", "PACKAGE");
                for row in &result.rows {
                    println!(
                        "{:<8} {:>7} {:>7.2}%  {}",
                        row.confidence.as_str(),
                        row.match_instance_count,
                        row.match_rate_pct,
                        row.package_path.display()
                    );
                }
            }
            if !result.unused_rows.is_empty() {
                println!("Unused packages: {}", result.unused_rows.len());
            }
            for path in [&result.output_csv, &result.unused_output_csv].into_iter().flatten() {
                println!("Wrote {}", path.display());
            }
            if let Some(dir) = &result.matched_export_dir {
                println!("Copied {} packages -> {}", result.exported_matched_files.len(), dir.display());
            }
            if let Some(dir) = &result.unused_export_dir {
                println!("Copied {} packages -> {}", result.exported_unused_files.len(), dir.display());
            }
            print_issues(&result.issues);
        }
    }
    Ok(result.success)
}

fn print_issues(issues: &[TrayDependencyIssue]) {
    if issues.is_empty() {
        return;
    }
    println!("Issues:");
    for issue in issues {
        println!("  {issue}");
    }
}

fn print_help() {
    println!("traysmith v{}", env!("CARGO_PKG_VERSION"));
    println!("Usage:");
    println!("  traysmith index [mods_dir]            Index packages and report unreadable ones");
    println!("  traysmith export [options]            Copy a tray item and the mods it uses");
    println!("  traysmith analyze [options]           Score the packages a tray item uses");
    println!("  traysmith config show                 Print saved defaults");
    println!("  traysmith config set <field> <value>  Change a saved default");
    println!();
    println!("Tray options:");
    println!("  --tray <dir>                          Tray directory");
    println!("  --mods <dir>                          Mods directory");
    println!("  --key <hex>                           Tray item key (0x<hex> or bare hex)");
    println!("  --out <dir>                           Export directory");
    println!("  -q, --quiet                           Hide progress");
    println!();
    println!("Analyze options:");
    println!("  --csv <path>                          Write matched packages as CSV");
    println!("  --unused-csv <path>                   Write unused packages as CSV");
    println!("  --min-matches <n>                     Drop packages with fewer matches");
    println!("  --min-confidence <Low|Medium|High>    Drop packages below this confidence");
    println!("  --top <n>                             Keep the best n packages");
    println!("  --max <n>                             Hard cap on reported packages");
    println!("  --export-matched                      Copy matched packages to <out>/MatchedPackages");
    println!("  --export-unused                       Copy unused packages to <out>/UnusedPackages");
    println!();
    println!("Global options:");
    println!("  --format <json|text>                  Output format");
    println!("  -h, --help                            Show help");
    println!("  -V, --version                         Show version");
    println!();
    println!("Logging: set TRAYSMITH_LOG (e.g. TRAYSMITH_LOG=debug).");
}
