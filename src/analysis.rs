use crate::{
    exporter::copy_files_unique,
    index_cache::{path_sort_key, PackageIndexProvider, PackageIndexSnapshot},
    issues::{self, IssueKind, TrayDependencyIssue},
    pipeline::{resolve_tray, FileMatchCounts, ResolvedTray, TrayInputs},
    task::{
        CancellationToken, Cancelled, ProgressCallback, ProgressReporter, TaskHandle,
        TrayDependencyStage,
    },
};
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    collections::HashSet,
    fmt, fs, io,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

pub const CSV_HEADER: &str = "PackagePath,Confidence,MatchInstanceCount,MatchRatePct,PackageSizeBytes";
pub const MATCHED_EXPORT_DIR: &str = "MatchedPackages";
pub const UNUSED_EXPORT_DIR: &str = "UnusedPackages";

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum MatchConfidence {
    #[default]
    Low,
    Medium,
    High,
}

impl MatchConfidence {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchConfidence::Low => "Low",
            MatchConfidence::Medium => "Medium",
            MatchConfidence::High => "High",
        }
    }
}

impl fmt::Display for MatchConfidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchConfidence {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(MatchConfidence::Low),
            "medium" => Ok(MatchConfidence::Medium),
            "high" => Ok(MatchConfidence::High),
            other => Err(format!("unknown confidence {other:?} (use Low, Medium or High)")),
        }
    }
}

pub fn classify_confidence(direct: usize, transitive: usize, rate_pct: f64) -> MatchConfidence {
    if direct >= 3 || rate_pct >= 30.0 {
        MatchConfidence::High
    } else if direct >= 2 || transitive > 0 || rate_pct >= 10.0 {
        MatchConfidence::Medium
    } else {
        MatchConfidence::Low
    }
}

pub fn match_rate_pct(match_count: usize, signal_count: usize) -> f64 {
    if signal_count == 0 {
        return 0.0;
    }
    (match_count as f64 * 100.0 / signal_count as f64).min(100.0)
}

#[derive(Debug, Clone)]
pub struct TrayDependencyAnalysisRequest {
    pub tray_root: PathBuf,
    pub mods_root: PathBuf,
    pub tray_item_key: String,
    pub min_match_count: usize,
    pub min_confidence: MatchConfidence,
    /// Zero keeps every row.
    pub top_n: usize,
    /// Zero keeps every row.
    pub max_package_count: usize,
    pub output_csv: Option<PathBuf>,
    pub unused_output_csv: Option<PathBuf>,
    pub export_root: Option<PathBuf>,
    pub export_matched: bool,
    pub export_unused: bool,
}

impl Default for TrayDependencyAnalysisRequest {
    fn default() -> Self {
        Self {
            tray_root: PathBuf::new(),
            mods_root: PathBuf::new(),
            tray_item_key: String::new(),
            min_match_count: 1,
            min_confidence: MatchConfidence::Low,
            top_n: 0,
            max_package_count: 0,
            output_csv: None,
            unused_output_csv: None,
            export_root: None,
            export_matched: false,
            export_unused: false,
        }
    }
}

impl TrayDependencyAnalysisRequest {
    fn wants_unused(&self) -> bool {
        self.unused_output_csv.is_some() || self.export_unused
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackageMatchRow {
    pub package_path: PathBuf,
    pub confidence: MatchConfidence,
    pub direct_match_count: usize,
    pub transitive_match_count: usize,
    pub match_instance_count: usize,
    pub match_rate_pct: f64,
    pub package_size_bytes: u64,
}

impl PackageMatchRow {
    fn scored(
        package_path: PathBuf,
        counts: FileMatchCounts,
        signal_count: usize,
        package_size_bytes: u64,
    ) -> Self {
        let match_instance_count = counts.direct + counts.transitive;
        let match_rate_pct = match_rate_pct(match_instance_count, signal_count);
        Self {
            package_path,
            confidence: classify_confidence(counts.direct, counts.transitive, match_rate_pct),
            direct_match_count: counts.direct,
            transitive_match_count: counts.transitive,
            match_instance_count,
            match_rate_pct,
            package_size_bytes,
        }
    }

    fn unused(package_path: PathBuf, package_size_bytes: u64) -> Self {
        Self {
            package_path,
            confidence: MatchConfidence::Low,
            direct_match_count: 0,
            transitive_match_count: 0,
            match_instance_count: 0,
            match_rate_pct: 0.0,
            package_size_bytes,
        }
    }

    pub fn to_csv_line(&self) -> String {
        format!(
            "{},{},{},{:.2},{}",
            csv_field(&self.package_path.to_string_lossy()),
            self.confidence,
            self.match_instance_count,
            self.match_rate_pct,
            self.package_size_bytes
        )
    }
}

fn rank_rows(a: &PackageMatchRow, b: &PackageMatchRow) -> Ordering {
    b.confidence
        .cmp(&a.confidence)
        .then_with(|| b.match_instance_count.cmp(&a.match_instance_count))
        .then_with(|| b.direct_match_count.cmp(&a.direct_match_count))
        .then_with(|| b.match_rate_pct.total_cmp(&a.match_rate_pct))
        .then_with(|| path_sort_key(&a.package_path).cmp(&path_sort_key(&b.package_path)))
}

pub fn filter_and_rank(
    rows: Vec<PackageMatchRow>,
    min_match_count: usize,
    min_confidence: MatchConfidence,
    top_n: usize,
    max_package_count: usize,
) -> Vec<PackageMatchRow> {
    let mut rows: Vec<PackageMatchRow> = rows
        .into_iter()
        .filter(|row| row.match_instance_count >= min_match_count)
        .filter(|row| row.confidence >= min_confidence)
        .collect();
    rows.sort_by(rank_rows);
    if top_n > 0 {
        rows.truncate(top_n);
    }
    if max_package_count > 0 {
        rows.truncate(max_package_count);
    }
    rows
}

pub fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

pub fn write_rows_csv(path: &Path, rows: &[PackageMatchRow]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut out = String::with_capacity(CSV_HEADER.len() + rows.len() * 96);
    out.push_str(CSV_HEADER);
    out.push('\n');
    for row in rows {
        out.push_str(&row.to_csv_line());
        out.push('\n');
    }
    fs::write(path, out)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TrayDependencyAnalysisResult {
    pub success: bool,
    pub tray_item_key: String,
    pub requested_signal_count: usize,
    pub matched_package_count: usize,
    pub rows: Vec<PackageMatchRow>,
    pub unused_rows: Vec<PackageMatchRow>,
    pub output_csv: Option<PathBuf>,
    pub unused_output_csv: Option<PathBuf>,
    pub matched_export_dir: Option<PathBuf>,
    pub unused_export_dir: Option<PathBuf>,
    pub exported_matched_files: Vec<PathBuf>,
    pub exported_unused_files: Vec<PathBuf>,
    pub issues: Vec<TrayDependencyIssue>,
}

#[derive(Clone)]
pub struct TrayDependencyAnalysisService {
    provider: Arc<dyn PackageIndexProvider>,
}

impl TrayDependencyAnalysisService {
    pub fn new(provider: Arc<dyn PackageIndexProvider>) -> Self {
        Self { provider }
    }

    pub fn analyze_async(
        &self,
        request: TrayDependencyAnalysisRequest,
        progress: Option<ProgressCallback>,
        cancel: CancellationToken,
    ) -> TaskHandle<Result<TrayDependencyAnalysisResult, Cancelled>> {
        let service = self.clone();
        TaskHandle::spawn(move || service.analyze(&request, progress, &cancel))
    }

    pub fn analyze(
        &self,
        request: &TrayDependencyAnalysisRequest,
        progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<TrayDependencyAnalysisResult, Cancelled> {
        let reporter = ProgressReporter::new(progress);
        let mut result = TrayDependencyAnalysisResult {
            tray_item_key: request.tray_item_key.trim().to_string(),
            ..TrayDependencyAnalysisResult::default()
        };
        tracing::info!(key = %result.tray_item_key, "tray analysis started");

        let export_root = request
            .export_root
            .clone()
            .filter(|root| !root.as_os_str().is_empty());
        if (request.export_matched || request.export_unused) && export_root.is_none() {
            issues::record(
                &mut result.issues,
                TrayDependencyIssue::error(
                    IssueKind::MissingExportTarget,
                    "package export was requested without an export directory",
                ),
            );
        }

        let resolved = resolve_tray(
            self.provider.as_ref(),
            &TrayInputs {
                tray_root: &request.tray_root,
                mods_root: &request.mods_root,
                tray_item_key: &request.tray_item_key,
            },
            &reporter,
            cancel,
            &mut result.issues,
        )?;
        let Some(resolved) = resolved else {
            return Ok(finish(result, &reporter));
        };

        result.tray_item_key = resolved.key.normalized.clone();
        result.requested_signal_count = resolved.search.signal_count();
        reporter.report(
            TrayDependencyStage::ExpandingDependencies,
            82,
            "Scoring matched packages",
        );
        let (scored, unused) = score_packages(&resolved, request.wants_unused());
        result.matched_package_count = scored.len();
        result.rows = filter_and_rank(
            scored,
            request.min_match_count,
            request.min_confidence,
            request.top_n,
            request.max_package_count,
        );
        result.unused_rows = unused;
        cancel.check()?;

        reporter.report(TrayDependencyStage::WritingOutputs, 85, "Writing reports");
        if let Some(path) = &request.output_csv {
            if write_report(path, &result.rows, &mut result.issues) {
                result.output_csv = Some(path.clone());
            }
        }
        if let Some(path) = &request.unused_output_csv {
            if write_report(path, &result.unused_rows, &mut result.issues) {
                result.unused_output_csv = Some(path.clone());
            }
        }
        cancel.check()?;

        if let Some(export_root) = export_root {
            if request.export_matched {
                let dir = export_root.join(MATCHED_EXPORT_DIR);
                let sources: Vec<PathBuf> =
                    result.rows.iter().map(|row| row.package_path.clone()).collect();
                reporter.report(
                    TrayDependencyStage::WritingOutputs,
                    88,
                    format!("Copying {} matched packages", sources.len()),
                );
                let outcome = copy_files_unique(&sources, &dir, cancel, |_, _, _| {})?;
                result.exported_matched_files = outcome.copied;
                result.issues.extend(outcome.issues);
                result.matched_export_dir = Some(dir);
            }
            if request.export_unused {
                let dir = export_root.join(UNUSED_EXPORT_DIR);
                let sources: Vec<PathBuf> = result
                    .unused_rows
                    .iter()
                    .map(|row| row.package_path.clone())
                    .collect();
                reporter.report(
                    TrayDependencyStage::WritingOutputs,
                    94,
                    format!("Copying {} unused packages", sources.len()),
                );
                let outcome = copy_files_unique(&sources, &dir, cancel, |_, _, _| {})?;
                result.exported_unused_files = outcome.copied;
                result.issues.extend(outcome.issues);
                result.unused_export_dir = Some(dir);
            }
        }

        Ok(finish(result, &reporter))
    }
}

/// Scored rows for every matched package, plus the unused complement when
/// asked for. The complement is taken before any filtering.
fn score_packages(
    resolved: &ResolvedTray,
    with_unused: bool,
) -> (Vec<PackageMatchRow>, Vec<PackageMatchRow>) {
    let signal_count = resolved.search.signal_count();
    let counts = resolved.counts_by_file();
    let scored = counts
        .values()
        .map(|(path, counts)| {
            let size = package_size(&resolved.snapshot, path);
            PackageMatchRow::scored(path.clone(), *counts, signal_count, size)
        })
        .collect();

    if !with_unused {
        return (scored, Vec::new());
    }
    let matched: HashSet<&String> = counts.keys().collect();
    let mut unused: Vec<PackageMatchRow> = resolved
        .snapshot
        .packages()
        .iter()
        .filter(|package| !matched.contains(&path_sort_key(&package.path)))
        .map(|package| PackageMatchRow::unused(package.path.clone(), package.length))
        .collect();
    unused.sort_by(|a, b| path_sort_key(&a.package_path).cmp(&path_sort_key(&b.package_path)));
    (scored, unused)
}

fn package_size(snapshot: &PackageIndexSnapshot, path: &Path) -> u64 {
    snapshot
        .find_package(path)
        .map(|package| package.length)
        .or_else(|| fs::metadata(path).ok().map(|meta| meta.len()))
        .unwrap_or(0)
}

fn write_report(
    path: &Path,
    rows: &[PackageMatchRow],
    issues: &mut Vec<TrayDependencyIssue>,
) -> bool {
    match write_rows_csv(path, rows) {
        Ok(()) => {
            tracing::info!(path = %path.display(), rows = rows.len(), "wrote report");
            true
        }
        Err(err) => {
            issues::record(
                issues,
                TrayDependencyIssue::error(
                    IssueKind::OutputWriteFailed,
                    format!("failed to write report: {err}"),
                )
                .with_file(path),
            );
            false
        }
    }
}

fn finish(
    mut result: TrayDependencyAnalysisResult,
    reporter: &ProgressReporter,
) -> TrayDependencyAnalysisResult {
    result.success = !issues::has_errors(&result.issues);
    tracing::info!(
        key = %result.tray_item_key,
        success = result.success,
        rows = result.rows.len(),
        unused = result.unused_rows.len(),
        "tray analysis finished"
    );
    reporter.report(
        TrayDependencyStage::Completed,
        100,
        format!("Analyzed {} matched packages", result.matched_package_count),
    );
    result
}
