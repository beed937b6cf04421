use crate::{
    expand::expand_dependencies,
    index_cache::{
        path_sort_key, IndexError, IndexProgressFn, PackageIndexProvider, PackageIndexSnapshot,
    },
    issues::{self, IssueKind, TrayDependencyIssue},
    matcher::{match_direct, ResolvedResourceRef},
    scanner::{extract_search_keys, TraySearchKeys},
    task::{CancellationToken, Cancelled, ProgressReporter, TrayDependencyStage},
    tray::{load_tray_bundle, normalize_tray_item_key, TrayFileBundle, TrayItemKey},
};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

const INDEX_PROGRESS_EVERY: usize = 50;

pub(crate) struct TrayInputs<'a> {
    pub tray_root: &'a Path,
    pub mods_root: &'a Path,
    pub tray_item_key: &'a str,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct FileMatchCounts {
    pub direct: usize,
    pub transitive: usize,
}

pub(crate) struct ResolvedTray {
    pub key: TrayItemKey,
    pub bundle: TrayFileBundle,
    pub search: TraySearchKeys,
    pub snapshot: Arc<PackageIndexSnapshot>,
    pub direct: Vec<Arc<ResolvedResourceRef>>,
    pub expanded: Vec<Arc<ResolvedResourceRef>>,
}

impl ResolvedTray {
    /// Direct and transitive hit counts per package file, in path order.
    pub fn counts_by_file(&self) -> BTreeMap<String, (PathBuf, FileMatchCounts)> {
        let mut counts: BTreeMap<String, (PathBuf, FileMatchCounts)> = BTreeMap::new();
        for resolved in self.direct.iter().chain(self.expanded.iter()) {
            let slot = counts
                .entry(path_sort_key(&resolved.file_path))
                .or_insert_with(|| (resolved.file_path.clone(), FileMatchCounts::default()));
            if resolved.is_direct() {
                slot.1.direct += 1;
            } else {
                slot.1.transitive += 1;
            }
        }
        counts
    }

    /// Every package file holding a direct or transitive match.
    pub fn resolved_files(&self) -> Vec<PathBuf> {
        self.counts_by_file()
            .into_values()
            .map(|(path, _)| path)
            .collect()
    }
}

/// Runs the shared stages. `Ok(None)` means an error issue stopped the run;
/// the caller still owns whatever it collected so far.
pub(crate) fn resolve_tray(
    provider: &dyn PackageIndexProvider,
    inputs: &TrayInputs<'_>,
    reporter: &ProgressReporter,
    cancel: &CancellationToken,
    issues: &mut Vec<TrayDependencyIssue>,
) -> Result<Option<ResolvedTray>, Cancelled> {
    reporter.report(TrayDependencyStage::Preparing, 0, "Validating inputs");
    let Some(key) = validate_inputs(inputs, issues) else {
        return Ok(None);
    };
    cancel.check()?;

    reporter.report(
        TrayDependencyStage::IndexingPackages,
        5,
        format!("Indexing {}", inputs.mods_root.display()),
    );
    let on_index: &IndexProgressFn<'_> = &|current: usize, total: usize| {
        if current == total || current % INDEX_PROGRESS_EVERY == 0 {
            reporter.report_fraction(
                TrayDependencyStage::IndexingPackages,
                5,
                40,
                current,
                total,
                format!("Indexed {current}/{total} packages"),
            );
        }
    };
    let snapshot = match provider.snapshot(inputs.mods_root, Some(on_index), cancel) {
        Ok(snapshot) => snapshot,
        Err(IndexError::Cancelled(cancelled)) => return Err(cancelled),
        Err(err) => {
            issues::record(
                issues,
                TrayDependencyIssue::error(IssueKind::IndexingFailed, err.to_string())
                    .with_file(inputs.mods_root),
            );
            return Ok(None);
        }
    };
    for failure in snapshot.failures() {
        issues::record(
            issues,
            TrayDependencyIssue::error(IssueKind::PackageParseFailed, failure.message.clone())
                .with_file(&failure.path),
        );
    }
    cancel.check()?;

    reporter.report(
        TrayDependencyStage::ParsingTray,
        45,
        format!("Reading tray item {}", key.normalized),
    );
    let bundle = match load_tray_bundle(inputs.tray_root, &key) {
        Ok(bundle) => bundle,
        Err(err) => {
            issues::record(
                issues,
                TrayDependencyIssue::error(
                    IssueKind::TrayParseFailed,
                    format!("failed to list tray directory: {err}"),
                )
                .with_file(inputs.tray_root),
            );
            return Ok(None);
        }
    };
    if bundle.is_empty() {
        issues::record(
            issues,
            TrayDependencyIssue::error(
                IssueKind::TrayFilesNotFound,
                format!("no tray files found for {}", key.normalized),
            )
            .with_file(inputs.tray_root),
        );
        return Ok(None);
    }
    let extraction = extract_search_keys(&bundle, cancel)?;
    issues.extend(extraction.issues);
    cancel.check()?;

    reporter.report(
        TrayDependencyStage::MatchingDirectReferences,
        55,
        format!(
            "Matching {} references against {} packages",
            extraction.keys.signal_count(),
            snapshot.package_count()
        ),
    );
    let direct = match_direct(&extraction.keys, &snapshot, cancel)?;
    issues.extend(direct.issues);
    cancel.check()?;

    reporter.report(
        TrayDependencyStage::ExpandingDependencies,
        65,
        format!("Expanding {} direct matches", direct.matches.len()),
    );
    let expansion = expand_dependencies(&direct.matches, &snapshot, cancel, |current, total| {
        reporter.report_fraction(
            TrayDependencyStage::ExpandingDependencies,
            65,
            80,
            current,
            total,
            format!("Expanded {current}/{total} resources"),
        );
    })?;
    cancel.check()?;

    Ok(Some(ResolvedTray {
        key,
        bundle,
        search: extraction.keys,
        snapshot,
        direct: direct.matches,
        expanded: expansion.dependencies,
    }))
}

fn validate_inputs(
    inputs: &TrayInputs<'_>,
    issues: &mut Vec<TrayDependencyIssue>,
) -> Option<TrayItemKey> {
    let mut valid = true;
    if inputs.tray_root.as_os_str().is_empty() || !inputs.tray_root.is_dir() {
        issues::record(
            issues,
            TrayDependencyIssue::error(IssueKind::MissingTrayPath, "tray directory not found")
                .with_file(inputs.tray_root),
        );
        valid = false;
    }
    if inputs.mods_root.as_os_str().is_empty() || !inputs.mods_root.is_dir() {
        issues::record(
            issues,
            TrayDependencyIssue::error(IssueKind::MissingModsPath, "mods directory not found")
                .with_file(inputs.mods_root),
        );
        valid = false;
    }
    let key = match normalize_tray_item_key(inputs.tray_item_key) {
        Ok(key) => Some(key),
        Err(err) => {
            issues::record(
                issues,
                TrayDependencyIssue::error(IssueKind::InvalidTrayKey, err.to_string()),
            );
            None
        }
    };
    if valid {
        key
    } else {
        None
    }
}
