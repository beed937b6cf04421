use crate::{
    exporter::copy_files_unique,
    index_cache::PackageIndexProvider,
    issues::{self, IssueKind, TrayDependencyIssue},
    pipeline::{resolve_tray, TrayInputs},
    task::{
        CancellationToken, Cancelled, ProgressCallback, ProgressReporter, TaskHandle,
        TrayDependencyStage,
    },
};
use serde::Serialize;
use std::{path::PathBuf, sync::Arc};

pub const TRAY_EXPORT_DIR: &str = "Tray";
pub const MODS_EXPORT_DIR: &str = "Mods";

#[derive(Debug, Clone, Default)]
pub struct TrayDependencyExportRequest {
    pub tray_root: PathBuf,
    pub mods_root: PathBuf,
    pub tray_item_key: String,
    pub export_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TrayDependencyExportResult {
    pub success: bool,
    pub tray_item_key: String,
    pub tray_export_dir: Option<PathBuf>,
    pub mods_export_dir: Option<PathBuf>,
    pub copied_tray_files: Vec<PathBuf>,
    pub copied_mod_files: Vec<PathBuf>,
    /// Every package holding a direct or transitive match, in path order.
    pub resolved_packages: Vec<PathBuf>,
    pub direct_match_count: usize,
    pub transitive_match_count: usize,
    pub issues: Vec<TrayDependencyIssue>,
}

impl TrayDependencyExportResult {
    pub fn copied_tray_file_count(&self) -> usize {
        self.copied_tray_files.len()
    }

    pub fn copied_mod_file_count(&self) -> usize {
        self.copied_mod_files.len()
    }

    pub fn warning_count(&self) -> usize {
        self.issues.iter().filter(|issue| !issue.is_error()).count()
    }

    pub fn error_count(&self) -> usize {
        self.issues.iter().filter(|issue| issue.is_error()).count()
    }
}

#[derive(Clone)]
pub struct TrayDependencyExportService {
    provider: Arc<dyn PackageIndexProvider>,
}

impl TrayDependencyExportService {
    pub fn new(provider: Arc<dyn PackageIndexProvider>) -> Self {
        Self { provider }
    }

    /// Starts the export on a worker thread and returns immediately.
    pub fn export_async(
        &self,
        request: TrayDependencyExportRequest,
        progress: Option<ProgressCallback>,
        cancel: CancellationToken,
    ) -> TaskHandle<Result<TrayDependencyExportResult, Cancelled>> {
        let service = self.clone();
        TaskHandle::spawn(move || service.export(&request, progress, &cancel))
    }

    pub fn export(
        &self,
        request: &TrayDependencyExportRequest,
        progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<TrayDependencyExportResult, Cancelled> {
        let reporter = ProgressReporter::new(progress);
        let mut result = TrayDependencyExportResult {
            tray_item_key: request.tray_item_key.trim().to_string(),
            ..TrayDependencyExportResult::default()
        };
        tracing::info!(key = %result.tray_item_key, "tray export started");

        let export_root = request
            .export_root
            .clone()
            .filter(|root| !root.as_os_str().is_empty());
        if export_root.is_none() {
            issues::record(
                &mut result.issues,
                TrayDependencyIssue::error(
                    IssueKind::MissingExportTarget,
                    "no export directory was given",
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
        let (Some(resolved), Some(export_root)) = (resolved, export_root) else {
            return Ok(finish(result, &reporter));
        };

        result.tray_item_key = resolved.key.normalized.clone();
        result.direct_match_count = resolved.direct.len();
        result.transitive_match_count = resolved.expanded.len();
        result.resolved_packages = resolved.resolved_files();

        let tray_dir = export_root.join(TRAY_EXPORT_DIR);
        let mods_dir = export_root.join(MODS_EXPORT_DIR);
        result.tray_export_dir = Some(tray_dir.clone());
        result.mods_export_dir = Some(mods_dir.clone());

        reporter.report(
            TrayDependencyStage::CopyingMods,
            85,
            format!("Copying {} tray files", resolved.bundle.files.len()),
        );
        let tray_copy = copy_files_unique(&resolved.bundle.paths(), &tray_dir, cancel, |_, _, _| {})?;
        result.copied_tray_files = tray_copy.copied;
        result.issues.extend(tray_copy.issues);
        if tray_copy.aborted {
            return Ok(finish(result, &reporter));
        }

        let mod_copy = copy_files_unique(
            &result.resolved_packages,
            &mods_dir,
            cancel,
            |current, total, _| {
                reporter.report_fraction(
                    TrayDependencyStage::CopyingMods,
                    86,
                    99,
                    current,
                    total,
                    format!("Copied {current}/{total} mod files"),
                );
            },
        )?;
        result.copied_mod_files = mod_copy.copied;
        result.issues.extend(mod_copy.issues);

        Ok(finish(result, &reporter))
    }
}

fn finish(
    mut result: TrayDependencyExportResult,
    reporter: &ProgressReporter,
) -> TrayDependencyExportResult {
    result.success = !issues::has_errors(&result.issues);
    tracing::info!(
        key = %result.tray_item_key,
        success = result.success,
        tray_files = result.copied_tray_files.len(),
        mod_files = result.copied_mod_files.len(),
        "tray export finished"
    );
    reporter.report(
        TrayDependencyStage::Completed,
        100,
        format!(
            "Exported {} tray files and {} mod files",
            result.copied_tray_files.len(),
            result.copied_mod_files.len()
        ),
    );
    result
}
