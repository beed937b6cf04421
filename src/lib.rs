//! Resolves which installed mod packages a saved tray item depends on.

pub mod analysis;
pub mod config;
pub mod dbpf;
pub mod expand;
pub mod export;
pub mod exporter;
pub mod index_cache;
pub mod issues;
pub mod matcher;
mod pipeline;
pub mod resource_types;
pub mod scanner;
pub mod task;
pub mod tray;

#[cfg(test)]
mod test_support;

pub use analysis::{
    MatchConfidence, PackageMatchRow, TrayDependencyAnalysisRequest,
    TrayDependencyAnalysisResult, TrayDependencyAnalysisService,
};
pub use dbpf::{IndexedPackageFile, PackageIndexEntry, TrayResourceKey};
pub use export::{
    TrayDependencyExportRequest, TrayDependencyExportResult, TrayDependencyExportService,
};
pub use index_cache::{PackageIndexCache, PackageIndexProvider, PackageIndexSnapshot};
pub use issues::{IssueKind, IssueSeverity, TrayDependencyIssue};
pub use task::{
    CancellationToken, Cancelled, ProgressCallback, TaskHandle, TrayDependencyProgress,
    TrayDependencyStage,
};
