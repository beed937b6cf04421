use crate::dbpf::TrayResourceKey;
use serde::Serialize;
use std::{
    fmt,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IssueSeverity {
    Warning,
    Error,
}

impl IssueSeverity {
    pub fn label(self) -> &'static str {
        match self {
            IssueSeverity::Warning => "warning",
            IssueSeverity::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IssueKind {
    MissingTrayPath,
    MissingModsPath,
    InvalidTrayKey,
    MissingExportTarget,
    TrayFilesNotFound,
    TrayParseFailed,
    PackageParseFailed,
    IndexingFailed,
    NoReferencesFound,
    MissingReference,
    MissingSourceFile,
    CopyFailed,
    OutputWriteFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrayDependencyIssue {
    pub severity: IssueSeverity,
    pub kind: IssueKind,
    pub message: String,
    pub file_path: Option<PathBuf>,
    pub resource_key: Option<TrayResourceKey>,
}

impl TrayDependencyIssue {
    pub fn warning(kind: IssueKind, message: impl Into<String>) -> Self {
        Self::new(IssueSeverity::Warning, kind, message)
    }

    pub fn error(kind: IssueKind, message: impl Into<String>) -> Self {
        Self::new(IssueSeverity::Error, kind, message)
    }

    fn new(severity: IssueSeverity, kind: IssueKind, message: impl Into<String>) -> Self {
        Self {
            severity,
            kind,
            message: message.into(),
            file_path: None,
            resource_key: None,
        }
    }

    pub fn with_file(mut self, path: &Path) -> Self {
        self.file_path = Some(path.to_path_buf());
        self
    }

    pub fn with_key(mut self, key: TrayResourceKey) -> Self {
        self.resource_key = Some(key);
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == IssueSeverity::Error
    }
}

impl fmt::Display for TrayDependencyIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.severity.label(), self.message)?;
        if let Some(path) = &self.file_path {
            write!(f, " ({})", path.display())?;
        }
        if let Some(key) = &self.resource_key {
            write!(f, " [{key}]")?;
        }
        Ok(())
    }
}

pub fn has_errors(issues: &[TrayDependencyIssue]) -> bool {
    issues.iter().any(TrayDependencyIssue::is_error)
}

/// Appends an issue and mirrors it to the log.
pub(crate) fn record(issues: &mut Vec<TrayDependencyIssue>, issue: TrayDependencyIssue) {
    match issue.severity {
        IssueSeverity::Warning => tracing::warn!(kind = ?issue.kind, "{issue}"),
        IssueSeverity::Error => tracing::error!(kind = ?issue.kind, "{issue}"),
    }
    issues.push(issue);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warnings_alone_do_not_fail() {
        let issues = vec![
            TrayDependencyIssue::warning(IssueKind::MissingReference, "2 unresolved"),
            TrayDependencyIssue::warning(IssueKind::MissingSourceFile, "gone"),
        ];
        assert!(!has_errors(&issues));
    }

    #[test]
    fn display_includes_context() {
        let issue = TrayDependencyIssue::error(IssueKind::CopyFailed, "copy failed")
            .with_file(Path::new("/mods/a.package"))
            .with_key(TrayResourceKey::new(1, 2, 3));
        let text = issue.to_string();
        assert!(text.starts_with("[error] copy failed"));
        assert!(text.contains("a.package"));
        assert!(text.ends_with("[00000001:00000002:0000000000000003]"));
    }
}
