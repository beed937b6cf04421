use crate::{
    issues::{self, IssueKind, TrayDependencyIssue},
    task::{CancellationToken, Cancelled},
};
use filetime::{set_file_mtime, FileTime};
use std::{
    ffi::{OsStr, OsString},
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Default)]
pub struct CopyBatchOutcome {
    pub copied: Vec<PathBuf>,
    pub issues: Vec<TrayDependencyIssue>,
    pub aborted: bool,
}

fn numbered_name(file_name: &OsStr, counter: usize) -> OsString {
    if counter < 2 {
        return file_name.to_os_string();
    }
    let name = Path::new(file_name);
    let stem = name
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.extension() {
        Some(ext) => format!("{stem} ({counter}).{}", ext.to_string_lossy()).into(),
        None => format!("{stem} ({counter})").into(),
    }
}

/// Exclusively creates `name.ext`, else `name (2).ext`, `name (3).ext` and
/// so on.
pub fn create_unique_destination(
    target_dir: &Path,
    file_name: &OsStr,
) -> io::Result<(PathBuf, File)> {
    let mut counter = 1usize;
    loop {
        let candidate = target_dir.join(numbered_name(file_name, counter));
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(file) => return Ok((candidate, file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => counter += 1,
            Err(err) => return Err(err),
        }
    }
}

fn copy_into(source: &Path, target_dir: &Path, file_name: &OsStr) -> io::Result<PathBuf> {
    let mut reader = File::open(source)?;
    let (dest, mut writer) = create_unique_destination(target_dir, file_name)?;
    io::copy(&mut reader, &mut writer)?;
    writer.flush()?;
    drop(writer);
    if let Ok(modified) = reader.metadata().and_then(|meta| meta.modified()) {
        if let Err(err) = set_file_mtime(&dest, FileTime::from_system_time(modified)) {
            tracing::debug!(path = %dest.display(), "could not preserve mtime: {err}");
        }
    }
    Ok(dest)
}

pub fn copy_files_unique(
    sources: &[PathBuf],
    target_dir: &Path,
    cancel: &CancellationToken,
    mut on_copied: impl FnMut(usize, usize, &Path),
) -> Result<CopyBatchOutcome, Cancelled> {
    let mut outcome = CopyBatchOutcome::default();
    if let Err(err) = fs::create_dir_all(target_dir) {
        issues::record(
            &mut outcome.issues,
            TrayDependencyIssue::error(
                IssueKind::CopyFailed,
                format!("failed to create export directory: {err}"),
            )
            .with_file(target_dir),
        );
        outcome.aborted = true;
        return Ok(outcome);
    }

    for (index, source) in sources.iter().enumerate() {
        cancel.check()?;
        if !source.is_file() {
            issues::record(
                &mut outcome.issues,
                TrayDependencyIssue::warning(
                    IssueKind::MissingSourceFile,
                    "source file no longer exists",
                )
                .with_file(source),
            );
            continue;
        }
        let Some(file_name) = source.file_name() else {
            continue;
        };

        let dest = match copy_into(source, target_dir, file_name) {
            Ok(dest) => dest,
            Err(err) => {
                issues::record(
                    &mut outcome.issues,
                    TrayDependencyIssue::error(
                        IssueKind::CopyFailed,
                        format!("failed to copy into {}: {err}", target_dir.display()),
                    )
                    .with_file(source),
                );
                outcome.aborted = true;
                break;
            }
        };
        tracing::debug!(from = %source.display(), to = %dest.display(), "copied");
        on_copied(index + 1, sources.len(), &dest);
        outcome.copied.push(dest);
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn collisions_get_numbered_names() {
        let temp = TempDir::new().unwrap();
        let target = temp.path();
        fs::write(target.join("mod.package"), b"a").unwrap();
        fs::write(target.join("mod (2).package"), b"b").unwrap();
        let (taken, _) = create_unique_destination(target, OsStr::new("mod.package")).unwrap();
        assert_eq!(taken, target.join("mod (3).package"));
        let (fresh, _) = create_unique_destination(target, OsStr::new("other.package")).unwrap();
        assert_eq!(fresh, target.join("other.package"));
        assert_eq!(fs::read(target.join("mod.package")).unwrap(), b"a");
        assert_eq!(fs::read(target.join("mod (2).package")).unwrap(), b"b");
    }

    #[test]
    fn names_without_extension_are_numbered_too() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("README"), b"a").unwrap();
        let (taken, _) = create_unique_destination(temp.path(), OsStr::new("README")).unwrap();
        assert_eq!(taken, temp.path().join("README (2)"));
    }

    #[test]
    fn claimed_name_is_skipped_not_truncated() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("out");
        fs::create_dir_all(&target).unwrap();
        let (claimed, _held) =
            create_unique_destination(&target, OsStr::new("late.package")).unwrap();
        fs::write(&claimed, b"written by someone else").unwrap();

        let source = temp.path().join("late.package");
        fs::write(&source, b"ours").unwrap();
        let outcome =
            copy_files_unique(&[source], &target, &CancellationToken::new(), |_, _, _| {})
                .unwrap();

        assert_eq!(outcome.copied, vec![target.join("late (2).package")]);
        assert_eq!(fs::read(&claimed).unwrap(), b"written by someone else");
        assert_eq!(fs::read(target.join("late (2).package")).unwrap(), b"ours");
    }

    #[test]
    fn copy_never_overwrites() {
        let temp = TempDir::new().unwrap();
        let source_dir = temp.path().join("a");
        let other_dir = temp.path().join("b");
        let target = temp.path().join("out");
        fs::create_dir_all(&source_dir).unwrap();
        fs::create_dir_all(&other_dir).unwrap();
        fs::write(source_dir.join("same.package"), b"first").unwrap();
        fs::write(other_dir.join("same.package"), b"second").unwrap();

        let outcome = copy_files_unique(
            &[source_dir.join("same.package"), other_dir.join("same.package")],
            &target,
            &CancellationToken::new(),
            |_, _, _| {},
        )
        .unwrap();

        assert_eq!(outcome.copied.len(), 2);
        assert!(outcome.issues.is_empty());
        assert_eq!(fs::read(target.join("same.package")).unwrap(), b"first");
        assert_eq!(fs::read(target.join("same (2).package")).unwrap(), b"second");
    }

    #[test]
    fn missing_source_is_a_warning_and_copy_continues() {
        let temp = TempDir::new().unwrap();
        let present = temp.path().join("present.package");
        fs::write(&present, b"x").unwrap();
        let target = temp.path().join("out");

        let outcome = copy_files_unique(
            &[temp.path().join("missing.package"), present],
            &target,
            &CancellationToken::new(),
            |_, _, _| {},
        )
        .unwrap();

        assert_eq!(outcome.copied.len(), 1);
        assert!(!outcome.aborted);
        assert_eq!(outcome.issues.len(), 1);
        assert_eq!(outcome.issues[0].kind, IssueKind::MissingSourceFile);
        assert!(!outcome.issues[0].is_error());
    }

    #[test]
    fn unusable_target_is_an_error() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("blocker");
        fs::write(&blocker, b"file, not dir").unwrap();
        let source = temp.path().join("a.package");
        fs::write(&source, b"x").unwrap();

        let outcome = copy_files_unique(
            &[source],
            &blocker.join("out"),
            &CancellationToken::new(),
            |_, _, _| {},
        )
        .unwrap();
        assert!(outcome.aborted);
        assert!(outcome.copied.is_empty());
        assert_eq!(outcome.issues[0].kind, IssueKind::CopyFailed);
        assert!(outcome.issues[0].is_error());
    }

    #[test]
    fn copies_keep_source_mtime() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("old.package");
        fs::write(&source, b"x").unwrap();
        set_file_mtime(&source, FileTime::from_unix_time(1_500_000_000, 0)).unwrap();

        let outcome = copy_files_unique(
            &[source],
            &temp.path().join("out"),
            &CancellationToken::new(),
            |_, _, _| {},
        )
        .unwrap();
        let meta = fs::metadata(&outcome.copied[0]).unwrap();
        assert_eq!(
            FileTime::from_last_modification_time(&meta).unix_seconds(),
            1_500_000_000
        );
    }

    #[test]
    fn cancellation_stops_the_batch() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("a.package");
        fs::write(&source, b"x").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = copy_files_unique(&[source], &temp.path().join("out"), &cancel, |_, _, _| {});
        assert!(result.is_err());
    }
}
