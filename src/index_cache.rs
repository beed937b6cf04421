use crate::{
    dbpf::{self, IndexedPackageFile, PackageIndexEntry, TrayResourceKey},
    resource_types,
    task::{CancellationToken, Cancelled, TaskHandle},
};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::{SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use walkdir::WalkDir;

/// Receives `(files_done, files_total)` while a root is scanned.
pub type IndexProgressFn<'a> = dyn Fn(usize, usize) + Send + Sync + 'a;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageParseFailure {
    pub path: PathBuf,
    pub message: String,
}

/// `(package, entry)` positions of every live entry sharing a type and
/// instance. Packages appear in path order.
type EntryLocations = HashMap<(u32, u64), Vec<(usize, usize)>>;

#[derive(Debug)]
pub struct PackageIndexSnapshot {
    root: PathBuf,
    packages: Vec<Arc<IndexedPackageFile>>,
    failures: Vec<Arc<PackageParseFailure>>,
    locations: EntryLocations,
}

impl PackageIndexSnapshot {
    pub fn new(root: PathBuf, mut packages: Vec<Arc<IndexedPackageFile>>) -> Self {
        packages.sort_by_cached_key(|package| path_sort_key(&package.path));
        let mut locations: EntryLocations = HashMap::new();
        for (package_index, package) in packages.iter().enumerate() {
            for (resource_type, type_index) in &package.type_indexes {
                for (instance, entry_indexes) in &type_index.instance_to_entry_indexes {
                    locations
                        .entry((*resource_type, *instance))
                        .or_default()
                        .extend(entry_indexes.iter().map(|entry| (package_index, *entry)));
                }
            }
        }
        Self {
            root,
            packages,
            failures: Vec::new(),
            locations,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn packages(&self) -> &[Arc<IndexedPackageFile>] {
        &self.packages
    }

    pub fn failures(&self) -> &[Arc<PackageParseFailure>] {
        &self.failures
    }

    pub fn package_count(&self) -> usize {
        self.packages.len()
    }

    pub fn resource_count(&self) -> usize {
        self.packages
            .iter()
            .map(|package| package.live_entry_count())
            .sum()
    }

    pub fn find_package(&self, path: &Path) -> Option<&Arc<IndexedPackageFile>> {
        let wanted = path_sort_key(path);
        let start = self
            .packages
            .partition_point(|package| path_sort_key(&package.path) < wanted);
        self.packages[start..]
            .iter()
            .take_while(|package| path_sort_key(&package.path) == wanted)
            .find(|package| package.path == path)
    }

    fn located(
        &self,
        resource_type: u32,
        instance: u64,
    ) -> impl Iterator<Item = (&Arc<IndexedPackageFile>, &PackageIndexEntry)> + '_ {
        self.locations
            .get(&(resource_type, instance))
            .map(Vec::as_slice)
            .unwrap_or(&[])
            .iter()
            .filter_map(|&(package_index, entry_index)| {
                let package = self.packages.get(package_index)?;
                let entry = package.entries.get(entry_index)?;
                Some((package, entry))
            })
    }

    /// First package (by path) holding a live entry with exactly this key.
    pub fn resolve_exact(
        &self,
        key: &TrayResourceKey,
    ) -> Option<(&Arc<IndexedPackageFile>, &PackageIndexEntry)> {
        self.located(key.resource_type, key.instance)
            .find(|(_, entry)| entry.group == key.group)
    }

    /// One hit per package holding `instance` under `resource_type`, in path
    /// order. Within a package the lowest eligible group wins.
    pub fn instance_hits(
        &self,
        resource_type: u32,
        instance: u64,
    ) -> Vec<(&Arc<IndexedPackageFile>, &PackageIndexEntry)> {
        let mut hits: Vec<(&Arc<IndexedPackageFile>, &PackageIndexEntry)> = Vec::new();
        for (package, entry) in self.located(resource_type, instance) {
            if !resource_types::is_group_eligible(resource_type, entry.group) {
                continue;
            }
            match hits.last_mut() {
                Some(last) if Arc::ptr_eq(last.0, package) => {
                    if entry.group < last.1.group {
                        last.1 = entry;
                    }
                }
                _ => hits.push((package, entry)),
            }
        }
        hits
    }

    pub fn resolve_instance(
        &self,
        resource_type: u32,
        instance: u64,
    ) -> Option<(&Arc<IndexedPackageFile>, &PackageIndexEntry)> {
        self.instance_hits(resource_type, instance).into_iter().next()
    }
}

pub(crate) fn path_sort_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("mods root {0:?} is not a directory")]
    MissingRoot(PathBuf),
    #[error("failed to enumerate {path:?}: {message}")]
    Enumerate { path: PathBuf, message: String },
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

pub trait PackageIndexProvider: Send + Sync {
    fn snapshot(
        &self,
        mods_root: &Path,
        progress: Option<&IndexProgressFn<'_>>,
        cancel: &CancellationToken,
    ) -> Result<Arc<PackageIndexSnapshot>, IndexError>;
}

#[derive(Debug, Clone)]
enum CachedParse {
    Parsed(Arc<IndexedPackageFile>),
    Failed(Arc<PackageParseFailure>),
}

#[derive(Debug, Clone)]
struct CachedPackage {
    length: u64,
    modified: SystemTime,
    parse: CachedParse,
}

#[derive(Debug, Clone)]
struct RootCache {
    snapshot: Arc<PackageIndexSnapshot>,
    records: Arc<HashMap<PathBuf, CachedPackage>>,
}

#[derive(Debug, Default)]
pub struct PackageIndexCache {
    roots: Mutex<HashMap<PathBuf, RootCache>>,
}

impl PackageIndexCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_snapshot(
        &self,
        mods_root: &Path,
        progress: Option<&IndexProgressFn<'_>>,
        cancel: &CancellationToken,
    ) -> Result<Arc<PackageIndexSnapshot>, IndexError> {
        if !mods_root.is_dir() {
            return Err(IndexError::MissingRoot(mods_root.to_path_buf()));
        }
        let root = normalize_root(mods_root);
        let previous = self.lock_roots().get(&root).cloned();

        let files = enumerate_packages(&root)?;
        let total = files.len();
        let mut records = HashMap::with_capacity(total);
        let mut reused = 0usize;

        for (index, path) in files.into_iter().enumerate() {
            cancel.check()?;
            if let Some(progress) = progress {
                progress(index + 1, total);
            }

            let (length, modified) = match fs::metadata(&path) {
                Ok(meta) => (meta.len(), meta.modified().unwrap_or(UNIX_EPOCH)),
                Err(err) => {
                    tracing::debug!(path = %path.display(), "stat failed: {err}");
                    continue;
                }
            };

            let cached = previous
                .as_ref()
                .and_then(|previous| previous.records.get(&path))
                .filter(|record| record.length == length && record.modified == modified);
            let record = match cached {
                Some(record) => {
                    reused += 1;
                    record.clone()
                }
                None => CachedPackage {
                    length,
                    modified,
                    parse: parse_package(&path),
                },
            };
            records.insert(path, record);
        }

        if let Some(previous) = &previous {
            if reused == records.len() && previous.records.len() == records.len() {
                tracing::debug!(root = %root.display(), "package index unchanged");
                return Ok(previous.snapshot.clone());
            }
        }

        let snapshot = Arc::new(build_snapshot(root.clone(), &records));
        tracing::info!(
            root = %root.display(),
            packages = snapshot.package_count(),
            failures = snapshot.failures().len(),
            reparsed = records.len() - reused,
            "package index refreshed"
        );
        let fresh = RootCache {
            snapshot: snapshot.clone(),
            records: Arc::new(records),
        };
        if !self.store_if_current(root, previous.as_ref(), fresh) {
            tracing::debug!("a newer scan finished first, keeping its snapshot");
        }
        Ok(snapshot)
    }

    /// Stores `fresh` only when the root still holds the snapshot this scan
    /// started from.
    fn store_if_current(
        &self,
        root: PathBuf,
        previous: Option<&RootCache>,
        fresh: RootCache,
    ) -> bool {
        let mut roots = self.lock_roots();
        let current = roots.get(&root).map(|cached| &cached.snapshot);
        let unchanged = match (current, previous) {
            (None, None) => true,
            (Some(current), Some(previous)) => Arc::ptr_eq(current, &previous.snapshot),
            _ => false,
        };
        if unchanged {
            roots.insert(root, fresh);
        }
        unchanged
    }

    pub fn get_snapshot_async(
        self: &Arc<Self>,
        mods_root: PathBuf,
        cancel: CancellationToken,
    ) -> TaskHandle<Result<Arc<PackageIndexSnapshot>, IndexError>> {
        let cache = Arc::clone(self);
        TaskHandle::spawn(move || cache.get_snapshot(&mods_root, None, &cancel))
    }

    fn lock_roots(&self) -> MutexGuard<'_, HashMap<PathBuf, RootCache>> {
        self.roots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PackageIndexProvider for PackageIndexCache {
    fn snapshot(
        &self,
        mods_root: &Path,
        progress: Option<&IndexProgressFn<'_>>,
        cancel: &CancellationToken,
    ) -> Result<Arc<PackageIndexSnapshot>, IndexError> {
        self.get_snapshot(mods_root, progress, cancel)
    }
}

fn parse_package(path: &Path) -> CachedParse {
    match dbpf::read_package(path) {
        Ok(package) => {
            tracing::debug!(
                path = %path.display(),
                entries = package.entries.len(),
                "parsed package"
            );
            CachedParse::Parsed(Arc::new(package))
        }
        Err(err) => {
            tracing::debug!(path = %path.display(), "package parse failed: {err}");
            CachedParse::Failed(Arc::new(PackageParseFailure {
                path: path.to_path_buf(),
                message: err.to_string(),
            }))
        }
    }
}

fn build_snapshot(root: PathBuf, records: &HashMap<PathBuf, CachedPackage>) -> PackageIndexSnapshot {
    let mut packages = Vec::new();
    let mut failures = Vec::new();
    for record in records.values() {
        match &record.parse {
            CachedParse::Parsed(package) => packages.push(package.clone()),
            CachedParse::Failed(failure) => failures.push(failure.clone()),
        }
    }
    failures.sort_by_cached_key(|failure| path_sort_key(&failure.path));
    let mut snapshot = PackageIndexSnapshot::new(root, packages);
    snapshot.failures = failures;
    snapshot
}

fn enumerate_packages(root: &Path) -> Result<Vec<PathBuf>, IndexError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.depth() == 0 => {
                return Err(IndexError::Enumerate {
                    path: root.to_path_buf(),
                    message: err.to_string(),
                })
            }
            Err(_) => continue,
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let is_package = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("package"))
            == Some(true);
        if is_package {
            files.push(entry.into_path());
        }
    }
    files.sort_by_cached_key(|path| path_sort_key(path));
    Ok(files)
}

fn normalize_root(root: &Path) -> PathBuf {
    fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf())
}
