use crate::{
    dbpf::{PackageIndexEntry, TrayResourceKey},
    index_cache::{path_sort_key, PackageIndexSnapshot},
    issues::{self, IssueKind, TrayDependencyIssue},
    resource_types,
    scanner::TraySearchKeys,
    task::{CancellationToken, Cancelled},
};
use std::{
    collections::{BTreeMap, HashSet},
    path::PathBuf,
    sync::Arc,
};

/// A resolved dependency. `parent` links an expanded dependency back to the
/// direct match it was found through.
#[derive(Debug, Clone)]
pub struct ResolvedResourceRef {
    pub key: TrayResourceKey,
    pub file_path: PathBuf,
    pub entry: Option<PackageIndexEntry>,
    pub parent: Option<Arc<ResolvedResourceRef>>,
}

impl ResolvedResourceRef {
    pub fn direct(file_path: PathBuf, entry: &PackageIndexEntry) -> Self {
        Self {
            key: entry.key(),
            file_path,
            entry: Some(entry.clone()),
            parent: None,
        }
    }

    pub fn child_of(
        parent: &Arc<ResolvedResourceRef>,
        file_path: PathBuf,
        entry: &PackageIndexEntry,
    ) -> Self {
        Self {
            key: entry.key(),
            file_path,
            entry: Some(entry.clone()),
            parent: Some(parent.clone()),
        }
    }

    pub fn is_direct(&self) -> bool {
        self.parent.is_none()
    }

    /// Number of hops from the root reference.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self.parent.as_ref();
        while let Some(parent) = current {
            depth += 1;
            current = parent.parent.as_ref();
        }
        depth
    }
}

#[derive(Debug, Clone, Default)]
pub struct DirectMatchOutcome {
    /// Ordered by file path, then key.
    pub matches: Vec<Arc<ResolvedResourceRef>>,
    pub unmatched_ids: usize,
    pub unmatched_keys: usize,
    pub issues: Vec<TrayDependencyIssue>,
}

pub fn match_direct(
    keys: &TraySearchKeys,
    snapshot: &PackageIndexSnapshot,
    cancel: &CancellationToken,
) -> Result<DirectMatchOutcome, Cancelled> {
    let mut resolved: BTreeMap<TrayResourceKey, (PathBuf, PackageIndexEntry)> = BTreeMap::new();
    let mut matched_keys: HashSet<TrayResourceKey> = HashSet::new();
    let mut matched_ids: HashSet<u64> = HashSet::new();

    let mut accept = |path: &PathBuf, entry: &PackageIndexEntry| {
        let slot = resolved
            .entry(entry.key())
            .or_insert_with(|| (path.clone(), entry.clone()));
        if path_sort_key(path) < path_sort_key(&slot.0) {
            *slot = (path.clone(), entry.clone());
        }
    };

    cancel.check()?;
    for key in &keys.resource_keys {
        if let Some((package, entry)) = snapshot.resolve_exact(key) {
            matched_keys.insert(*key);
            accept(&package.path, entry);
        }
    }
    for resource_type in &keys.candidate_types {
        cancel.check()?;
        for id in &keys.candidate_ids {
            for (package, entry) in snapshot.instance_hits(*resource_type, *id) {
                matched_ids.insert(*id);
                accept(&package.path, entry);
            }
        }
    }
    let first_unmatched_key = keys
        .resource_keys
        .iter()
        .find(|key| !matched_keys.contains(*key))
        .copied();

    let mut matches: Vec<Arc<ResolvedResourceRef>> = resolved
        .into_values()
        .map(|(path, entry)| Arc::new(ResolvedResourceRef::direct(path, &entry)))
        .collect();
    matches.sort_by(|a, b| {
        path_sort_key(&a.file_path)
            .cmp(&path_sort_key(&b.file_path))
            .then_with(|| a.key.cmp(&b.key))
    });

    let mut outcome = DirectMatchOutcome {
        matches,
        unmatched_ids: keys.candidate_ids.len() - matched_ids.len(),
        unmatched_keys: keys.resource_keys.len() - matched_keys.len(),
        issues: Vec::new(),
    };

    if keys.is_empty() {
        issues::record(
            &mut outcome.issues,
            TrayDependencyIssue::warning(
                IssueKind::NoReferencesFound,
                "no resource references were found in the tray item",
            ),
        );
    } else if outcome.unmatched_ids + outcome.unmatched_keys > 0 {
        let mut message = format!(
            "{} of {} tray references did not resolve to an installed package",
            outcome.unmatched_ids + outcome.unmatched_keys,
            keys.signal_count()
        );
        if let Some(key) = first_unmatched_key {
            message.push_str(&format!(
                ", first missing: {}",
                resource_types::type_label(key.resource_type)
            ));
        }
        let mut issue = TrayDependencyIssue::warning(IssueKind::MissingReference, message);
        if let Some(key) = first_unmatched_key {
            issue = issue.with_key(key);
        }
        issues::record(&mut outcome.issues, issue);
    }

    tracing::info!(
        matches = outcome.matches.len(),
        unmatched = outcome.unmatched_ids + outcome.unmatched_keys,
        "direct matching finished"
    );
    Ok(outcome)
}
