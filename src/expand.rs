use crate::{
    dbpf::{self, IndexedPackageFile, PackageIndexEntry, TrayResourceKey},
    index_cache::PackageIndexSnapshot,
    matcher::ResolvedResourceRef,
    resource_types::{self, STRUCTURED_REFERENCE_TYPES},
    scanner,
    task::{CancellationToken, Cancelled},
};
use std::{collections::HashSet, path::Path, sync::Arc};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StructuredReferences {
    pub keys: Vec<TrayResourceKey>,
    /// Bare instances with the types they should be looked up under.
    pub instances: Vec<(u64, &'static [u32])>,
}

impl StructuredReferences {
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.instances.is_empty()
    }
}

/// Full keys embedded on 4-byte boundaries. Used for CAS parts, object
/// definitions and as the first attempt for every other type.
pub fn read_structured_keys(bytes: &[u8]) -> StructuredReferences {
    StructuredReferences {
        keys: scanner::scan_aligned_keys(bytes, STRUCTURED_REFERENCE_TYPES)
            .into_iter()
            .collect(),
        instances: Vec::new(),
    }
}

pub fn read_skin_tone_references(bytes: &[u8]) -> StructuredReferences {
    let mut instances = Vec::new();
    for id in scanner::scan_aligned_ids(bytes, 8) {
        instances.push((id, resource_types::SKIN_TONE_OVERLAY_TYPES));
        instances.push((id, resource_types::SKIN_TONE_MATERIAL_TYPES));
        instances.push((id, resource_types::SKIN_TONE_BUMP_MAP_TYPES));
    }
    StructuredReferences {
        keys: Vec::new(),
        instances,
    }
}

pub fn read_generic_references(bytes: &[u8]) -> StructuredReferences {
    let hits = scanner::scan_references(bytes, STRUCTURED_REFERENCE_TYPES);
    StructuredReferences {
        keys: hits.keys.into_iter().collect(),
        instances: hits
            .ids
            .into_iter()
            .map(|id| (id, STRUCTURED_REFERENCE_TYPES))
            .collect(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExpansionOutcome {
    pub dependencies: Vec<Arc<ResolvedResourceRef>>,
    pub resources_read: usize,
    pub read_failures: usize,
}

pub fn expand_dependencies(
    direct: &[Arc<ResolvedResourceRef>],
    snapshot: &PackageIndexSnapshot,
    cancel: &CancellationToken,
    mut on_progress: impl FnMut(usize, usize),
) -> Result<ExpansionOutcome, Cancelled> {
    let mut expander = Expander {
        snapshot,
        seen: direct.iter().map(|resolved| resolved.key).collect(),
        outcome: ExpansionOutcome::default(),
    };

    for (index, root) in direct.iter().enumerate() {
        cancel.check()?;
        on_progress(index, direct.len());
        expander.expand_root(root);
    }
    on_progress(direct.len(), direct.len());

    tracing::info!(
        dependencies = expander.outcome.dependencies.len(),
        read = expander.outcome.resources_read,
        failed = expander.outcome.read_failures,
        "dependency expansion finished"
    );
    Ok(expander.outcome)
}

struct Expander<'a> {
    snapshot: &'a PackageIndexSnapshot,
    seen: HashSet<TrayResourceKey>,
    outcome: ExpansionOutcome,
}

impl Expander<'_> {
    fn expand_root(&mut self, root: &Arc<ResolvedResourceRef>) {
        let Some(entry) = &root.entry else {
            return;
        };
        let Some(bytes) = self.read_bytes(&root.file_path, entry) else {
            return;
        };

        match root.key.resource_type {
            resource_types::CAS_PART | resource_types::OBJECT_DEFINITION => {
                self.resolve_all(root, read_structured_keys(&bytes));
            }
            resource_types::SKIN_TONE => {
                self.resolve_all(root, read_skin_tone_references(&bytes));
            }
            resource_types::OBJECT_CATALOG => {
                self.resolve_all(root, read_structured_keys(&bytes));
                self.expand_catalog_sibling(root);
            }
            _ => {
                let structured = read_structured_keys(&bytes);
                if structured.is_empty() {
                    self.resolve_all(root, read_generic_references(&bytes));
                } else {
                    self.resolve_all(root, structured);
                }
            }
        }
    }

    /// Catalog entries pair with an object definition sharing group and
    /// instance; the definition carries the model and material references.
    fn expand_catalog_sibling(&mut self, catalog: &Arc<ResolvedResourceRef>) {
        let sibling_key = TrayResourceKey::new(
            resource_types::OBJECT_DEFINITION,
            catalog.key.group,
            catalog.key.instance,
        );
        let snapshot = self.snapshot;
        let Some((package, entry)) = snapshot.resolve_exact(&sibling_key) else {
            return;
        };
        let sibling = match self.accept(catalog, package, entry) {
            Some(sibling) => sibling,
            None => Arc::new(ResolvedResourceRef::child_of(
                catalog,
                package.path.clone(),
                entry,
            )),
        };
        let Some(bytes) = self.read_bytes(&package.path, entry) else {
            return;
        };
        self.resolve_all(&sibling, read_structured_keys(&bytes));
    }

    fn resolve_all(&mut self, parent: &Arc<ResolvedResourceRef>, refs: StructuredReferences) {
        let snapshot = self.snapshot;
        for key in refs.keys {
            if let Some((package, entry)) = snapshot.resolve_exact(&key) {
                self.accept(parent, package, entry);
            }
        }
        for (instance, types) in refs.instances {
            for resource_type in types {
                if let Some((package, entry)) = snapshot.resolve_instance(*resource_type, instance)
                {
                    self.accept(parent, package, entry);
                }
            }
        }
    }

    fn accept(
        &mut self,
        parent: &Arc<ResolvedResourceRef>,
        package: &IndexedPackageFile,
        entry: &PackageIndexEntry,
    ) -> Option<Arc<ResolvedResourceRef>> {
        if !self.seen.insert(entry.key()) {
            return None;
        }
        let resolved = Arc::new(ResolvedResourceRef::child_of(
            parent,
            package.path.clone(),
            entry,
        ));
        self.outcome.dependencies.push(resolved.clone());
        Some(resolved)
    }

    fn read_bytes(&mut self, path: &Path, entry: &PackageIndexEntry) -> Option<Vec<u8>> {
        match dbpf::try_read_resource_bytes(path, entry) {
            Ok(bytes) => {
                self.outcome.resources_read += 1;
                Some(bytes)
            }
            Err(err) => {
                self.outcome.read_failures += 1;
                tracing::debug!(
                    path = %path.display(),
                    key = %entry.key(),
                    "skipping unreadable resource: {err}"
                );
                None
            }
        }
    }
}
