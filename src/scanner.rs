use crate::{
    dbpf::{le_u32, le_u64, TrayResourceKey},
    issues::{self, IssueKind, TrayDependencyIssue},
    resource_types,
    task::{CancellationToken, Cancelled},
    tray::TrayFileBundle,
};
use std::{collections::BTreeSet, fs};

const MIN_RESOURCE_ID: u64 = 1024;
const MAX_MESSAGE_DEPTH: usize = 4;
const MAX_VARINT_LEN: usize = 10;
const KEY_WINDOW_LEN: usize = 16;

pub fn looks_like_resource_id(value: u64) -> bool {
    value > MIN_RESOURCE_ID && value != u64::MAX
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanHits {
    pub ids: BTreeSet<u64>,
    pub keys: BTreeSet<TrayResourceKey>,
}

impl ScanHits {
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.keys.is_empty()
    }
}

/// Every 4-byte-aligned 16-byte window read as little-endian type, group,
/// instance. Only whitelisted types with plausible instances are kept.
pub fn scan_aligned_keys(bytes: &[u8], allowed_types: &[u32]) -> BTreeSet<TrayResourceKey> {
    let mut keys = BTreeSet::new();
    let mut offset = 0usize;
    while offset + KEY_WINDOW_LEN <= bytes.len() {
        let resource_type = le_u32(bytes, offset);
        if allowed_types.contains(&resource_type) {
            let instance = le_u64(bytes, offset + 8);
            if looks_like_resource_id(instance) {
                keys.insert(TrayResourceKey::new(
                    resource_type,
                    le_u32(bytes, offset + 4),
                    instance,
                ));
            }
        }
        offset += 4;
    }
    keys
}

/// Every `stride`-aligned little-endian u64 that could be an instance.
pub fn scan_aligned_ids(bytes: &[u8], stride: usize) -> BTreeSet<u64> {
    let stride = stride.max(1);
    let mut ids = BTreeSet::new();
    let mut offset = 0usize;
    while offset + 8 <= bytes.len() {
        let value = le_u64(bytes, offset);
        if looks_like_resource_id(value) {
            ids.insert(value);
        }
        offset += stride;
    }
    ids
}

/// Walks protobuf-style framing. Returns `None` when the top level does not
/// parse cleanly; nested length-delimited fields that fail to parse are
/// treated as opaque bytes.
pub fn walk_message_ids(bytes: &[u8]) -> Option<BTreeSet<u64>> {
    let mut found = Vec::new();
    if !walk_message(bytes, 0, &mut found) {
        return None;
    }
    Some(found.into_iter().collect())
}

fn walk_message(bytes: &[u8], depth: usize, out: &mut Vec<u64>) -> bool {
    let mut pos = 0usize;
    while pos < bytes.len() {
        let Some((key, used)) = read_varint(&bytes[pos..]) else {
            return false;
        };
        pos += used;
        if key >> 3 == 0 {
            return false;
        }
        match key & 0x7 {
            0 => {
                let Some((value, used)) = read_varint(&bytes[pos..]) else {
                    return false;
                };
                pos += used;
                if looks_like_resource_id(value) {
                    out.push(value);
                }
            }
            1 => {
                if pos + 8 > bytes.len() {
                    return false;
                }
                let value = le_u64(bytes, pos);
                pos += 8;
                if looks_like_resource_id(value) {
                    out.push(value);
                }
            }
            2 => {
                let Some((len, used)) = read_varint(&bytes[pos..]) else {
                    return false;
                };
                pos += used;
                let Some(end) = usize::try_from(len)
                    .ok()
                    .and_then(|len| pos.checked_add(len))
                else {
                    return false;
                };
                if end > bytes.len() {
                    return false;
                }
                let body = &bytes[pos..end];
                if depth < MAX_MESSAGE_DEPTH && !body.is_empty() {
                    let mut nested = Vec::new();
                    if walk_message(body, depth + 1, &mut nested) {
                        out.extend(nested);
                    }
                }
                pos = end;
            }
            5 => {
                if pos + 4 > bytes.len() {
                    return false;
                }
                pos += 4;
            }
            _ => return false,
        }
    }
    true
}

fn read_varint(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (index, byte) in bytes.iter().take(MAX_VARINT_LEN).enumerate() {
        let low = u64::from(byte & 0x7F);
        if index == MAX_VARINT_LEN - 1 && low > 1 {
            return None;
        }
        value |= low << (7 * index);
        if byte & 0x80 == 0 {
            return Some((value, index + 1));
        }
    }
    None
}

pub fn scan_references(bytes: &[u8], key_types: &[u32]) -> ScanHits {
    let keys = scan_aligned_keys(bytes, key_types);
    let mut ids = walk_message_ids(bytes).unwrap_or_default();
    if keys.is_empty() && ids.is_empty() {
        ids = scan_aligned_ids(bytes, 4);
    }
    ScanHits { ids, keys }
}

/// Everything pulled out of one tray bundle. Candidate ids are not split by
/// role: bytes alone cannot say whether an id is a CAS part or a trait, so
/// they are looked up under the union of `candidate_types`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraySearchKeys {
    pub candidate_ids: BTreeSet<u64>,
    pub resource_keys: BTreeSet<TrayResourceKey>,
    pub candidate_types: BTreeSet<u32>,
}

impl TraySearchKeys {
    pub fn signal_count(&self) -> usize {
        self.candidate_ids.len() + self.resource_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signal_count() == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct TraySearchExtraction {
    pub keys: TraySearchKeys,
    pub issues: Vec<TrayDependencyIssue>,
    pub files_read: usize,
}

pub fn extract_search_keys(
    bundle: &TrayFileBundle,
    cancel: &CancellationToken,
) -> Result<TraySearchExtraction, Cancelled> {
    let mut extraction = TraySearchExtraction::default();
    for file in &bundle.files {
        cancel.check()?;
        let bytes = match fs::read(&file.path) {
            Ok(bytes) => bytes,
            Err(err) => {
                issues::record(
                    &mut extraction.issues,
                    TrayDependencyIssue::error(
                        IssueKind::TrayParseFailed,
                        format!("failed to read {}: {err}", file.role.label()),
                    )
                    .with_file(&file.path),
                );
                continue;
            }
        };
        extraction.files_read += 1;

        let hits = scan_references(&bytes, resource_types::TRAY_KEY_TYPES);
        tracing::debug!(
            path = %file.path.display(),
            ids = hits.ids.len(),
            keys = hits.keys.len(),
            "scanned tray file"
        );
        extraction.keys.candidate_ids.extend(hits.ids);
        extraction.keys.resource_keys.extend(hits.keys);
    }
    let types = &mut extraction.keys.candidate_types;
    if bundle.has_household_context() {
        types.extend(resource_types::HOUSEHOLD_CANDIDATE_TYPES.iter().copied());
    }
    if bundle.has_build_context() {
        types.extend(resource_types::BUILD_CANDIDATE_TYPES.iter().copied());
    }
    Ok(extraction)
}
