use flate2::read::ZlibDecoder;
use serde::Serialize;
use std::{
    collections::HashMap,
    fmt, fs,
    io::{self, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use thiserror::Error;

pub const HEADER_LEN: usize = 96;
pub const MAGIC: &[u8; 4] = b"DBPF";

pub const LOGICAL_RECORD_LEN: usize = 32;

pub const COMPRESSION_NONE: u16 = 0x0000;
pub const COMPRESSION_ZLIB: u16 = 0x5A42;
pub const COMPRESSION_DELETED: u16 = 0xFFE0;

const HEADER_ENTRY_COUNT: usize = 36;
const HEADER_INDEX_POSITION_LEGACY: usize = 40;
const HEADER_INDEX_SIZE: usize = 44;
const HEADER_INDEX_POSITION: usize = 64;

const FLAG_CONSTANT_TYPE: u32 = 0x1;
const FLAG_CONSTANT_GROUP: u32 = 0x2;
const FLAG_CONSTANT_INSTANCE_HIGH: u32 = 0x4;
const CONSTANT_FLAGS: [u32; 3] = [
    FLAG_CONSTANT_TYPE,
    FLAG_CONSTANT_GROUP,
    FLAG_CONSTANT_INSTANCE_HIGH,
];

const SIZE_MASK: u32 = 0x7FFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TrayResourceKey {
    pub resource_type: u32,
    pub group: u32,
    pub instance: u64,
}

impl TrayResourceKey {
    pub fn new(resource_type: u32, group: u32, instance: u64) -> Self {
        Self {
            resource_type,
            group,
            instance,
        }
    }
}

impl fmt::Display for TrayResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08X}:{:08X}:{:016X}",
            self.resource_type, self.group, self.instance
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageIndexEntry {
    pub resource_type: u32,
    pub group: u32,
    pub instance: u64,
    pub is_deleted: bool,
    pub offset: u64,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub compression: u16,
}

impl PackageIndexEntry {
    pub fn key(&self) -> TrayResourceKey {
        TrayResourceKey::new(self.resource_type, self.group, self.instance)
    }
}

/// Instance lookup for one resource type. Several entries may share an
/// instance when they live in different groups.
#[derive(Debug, Clone, Default)]
pub struct PackageTypeIndex {
    pub instance_to_entry_indexes: HashMap<u64, Vec<usize>>,
}

#[derive(Debug)]
pub struct IndexedPackageFile {
    pub path: PathBuf,
    pub length: u64,
    pub last_write_time: SystemTime,
    pub entries: Vec<PackageIndexEntry>,
    pub type_indexes: HashMap<u32, PackageTypeIndex>,
}

impl IndexedPackageFile {
    fn new(
        path: PathBuf,
        length: u64,
        last_write_time: SystemTime,
        entries: Vec<PackageIndexEntry>,
    ) -> Self {
        let mut type_indexes: HashMap<u32, PackageTypeIndex> = HashMap::new();
        for (index, entry) in entries.iter().enumerate() {
            if entry.is_deleted {
                continue;
            }
            type_indexes
                .entry(entry.resource_type)
                .or_default()
                .instance_to_entry_indexes
                .entry(entry.instance)
                .or_default()
                .push(index);
        }
        Self {
            path,
            length,
            last_write_time,
            entries,
            type_indexes,
        }
    }

    pub fn live_entry_count(&self) -> usize {
        self.entries.iter().filter(|entry| !entry.is_deleted).count()
    }
}

#[derive(Debug, Error)]
pub enum DbpfError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("not a DBPF package (magic {0:02X?})")]
    InvalidMagic([u8; 4]),
    #[error("truncated {0}")]
    Truncated(&'static str),
    #[error("index position {position} is outside the file ({length} bytes)")]
    IndexOutOfBounds { position: u64, length: u64 },
    #[error(
        "index size {declared_size} cannot be reconciled with {entry_count} entries (flags {flags:#x})"
    )]
    UnsupportedIndexLayout {
        entry_count: usize,
        declared_size: u64,
        flags: u32,
    },
    #[error("resource at {offset} (+{size}) is outside the file ({length} bytes)")]
    ResourceOutOfBounds { offset: u64, size: u64, length: u64 },
    #[error("resource is marked deleted")]
    Deleted,
    #[error("unsupported compression {0:#06x}")]
    UnsupportedCompression(u16),
    #[error("invalid zlib header {0:#04x} {1:#04x}")]
    InvalidZlibHeader(u8, u8),
    #[error("inflated size does not match the declared {declared} bytes (got {actual})")]
    SizeMismatch { declared: usize, actual: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IndexLayout {
    record_len: usize,
    uses_template: bool,
}

pub fn read_package(path: &Path) -> Result<IndexedPackageFile, DbpfError> {
    let mut file = fs::File::open(path)?;
    let meta = file.metadata()?;
    let length = meta.len();
    let last_write_time = meta.modified().unwrap_or(UNIX_EPOCH);

    let mut header = [0u8; HEADER_LEN];
    read_exact_or(&mut file, &mut header, "header")?;
    if &header[0..4] != MAGIC {
        return Err(DbpfError::InvalidMagic([
            header[0], header[1], header[2], header[3],
        ]));
    }

    let entry_count = le_u32(&header, HEADER_ENTRY_COUNT) as usize;
    let declared_size = u64::from(le_u32(&header, HEADER_INDEX_SIZE));
    let position = match le_u64(&header, HEADER_INDEX_POSITION) {
        0 => u64::from(le_u32(&header, HEADER_INDEX_POSITION_LEGACY)),
        position => position,
    };

    if entry_count == 0 {
        return Ok(IndexedPackageFile::new(
            path.to_path_buf(),
            length,
            last_write_time,
            Vec::new(),
        ));
    }
    if position < HEADER_LEN as u64 || position >= length {
        return Err(DbpfError::IndexOutOfBounds { position, length });
    }

    file.seek(SeekFrom::Start(position))?;
    let flags = read_u32(&mut file, "index flags")?;
    let mut template = [0u32; 3];
    let mut constant_count = 0usize;
    for (slot, flag) in CONSTANT_FLAGS.iter().enumerate() {
        if flags & flag != 0 {
            template[slot] = read_u32(&mut file, "index template")?;
            constant_count += 1;
        }
    }

    let prefix_len = 4 + 4 * constant_count as u64;
    let available = (length - position).saturating_sub(prefix_len);
    let layout = resolve_index_layout(entry_count, declared_size, constant_count, available)
        .ok_or(DbpfError::UnsupportedIndexLayout {
            entry_count,
            declared_size,
            flags,
        })?;

    let mut block = vec![0u8; entry_count * layout.record_len];
    read_exact_or(&mut file, &mut block, "index")?;

    let entries = block
        .chunks_exact(layout.record_len)
        .map(|record| {
            let mut words = [0u32; 8];
            let mut cursor = 0usize;
            for (slot, word) in words.iter_mut().enumerate() {
                if layout.uses_template && slot < 3 && flags & CONSTANT_FLAGS[slot] != 0 {
                    *word = template[slot];
                    continue;
                }
                *word = le_u32(record, cursor);
                cursor += 4;
            }
            decode_record(&words)
        })
        .collect();

    Ok(IndexedPackageFile::new(
        path.to_path_buf(),
        length,
        last_write_time,
        entries,
    ))
}

/// Writers disagree on what the header's index size means. Accept the
/// variable byte total (with or without the flags/template prefix), a
/// literal per-entry width, or full 32-byte records that ignore the
/// constant template.
fn resolve_index_layout(
    entry_count: usize,
    declared_size: u64,
    constant_count: usize,
    available: u64,
) -> Option<IndexLayout> {
    let count = entry_count as u64;
    let prefix_len = 4 + 4 * constant_count as u64;
    let variable_len = LOGICAL_RECORD_LEN - 4 * constant_count;
    let variable_total = count.checked_mul(variable_len as u64)?;
    let full_total = count.checked_mul(LOGICAL_RECORD_LEN as u64)?;

    let compact = IndexLayout {
        record_len: variable_len,
        uses_template: true,
    };
    let legacy = IndexLayout {
        record_len: LOGICAL_RECORD_LEN,
        uses_template: false,
    };

    if (declared_size == variable_total || declared_size == variable_total + prefix_len)
        && variable_total <= available
    {
        return Some(compact);
    }
    if declared_size == variable_len as u64 && variable_total <= available {
        return Some(compact);
    }
    if (declared_size == LOGICAL_RECORD_LEN as u64
        || declared_size == full_total
        || declared_size == full_total + prefix_len)
        && full_total <= available
    {
        return Some(legacy);
    }
    None
}

fn decode_record(words: &[u32; 8]) -> PackageIndexEntry {
    let compression = (words[7] & 0xFFFF) as u16;
    PackageIndexEntry {
        resource_type: words[0],
        group: words[1],
        instance: (u64::from(words[2]) << 32) | u64::from(words[3]),
        is_deleted: compression == COMPRESSION_DELETED,
        offset: u64::from(words[4]),
        compressed_size: words[5] & SIZE_MASK,
        uncompressed_size: words[6],
        compression,
    }
}

pub fn try_read_resource_bytes(
    path: &Path,
    entry: &PackageIndexEntry,
) -> Result<Vec<u8>, DbpfError> {
    if entry.is_deleted {
        return Err(DbpfError::Deleted);
    }
    if entry.compression != COMPRESSION_NONE && entry.compression != COMPRESSION_ZLIB {
        return Err(DbpfError::UnsupportedCompression(entry.compression));
    }

    let mut file = fs::File::open(path)?;
    let length = file.metadata()?.len();
    let size = u64::from(entry.compressed_size);
    if entry.offset.saturating_add(size) > length {
        return Err(DbpfError::ResourceOutOfBounds {
            offset: entry.offset,
            size,
            length,
        });
    }

    file.seek(SeekFrom::Start(entry.offset))?;
    let mut stored = vec![0u8; entry.compressed_size as usize];
    read_exact_or(&mut file, &mut stored, "resource")?;

    if entry.compression == COMPRESSION_NONE {
        return Ok(stored);
    }
    inflate_zlib(&stored, entry.uncompressed_size as usize)
}

fn inflate_zlib(stored: &[u8], expected_len: usize) -> Result<Vec<u8>, DbpfError> {
    let (cmf, flg) = match stored {
        [cmf, flg, ..] => (*cmf, *flg),
        _ => return Err(DbpfError::Truncated("zlib header")),
    };
    if cmf & 0x0F != 8 || (u16::from(cmf) * 256 + u16::from(flg)) % 31 != 0 {
        return Err(DbpfError::InvalidZlibHeader(cmf, flg));
    }
    // Read one byte past the declared size so an oversized stream is caught
    // without inflating the rest of it.
    let limit = expected_len as u64 + 1;
    let mut out = Vec::with_capacity(expected_len.min(stored.len().saturating_mul(8)));
    ZlibDecoder::new(stored).take(limit).read_to_end(&mut out)?;
    if out.len() != expected_len {
        return Err(DbpfError::SizeMismatch {
            declared: expected_len,
            actual: out.len(),
        });
    }
    Ok(out)
}

fn read_exact_or(
    file: &mut fs::File,
    buf: &mut [u8],
    what: &'static str,
) -> Result<(), DbpfError> {
    file.read_exact(buf).map_err(|err| match err.kind() {
        io::ErrorKind::UnexpectedEof => DbpfError::Truncated(what),
        _ => DbpfError::Io(err),
    })
}

fn read_u32(file: &mut fs::File, what: &'static str) -> Result<u32, DbpfError> {
    let mut bytes = [0u8; 4];
    read_exact_or(file, &mut bytes, what)?;
    Ok(u32::from_le_bytes(bytes))
}

pub(crate) fn le_u32(bytes: &[u8], offset: usize) -> u32 {
    bytes
        .get(offset..offset + 4)
        .and_then(|slice| slice.try_into().ok())
        .map(u32::from_le_bytes)
        .unwrap_or(0)
}

pub(crate) fn le_u64(bytes: &[u8], offset: usize) -> u64 {
    bytes
        .get(offset..offset + 8)
        .and_then(|slice| slice.try_into().ok())
        .map(u64::from_le_bytes)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{IndexSizeMode, PackageBuilder};
    use tempfile::TempDir;

    const CAS: u32 = 0x034A_EECB;
    const IMAGE: u32 = 0x3453_CF95;

    #[test]
    fn multi_entry_type_index_keeps_both_entries() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("multi.package");
        PackageBuilder::new()
            .resource(TrayResourceKey::new(CAS, 0, 0x1111_0000_0000_0001), b"a")
            .resource(TrayResourceKey::new(CAS, 7, 0x2222_0000_0000_0002), b"b")
            .write_to(&path);

        let package = read_package(&path).unwrap();
        assert_eq!(package.entries.len(), 2);
        let index = &package.type_indexes[&CAS].instance_to_entry_indexes;
        assert_eq!(index.len(), 2);
        assert_eq!(index[&0x1111_0000_0000_0001u64], vec![0]);
        assert_eq!(index[&0x2222_0000_0000_0002u64], vec![1]);
    }

    #[test]
    fn same_instance_in_two_groups_shares_one_slot() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("groups.package");
        PackageBuilder::new()
            .resource(TrayResourceKey::new(CAS, 9, 0xABCD_0000), b"a")
            .resource(TrayResourceKey::new(CAS, 3, 0xABCD_0000), b"b")
            .write_to(&path);

        let package = read_package(&path).unwrap();
        let slot = &package.type_indexes[&CAS].instance_to_entry_indexes[&0xABCD_0000u64];
        let groups: Vec<u32> = slot.iter().map(|index| package.entries[*index].group).collect();
        assert_eq!(groups, vec![9, 3]);
    }

    #[test]
    fn per_entry_width_in_size_field_still_parses() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("width.package");
        PackageBuilder::new()
            .resource(TrayResourceKey::new(CAS, 0, 0x5000), b"one")
            .resource(TrayResourceKey::new(CAS, 0, 0x6000), b"two")
            .resource(TrayResourceKey::new(IMAGE, 0, 0x7000), b"three")
            .size_mode(IndexSizeMode::Raw(32))
            .write_to(&path);

        let package = read_package(&path).unwrap();
        assert_eq!(package.entries.len(), 3);
        assert_eq!(package.entries[2].instance, 0x7000);
    }

    #[test]
    fn constant_template_fields_are_reassembled() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("template.package");
        PackageBuilder::new()
            .resource(TrayResourceKey::new(CAS, 0x80, 0x0000_0001_0000_1000), b"x")
            .resource(TrayResourceKey::new(CAS, 0x80, 0x0000_0001_0000_2000), b"yy")
            .constant_fields(0x7)
            .size_mode(IndexSizeMode::VariableBytes)
            .write_to(&path);

        let package = read_package(&path).unwrap();
        let keys: Vec<TrayResourceKey> = package.entries.iter().map(|e| e.key()).collect();
        assert_eq!(
            keys,
            vec![
                TrayResourceKey::new(CAS, 0x80, 0x0000_0001_0000_1000),
                TrayResourceKey::new(CAS, 0x80, 0x0000_0001_0000_2000),
            ]
        );
        let bytes = try_read_resource_bytes(&path, &package.entries[1]).unwrap();
        assert_eq!(bytes, b"yy");
    }

    #[test]
    fn per_entry_width_with_constant_template_parses() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("template_width.package");
        PackageBuilder::new()
            .resource(TrayResourceKey::new(CAS, 4, 0x5100), b"one")
            .resource(TrayResourceKey::new(CAS, 5, 0x5200), b"two")
            .resource(TrayResourceKey::new(CAS, 6, 0x5300), b"three")
            .constant_fields(0x1)
            .size_mode(IndexSizeMode::PerEntry)
            .write_to(&path);

        let package = read_package(&path).unwrap();
        let keys: Vec<TrayResourceKey> = package.entries.iter().map(|e| e.key()).collect();
        assert_eq!(
            keys,
            vec![
                TrayResourceKey::new(CAS, 4, 0x5100),
                TrayResourceKey::new(CAS, 5, 0x5200),
                TrayResourceKey::new(CAS, 6, 0x5300),
            ]
        );
        assert_eq!(
            try_read_resource_bytes(&path, &package.entries[2]).unwrap(),
            b"three"
        );
    }

    #[test]
    fn whole_block_size_is_accepted() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("block.package");
        PackageBuilder::new()
            .resource(TrayResourceKey::new(CAS, 1, 0x9000), b"x")
            .constant_fields(0x1)
            .size_mode(IndexSizeMode::WholeBlock)
            .write_to(&path);

        let package = read_package(&path).unwrap();
        assert_eq!(package.entries.len(), 1);
        assert_eq!(package.entries[0].group, 1);
    }

    #[test]
    fn legacy_full_records_ignore_template() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("legacy.package");
        PackageBuilder::new()
            .resource(TrayResourceKey::new(CAS, 2, 0xA000), b"x")
            .resource(TrayResourceKey::new(CAS, 2, 0xB000), b"y")
            .constant_fields(0x3)
            .legacy_records()
            .size_mode(IndexSizeMode::Raw(64))
            .write_to(&path);

        let package = read_package(&path).unwrap();
        assert_eq!(package.entries.len(), 2);
        assert_eq!(package.entries[1].key(), TrayResourceKey::new(CAS, 2, 0xB000));
    }

    #[test]
    fn irreconcilable_size_is_a_parse_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("broken.package");
        PackageBuilder::new()
            .resource(TrayResourceKey::new(CAS, 0, 0xC000), b"x")
            .size_mode(IndexSizeMode::Raw(17))
            .write_to(&path);

        let err = read_package(&path).unwrap_err();
        assert!(matches!(err, DbpfError::UnsupportedIndexLayout { .. }));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("fake.package");
        std::fs::write(&path, vec![0u8; HEADER_LEN]).unwrap();
        assert!(matches!(
            read_package(&path),
            Err(DbpfError::InvalidMagic(_))
        ));
    }

    #[test]
    fn short_file_is_truncated() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("short.package");
        std::fs::write(&path, b"DBPF").unwrap();
        assert!(matches!(
            read_package(&path),
            Err(DbpfError::Truncated("header"))
        ));
    }

    #[test]
    fn deleted_entries_are_kept_but_not_indexed() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("deleted.package");
        PackageBuilder::new()
            .resource(TrayResourceKey::new(CAS, 0, 0xD000), b"live")
            .deleted(TrayResourceKey::new(CAS, 0, 0xE000))
            .write_to(&path);

        let package = read_package(&path).unwrap();
        assert_eq!(package.entries.len(), 2);
        assert!(package.entries[1].is_deleted);
        assert_eq!(package.live_entry_count(), 1);
        assert!(!package.type_indexes[&CAS]
            .instance_to_entry_indexes
            .contains_key(&0xE000u64));
        assert!(matches!(
            try_read_resource_bytes(&path, &package.entries[1]),
            Err(DbpfError::Deleted)
        ));
    }

    #[test]
    fn zlib_resources_are_inflated() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("zlib.package");
        let payload = b"compressed payload compressed payload compressed payload".to_vec();
        PackageBuilder::new()
            .compressed(TrayResourceKey::new(IMAGE, 0, 0xF000), &payload)
            .write_to(&path);

        let package = read_package(&path).unwrap();
        let entry = &package.entries[0];
        assert_eq!(entry.compression, COMPRESSION_ZLIB);
        assert_eq!(entry.uncompressed_size as usize, payload.len());
        assert_eq!(try_read_resource_bytes(&path, entry).unwrap(), payload);
    }

    #[test]
    fn zlib_stream_longer_than_declared_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bomb.package");
        let payload = vec![0u8; 64 * 1024];
        PackageBuilder::new()
            .compressed_declaring(TrayResourceKey::new(IMAGE, 0, 0xF010), &payload, 512)
            .write_to(&path);

        let package = read_package(&path).unwrap();
        match try_read_resource_bytes(&path, &package.entries[0]) {
            Err(DbpfError::SizeMismatch { declared, actual }) => {
                assert_eq!(declared, 512);
                assert_eq!(actual, 513);
            }
            other => panic!("expected size mismatch, got {other:?}"),
        }
    }

    #[test]
    fn zlib_stream_shorter_than_declared_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("short_zlib.package");
        PackageBuilder::new()
            .compressed_declaring(TrayResourceKey::new(IMAGE, 0, 0xF020), b"tiny", 100)
            .write_to(&path);

        let package = read_package(&path).unwrap();
        assert!(matches!(
            try_read_resource_bytes(&path, &package.entries[0]),
            Err(DbpfError::SizeMismatch {
                declared: 100,
                actual: 4
            })
        ));
    }

    #[test]
    fn unknown_compression_reports_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("refpack.package");
        PackageBuilder::new()
            .resource_with_compression(TrayResourceKey::new(IMAGE, 0, 0xF100), b"????", 0xFFFF)
            .write_to(&path);

        let package = read_package(&path).unwrap();
        assert!(matches!(
            try_read_resource_bytes(&path, &package.entries[0]),
            Err(DbpfError::UnsupportedCompression(0xFFFF))
        ));
    }

    #[test]
    fn zlib_code_with_raw_bytes_fails_header_check() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("badzlib.package");
        PackageBuilder::new()
            .resource_with_compression(
                TrayResourceKey::new(IMAGE, 0, 0xF200),
                b"plain",
                COMPRESSION_ZLIB,
            )
            .write_to(&path);

        let package = read_package(&path).unwrap();
        assert!(matches!(
            try_read_resource_bytes(&path, &package.entries[0]),
            Err(DbpfError::InvalidZlibHeader(_, _))
        ));
    }

    #[test]
    fn empty_package_has_no_entries() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("empty.package");
        PackageBuilder::new().write_to(&path);
        let package = read_package(&path).unwrap();
        assert!(package.entries.is_empty());
        assert!(package.type_indexes.is_empty());
    }
}
