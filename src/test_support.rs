use crate::dbpf::{
    TrayResourceKey, COMPRESSION_DELETED, COMPRESSION_NONE, COMPRESSION_ZLIB, HEADER_LEN,
    LOGICAL_RECORD_LEN, MAGIC,
};
use flate2::{write::ZlibEncoder, Compression};
use std::{fs, io::Write, path::Path};

#[derive(Debug, Clone, Copy)]
pub enum IndexSizeMode {
    VariableBytes,
    WholeBlock,
    PerEntry,
    Raw(u32),
}

struct FixtureResource {
    key: TrayResourceKey,
    stored: Vec<u8>,
    uncompressed_size: u32,
    compression: u16,
}

pub struct PackageBuilder {
    resources: Vec<FixtureResource>,
    constant_mask: u32,
    size_mode: IndexSizeMode,
    legacy_records: bool,
}

impl Default for PackageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PackageBuilder {
    pub fn new() -> Self {
        Self {
            resources: Vec::new(),
            constant_mask: 0,
            size_mode: IndexSizeMode::VariableBytes,
            legacy_records: false,
        }
    }

    pub fn resource(self, key: TrayResourceKey, data: &[u8]) -> Self {
        self.resource_with_compression(key, data, COMPRESSION_NONE)
    }

    pub fn resource_with_compression(
        mut self,
        key: TrayResourceKey,
        data: &[u8],
        compression: u16,
    ) -> Self {
        self.resources.push(FixtureResource {
            key,
            stored: data.to_vec(),
            uncompressed_size: data.len() as u32,
            compression,
        });
        self
    }

    pub fn compressed(self, key: TrayResourceKey, data: &[u8]) -> Self {
        let declared = data.len() as u32;
        self.compressed_declaring(key, data, declared)
    }

    /// Zlib-compresses `data` but records `declared` as its inflated size.
    pub fn compressed_declaring(
        mut self,
        key: TrayResourceKey,
        data: &[u8],
        declared: u32,
    ) -> Self {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        let stored = encoder.finish().unwrap();
        self.resources.push(FixtureResource {
            key,
            stored,
            uncompressed_size: declared,
            compression: COMPRESSION_ZLIB,
        });
        self
    }

    pub fn deleted(mut self, key: TrayResourceKey) -> Self {
        self.resources.push(FixtureResource {
            key,
            stored: Vec::new(),
            uncompressed_size: 0,
            compression: COMPRESSION_DELETED,
        });
        self
    }

    /// Hoists type (1), group (2) and/or instance-high (4) into the shared
    /// template. Values come from the first resource.
    pub fn constant_fields(mut self, mask: u32) -> Self {
        self.constant_mask = mask & 0x7;
        self
    }

    pub fn size_mode(mut self, mode: IndexSizeMode) -> Self {
        self.size_mode = mode;
        self
    }

    /// Writes full 32-byte records even when template flags are set.
    pub fn legacy_records(mut self) -> Self {
        self.legacy_records = true;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_LEN];
        let mut offsets = Vec::with_capacity(self.resources.len());
        for resource in &self.resources {
            offsets.push(out.len() as u32);
            out.extend_from_slice(&resource.stored);
        }

        let index_position = out.len() as u64;
        let constant_count = self.constant_mask.count_ones() as usize;
        let template = self
            .resources
            .first()
            .map(|resource| {
                [
                    resource.key.resource_type,
                    resource.key.group,
                    (resource.key.instance >> 32) as u32,
                ]
            })
            .unwrap_or([0; 3]);

        if !self.resources.is_empty() {
            out.extend_from_slice(&self.constant_mask.to_le_bytes());
            for (slot, value) in template.iter().enumerate() {
                if self.constant_mask & (1 << slot) != 0 {
                    out.extend_from_slice(&value.to_le_bytes());
                }
            }
        }

        for (resource, offset) in self.resources.iter().zip(&offsets) {
            let words = [
                resource.key.resource_type,
                resource.key.group,
                (resource.key.instance >> 32) as u32,
                resource.key.instance as u32,
                *offset,
                resource.stored.len() as u32 | 0x8000_0000,
                resource.uncompressed_size,
                u32::from(resource.compression) | (1 << 16),
            ];
            for (slot, word) in words.iter().enumerate() {
                if !self.legacy_records && slot < 3 && self.constant_mask & (1 << slot) != 0 {
                    continue;
                }
                out.extend_from_slice(&word.to_le_bytes());
            }
        }

        let record_len = if self.legacy_records {
            LOGICAL_RECORD_LEN
        } else {
            LOGICAL_RECORD_LEN - 4 * constant_count
        };
        let count = self.resources.len() as u32;
        let declared = match self.size_mode {
            IndexSizeMode::VariableBytes => count * record_len as u32,
            IndexSizeMode::WholeBlock => {
                count * record_len as u32 + 4 + 4 * constant_count as u32
            }
            IndexSizeMode::PerEntry => record_len as u32,
            IndexSizeMode::Raw(value) => value,
        };

        out[0..4].copy_from_slice(MAGIC);
        out[4..8].copy_from_slice(&2u32.to_le_bytes());
        out[8..12].copy_from_slice(&1u32.to_le_bytes());
        out[36..40].copy_from_slice(&count.to_le_bytes());
        out[40..44].copy_from_slice(&(index_position as u32).to_le_bytes());
        out[44..48].copy_from_slice(&declared.to_le_bytes());
        out[60..64].copy_from_slice(&3u32.to_le_bytes());
        out[64..72].copy_from_slice(&index_position.to_le_bytes());
        out
    }

    pub fn write_to(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, self.build()).unwrap();
    }
}

pub fn key_bytes(key: TrayResourceKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&key.resource_type.to_le_bytes());
    out.extend_from_slice(&key.group.to_le_bytes());
    out.extend_from_slice(&key.instance.to_le_bytes());
    out
}

/// Tray-like payload: a leading zero byte (not a valid message key) then
/// the given keys on 4-byte boundaries.
pub fn tray_payload(keys: &[TrayResourceKey]) -> Vec<u8> {
    let mut out = vec![0u8; 8];
    for key in keys {
        out.extend_from_slice(&key_bytes(*key));
    }
    out
}
