use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrayFileRole {
    Descriptor,
    HouseholdInfo,
    SimInfo,
    HouseholdBinary,
    Blueprint,
    Room,
}

pub const TRAY_EXTENSIONS: [(&str, TrayFileRole); 8] = [
    ("trayitem", TrayFileRole::Descriptor),
    ("hhi", TrayFileRole::HouseholdInfo),
    ("sgi", TrayFileRole::SimInfo),
    ("householdbinary", TrayFileRole::HouseholdBinary),
    ("blueprint", TrayFileRole::Blueprint),
    ("bpi", TrayFileRole::Blueprint),
    ("room", TrayFileRole::Room),
    ("rmi", TrayFileRole::Room),
];

impl TrayFileRole {
    pub fn from_extension(ext: &str) -> Option<Self> {
        TRAY_EXTENSIONS
            .iter()
            .find(|(known, _)| known.eq_ignore_ascii_case(ext))
            .map(|(_, role)| *role)
    }

    /// Household files carry sim, outfit and trait references.
    pub fn is_household(self) -> bool {
        matches!(
            self,
            TrayFileRole::Descriptor
                | TrayFileRole::HouseholdInfo
                | TrayFileRole::SimInfo
                | TrayFileRole::HouseholdBinary
        )
    }

    /// Build files carry object and lot trait references.
    pub fn is_build(self) -> bool {
        matches!(
            self,
            TrayFileRole::Descriptor | TrayFileRole::Blueprint | TrayFileRole::Room
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            TrayFileRole::Descriptor => "tray item",
            TrayFileRole::HouseholdInfo => "household info",
            TrayFileRole::SimInfo => "sim info",
            TrayFileRole::HouseholdBinary => "household binary",
            TrayFileRole::Blueprint => "blueprint",
            TrayFileRole::Room => "room",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrayBundleFile {
    pub path: PathBuf,
    pub role: TrayFileRole,
}

#[derive(Debug, Clone, Default)]
pub struct TrayFileBundle {
    pub key: String,
    pub files: Vec<TrayBundleFile>,
}

impl TrayFileBundle {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.files.iter().map(|file| file.path.clone()).collect()
    }

    pub fn has_household_context(&self) -> bool {
        self.files.iter().any(|file| file.role.is_household())
    }

    pub fn has_build_context(&self) -> bool {
        self.files.iter().any(|file| file.role.is_build())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrayKeyError {
    #[error("tray item key is empty")]
    Empty,
    #[error("tray item key {0:?} is not hexadecimal")]
    NotHex(String),
    #[error("tray item key {0:?} does not fit in 64 bits")]
    TooLong(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrayItemKey {
    /// Lower-case hex with a `0x` prefix.
    pub normalized: String,
    pub instance: u64,
}

/// Accepts `0x<hex>`, bare hex, or a full `0x<type>!0x<instance>` identity.
pub fn normalize_tray_item_key(raw: &str) -> Result<TrayItemKey, TrayKeyError> {
    let trimmed = raw.trim();
    let instance_part = trimmed
        .rsplit_once('!')
        .map(|(_, instance)| instance)
        .unwrap_or(trimmed);
    let digits = strip_hex_prefix(instance_part.trim());
    if digits.is_empty() {
        return Err(TrayKeyError::Empty);
    }
    if !digits.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return Err(TrayKeyError::NotHex(raw.to_string()));
    }
    let instance =
        parse_hex_u64(digits).ok_or_else(|| TrayKeyError::TooLong(raw.to_string()))?;
    Ok(TrayItemKey {
        normalized: format!("0x{}", digits.to_ascii_lowercase()),
        instance,
    })
}

/// True when a file stem names the key, either directly or through the
/// `0x{type:8}!0x{instance:16}` identity pattern.
pub fn stem_matches_key(stem: &str, key: &TrayItemKey) -> bool {
    let instance_part = stem
        .rsplit_once('!')
        .map(|(_, instance)| instance)
        .unwrap_or(stem);
    let digits = strip_hex_prefix(instance_part.trim());
    if digits.is_empty() || !digits.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return false;
    }
    parse_hex_u64(digits) == Some(key.instance)
}

pub fn load_tray_bundle(tray_root: &Path, key: &TrayItemKey) -> io::Result<TrayFileBundle> {
    let mut files = Vec::new();
    for entry in fs::read_dir(tray_root)?.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(role) = path
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(TrayFileRole::from_extension)
        else {
            continue;
        };
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
        if stem_matches_key(stem, key) {
            files.push(TrayBundleFile { path, role });
        }
    }
    files.sort_by(|a, b| a.role.cmp(&b.role).then_with(|| a.path.cmp(&b.path)));
    Ok(TrayFileBundle {
        key: key.normalized.clone(),
        files,
    })
}

fn strip_hex_prefix(value: &str) -> &str {
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value)
}

fn parse_hex_u64(digits: &str) -> Option<u64> {
    let significant = digits.trim_start_matches('0');
    if significant.is_empty() {
        return Some(0);
    }
    u64::from_str_radix(significant, 16).ok()
}
