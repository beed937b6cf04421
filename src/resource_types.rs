pub const CAS_PART: u32 = 0x034A_EECB;
pub const SKIN_TONE: u32 = 0x0354_796A;
pub const OBJECT_DEFINITION: u32 = 0xC0DB_5AE7;
pub const OBJECT_CATALOG: u32 = 0x319E_4F1D;
pub const SIM_DATA: u32 = 0x545A_C67A;
pub const ASPIRATION_TUNING: u32 = 0x28B6_4675;
pub const TRAIT_TUNING: u32 = 0xCB5F_DDC7;
pub const LOT_TRAIT_TUNING: u32 = 0x7399_6BEB;
pub const SIM_MODIFIER: u32 = 0xC5F6_763E;
pub const CAS_PRESET: u32 = 0xEAA3_2ADD;
pub const SCULPT: u32 = 0x9D1A_B874;
pub const BLEND_GEOMETRY: u32 = 0x067C_AA11;
pub const DEFORMER_MAP: u32 = 0xB52F_5055;

pub const TEXTURE_COMPOSITOR: u32 = 0x033A_1435;
pub const RLE2_IMAGE: u32 = 0x3453_CF95;
pub const RLES_IMAGE: u32 = 0xBA85_6C78;
pub const LRLE_IMAGE: u32 = 0x2BC0_4EDF;
pub const DST_IMAGE: u32 = 0x00B2_D882;
pub const PNG_IMAGE: u32 = 0x2F7D_0004;
pub const MATERIAL_DEFINITION: u32 = 0x01D0_E75D;
pub const MATERIAL_SET: u32 = 0x0201_9972;
pub const GEOMETRY: u32 = 0x015A_1849;
pub const MODEL: u32 = 0x0166_1233;
pub const MODEL_LOD: u32 = 0x01D1_0F34;
pub const RIG: u32 = 0x8EAF_13DE;
pub const FOOTPRINT: u32 = 0xD382_BF57;
pub const SLOT: u32 = 0xD304_4521;
pub const LIGHT: u32 = 0x03B4_C61D;

/// SimData is a generic container; only these groups carry trait or
/// aspiration data.
pub const SIM_DATA_TRAIT_GROUP: u32 = 0x00AE_6C67;
pub const SIM_DATA_ASPIRATION_GROUP: u32 = 0x00A2_B82A;
pub const SIM_DATA_ASPIRATION_TRACK_GROUP: u32 = 0x00D4_A92A;
pub const SIM_DATA_ELIGIBLE_GROUPS: [u32; 3] = [
    SIM_DATA_TRAIT_GROUP,
    SIM_DATA_ASPIRATION_GROUP,
    SIM_DATA_ASPIRATION_TRACK_GROUP,
];

/// Types accepted by the aligned key scan over tray files.
pub const TRAY_KEY_TYPES: &[u32] = &[
    CAS_PART,
    SKIN_TONE,
    OBJECT_DEFINITION,
    OBJECT_CATALOG,
    SIM_DATA,
    ASPIRATION_TUNING,
    TRAIT_TUNING,
    LOT_TRAIT_TUNING,
    SIM_MODIFIER,
    CAS_PRESET,
    SCULPT,
];

/// CAS part, skin tone, aspiration, trait and slider candidates.
pub const HOUSEHOLD_CANDIDATE_TYPES: &[u32] = &[
    CAS_PART,
    SKIN_TONE,
    ASPIRATION_TUNING,
    TRAIT_TUNING,
    SIM_DATA,
    SIM_MODIFIER,
    CAS_PRESET,
    SCULPT,
];

/// Lot trait and object candidates.
pub const BUILD_CANDIDATE_TYPES: &[u32] = &[LOT_TRAIT_TUNING, OBJECT_DEFINITION, OBJECT_CATALOG];

/// Everything a matched resource may point at by full key.
pub const STRUCTURED_REFERENCE_TYPES: &[u32] = &[
    CAS_PART,
    SKIN_TONE,
    OBJECT_DEFINITION,
    OBJECT_CATALOG,
    SIM_DATA,
    ASPIRATION_TUNING,
    TRAIT_TUNING,
    LOT_TRAIT_TUNING,
    SIM_MODIFIER,
    CAS_PRESET,
    SCULPT,
    BLEND_GEOMETRY,
    DEFORMER_MAP,
    TEXTURE_COMPOSITOR,
    RLE2_IMAGE,
    RLES_IMAGE,
    LRLE_IMAGE,
    DST_IMAGE,
    PNG_IMAGE,
    MATERIAL_DEFINITION,
    MATERIAL_SET,
    GEOMETRY,
    MODEL,
    MODEL_LOD,
    RIG,
    FOOTPRINT,
    SLOT,
    LIGHT,
];

// Skin tones store bare instances; the type is inferred by convention.
pub const SKIN_TONE_OVERLAY_TYPES: &[u32] = &[RLE2_IMAGE, RLES_IMAGE, LRLE_IMAGE];
pub const SKIN_TONE_MATERIAL_TYPES: &[u32] = &[MATERIAL_DEFINITION, MATERIAL_SET];
pub const SKIN_TONE_BUMP_MAP_TYPES: &[u32] = &[DST_IMAGE];

pub fn is_group_eligible(resource_type: u32, group: u32) -> bool {
    resource_type != SIM_DATA || SIM_DATA_ELIGIBLE_GROUPS.contains(&group)
}

pub fn type_label(resource_type: u32) -> &'static str {
    match resource_type {
        CAS_PART => "CAS Part",
        SKIN_TONE => "Skin Tone",
        OBJECT_DEFINITION => "Object Definition",
        OBJECT_CATALOG => "Object Catalog",
        SIM_DATA => "SimData",
        ASPIRATION_TUNING => "Aspiration",
        TRAIT_TUNING => "Trait",
        LOT_TRAIT_TUNING => "Lot Trait",
        SIM_MODIFIER => "Sim Modifier",
        CAS_PRESET => "CAS Preset",
        SCULPT => "Sculpt",
        BLEND_GEOMETRY => "Blend Geometry",
        DEFORMER_MAP => "Deformer Map",
        TEXTURE_COMPOSITOR => "Texture Compositor",
        RLE2_IMAGE | RLES_IMAGE | LRLE_IMAGE | DST_IMAGE | PNG_IMAGE => "Image",
        MATERIAL_DEFINITION => "Material Definition",
        MATERIAL_SET => "Material Set",
        GEOMETRY => "Geometry",
        MODEL | MODEL_LOD => "Model",
        RIG => "Rig",
        FOOTPRINT => "Footprint",
        SLOT => "Slot",
        LIGHT => "Light",
        _ => "Unknown",
    }
}
