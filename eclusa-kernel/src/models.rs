use serde::Serialize;
use std::collections::HashMap;

/// Valeur brute lue dans le data block, avec son type explicite
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TagValue {
    Real(f32),
    Int(i16),
    Bool(bool),
}

impl TagValue {
    /// Comparaison octet par octet: 0.0 et -0.0 diffèrent, NaN est égal à lui-même
    pub fn same_as(&self, other: &TagValue) -> bool {
        match (self, other) {
            (TagValue::Real(a), TagValue::Real(b)) => a.to_bits() == b.to_bits(),
            (TagValue::Int(a), TagValue::Int(b)) => a == b,
            (TagValue::Bool(a), TagValue::Bool(b)) => a == b,
            _ => false,
        }
    }

    pub fn as_real(&self) -> Option<f32> {
        match self {
            TagValue::Real(v) => Some(*v),
            TagValue::Int(_) | TagValue::Bool(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i16> {
        match self {
            TagValue::Int(v) => Some(*v),
            TagValue::Real(_) | TagValue::Bool(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TagValue::Bool(v) => Some(*v),
            TagValue::Real(_) | TagValue::Int(_) => None,
        }
    }
}

impl std::fmt::Display for TagValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TagValue::Real(v) => write!(f, "{v}"),
            TagValue::Int(v) => write!(f, "{v}"),
            TagValue::Bool(v) => write!(f, "{v}"),
        }
    }
}

/// Nom de tag -> dernière valeur lue
pub type ValueMap = HashMap<String, TagValue>;

// Décodage big-endian des blocs lus dans le DB

pub fn decode_real(raw: [u8; 4]) -> f32 {
    f32::from_be_bytes(raw)
}

pub fn decode_int(raw: [u8; 2]) -> i16 {
    i16::from_be_bytes(raw)
}

/// `bit` doit être dans 0..=7, garanti par le chargement du catalogue
pub fn decode_bit(raw: u8, bit: u8) -> bool {
    raw & (1u8 << (bit & 0x07)) != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use eclusa_devkit::DataBlock;

    #[test]
    fn test_decode_known_bytes() {
        assert_eq!(decode_real([0x42, 0x48, 0x00, 0x00]), 50.0);
        assert_eq!(decode_int([0xFF, 0xFE]), -2);
        assert_eq!(decode_int([0x00, 0x02]), 2);
        assert!(decode_bit(0b0000_1000, 3));
        assert!(!decode_bit(0b0000_1000, 4));
    }

    #[test]
    fn test_decode_matches_block_encoding() {
        let mut db = DataBlock::new(8);
        db.set_real(0, -12.75).set_int(4, i16::MIN).set_bit(6, 7, true);
        let b = db.bytes();

        assert_eq!(decode_real([b[0], b[1], b[2], b[3]]), -12.75);
        assert_eq!(decode_int([b[4], b[5]]), i16::MIN);
        assert!(decode_bit(b[6], 7));
        assert!((0..7).all(|bit| !decode_bit(b[6], bit)));
    }

    #[test]
    fn test_same_as_is_bitwise() {
        assert!(TagValue::Real(f32::NAN).same_as(&TagValue::Real(f32::NAN)));
        assert!(!TagValue::Real(0.0).same_as(&TagValue::Real(-0.0)));
        assert!(!TagValue::Int(1).same_as(&TagValue::Bool(true)));
        assert!(TagValue::Bool(false).same_as(&TagValue::Bool(false)));
    }

    #[test]
    fn test_serializes_as_plain_json() {
        assert_eq!(serde_json::to_string(&TagValue::Real(1.5)).unwrap(), "1.5");
        assert_eq!(serde_json::to_string(&TagValue::Int(-3)).unwrap(), "-3");
        assert_eq!(serde_json::to_string(&TagValue::Bool(true)).unwrap(), "true");
    }
}
