/**
 * CATALOGUE DE TAGS - Description statique des valeurs lues dans l'automate
 *
 * RÔLE : Charge `tags.json` (adresse automate + tags nommés), résout chaque offset
 * en adresse typée (octet, ou octet.bit) et signale une seule fois, au chargement,
 * les descripteurs illisibles (type inconnu, bit hors 0..7, offset négatif).
 *
 * FALLBACK : fichier absent ou JSON invalide -> chemin suivant, puis catalogue
 * intégré (3 niveaux de l'écluse sur DB19). Jamais fatal.
 */

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Descripteur illisible, détecté au chargement
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("unsupported tag type '{0}'")]
    UnsupportedType(String),
    #[error("bit offset {0} out of range (must be 0-7)")]
    BitOutOfRange(i64),
    #[error("negative offset {0}")]
    NegativeOffset(f64),
    #[error("{0} tags are not readable from the data block")]
    NotReadable(&'static str),
}

/// Cible automate: adresse, rack, slot et numéro de DB
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlcTarget {
    pub ip: String,
    pub rack: u16,
    pub slot: u16,
    pub db_number: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TagType {
    Real,
    Int,
    Bool,
    String,
}

impl TagType {
    fn parse(raw: &str) -> Result<Self, DecodeError> {
        match raw {
            "real" => Ok(TagType::Real),
            "int" => Ok(TagType::Int),
            "bool" => Ok(TagType::Bool),
            "string" => Ok(TagType::String),
            other => Err(DecodeError::UnsupportedType(other.to_string())),
        }
    }
}

/// Adresse résolue dans le data block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TagAddress {
    Real { byte: u32 },
    Int { byte: u32 },
    Bit { byte: u32, bit: u8 },
}

/// Forme du fichier JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogFile {
    pub plc_config: PlcTarget,
    pub tags: BTreeMap<String, TagFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagFile {
    #[serde(rename = "type")]
    pub tag_type: String,
    pub offset: f64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub min_value: Option<f64>,
    #[serde(default)]
    pub max_value: Option<f64>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

/// Tag du catalogue, adresse déjà résolue (ou erreur de décodage)
#[derive(Debug, Clone)]
pub struct TagDescriptor {
    pub name: String,
    pub declared_type: String,
    pub tag_type: Option<TagType>,
    pub offset: f64,
    pub description: String,
    pub unit: String,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub active: bool,
    pub address: Result<TagAddress, DecodeError>,
}

impl TagDescriptor {
    fn from_file(name: String, file: TagFile) -> Self {
        let tag_type = TagType::parse(&file.tag_type);
        let address = tag_type
            .clone()
            .and_then(|t| resolve_address(t, file.offset));
        Self {
            name,
            declared_type: file.tag_type,
            tag_type: tag_type.ok(),
            offset: file.offset,
            description: file.description,
            unit: file.unit,
            min_value: file.min_value,
            max_value: file.max_value,
            active: file.is_active,
            address,
        }
    }

    /// Adresse lisible pour un tag actif, sinon `None`
    pub fn pollable(&self) -> Option<TagAddress> {
        if !self.active {
            return None;
        }
        self.address.as_ref().ok().copied()
    }
}

/// Résout l'offset déclaré: partie entière = octet, première décimale = bit
pub fn resolve_address(tag_type: TagType, offset: f64) -> Result<TagAddress, DecodeError> {
    if !offset.is_finite() || offset < 0.0 {
        return Err(DecodeError::NegativeOffset(offset));
    }
    let byte = offset.floor();
    match tag_type {
        TagType::Real => Ok(TagAddress::Real { byte: byte as u32 }),
        TagType::Int => Ok(TagAddress::Int { byte: byte as u32 }),
        TagType::Bool => {
            let bit = ((offset - byte) * 10.0).round() as i64;
            if !(0..=7).contains(&bit) {
                return Err(DecodeError::BitOutOfRange(bit));
            }
            Ok(TagAddress::Bit { byte: byte as u32, bit: bit as u8 })
        }
        TagType::String => Err(DecodeError::NotReadable("string")),
    }
}

#[derive(Debug, Clone)]
pub struct Catalog {
    target: PlcTarget,
    tags: Vec<TagDescriptor>, // triés par nom
    source: String,
}

impl Catalog {
    pub fn from_file(file: CatalogFile, source: impl Into<String>) -> Self {
        let tags = file
            .tags
            .into_iter()
            .map(|(name, tag)| TagDescriptor::from_file(name, tag))
            .collect();
        Self { target: file.plc_config, tags, source: source.into() }
    }

    /// Charge un catalogue depuis un fichier JSON
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).await?;
        let file: CatalogFile = serde_json::from_str(&content)?;
        Ok(Self::from_file(file, path.display().to_string()))
    }

    /// Essaie chaque chemin dans l'ordre, puis retombe sur le catalogue intégré
    pub async fn load_or_default<P: AsRef<Path>>(paths: &[P]) -> Self {
        for path in paths {
            match Self::load(path).await {
                Ok(catalog) => {
                    catalog.report();
                    return catalog;
                }
                Err(e) => warn!("[catalog] cannot load {}: {}", path.as_ref().display(), e),
            }
        }
        warn!("[catalog] no usable catalog file, using built-in default");
        let catalog = Self::builtin();
        catalog.report();
        catalog
    }

    /// Catalogue intégré: niveaux caldeira / montante / jusante
    pub fn builtin() -> Self {
        let level = |offset: f64, description: &str| TagFile {
            tag_type: "real".into(),
            offset,
            description: description.into(),
            unit: "%".into(),
            min_value: Some(0.0),
            max_value: Some(100.0),
            is_active: true,
        };
        let mut tags = BTreeMap::new();
        tags.insert("Eclusa_Nivel_Caldeira".to_string(), level(0.0, "Eclusa Nível Caldeira (Real)"));
        tags.insert("Eclusa_Nivel_Montante".to_string(), level(4.0, "Eclusa Nível Montante (Real)"));
        tags.insert("Eclusa_Nivel_Jusante".to_string(), level(8.0, "Eclusa Nível Jusante (Real)"));

        let file = CatalogFile {
            plc_config: PlcTarget {
                ip: "192.168.1.33".into(),
                rack: 0,
                slot: 1,
                db_number: 19,
            },
            tags,
        };
        Self::from_file(file, "built-in")
    }

    // Une ligne par descripteur rejeté, une seule fois au chargement
    fn report(&self) {
        for tag in &self.tags {
            if let Err(e) = &tag.address {
                warn!("[catalog] tag '{}' unreadable: {}", tag.name, e);
            }
        }
        info!(
            "[catalog] loaded {} tags from {} ({} pollable) -> {} DB{}",
            self.tags.len(),
            self.source,
            self.pollable().count(),
            self.target.ip,
            self.target.db_number
        );
    }

    pub fn target(&self) -> &PlcTarget {
        &self.target
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn tags(&self) -> &[TagDescriptor] {
        &self.tags
    }

    pub fn get(&self, name: &str) -> Option<&TagDescriptor> {
        self.tags
            .binary_search_by(|t| t.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.tags[i])
    }

    /// Tags actifs et lisibles, dans l'ordre du catalogue
    pub fn pollable(&self) -> impl Iterator<Item = (&TagDescriptor, TagAddress)> {
        self.tags.iter().filter_map(|t| t.pollable().map(|a| (t, a)))
    }

    pub fn unreadable_count(&self) -> usize {
        self.tags.iter().filter(|t| t.address.is_err()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eclusa_devkit::CatalogFixture;

    #[test]
    fn test_resolve_bit_offsets() {
        assert_eq!(resolve_address(TagType::Bool, 4.3), Ok(TagAddress::Bit { byte: 4, bit: 3 }));
        assert_eq!(resolve_address(TagType::Bool, 12.0), Ok(TagAddress::Bit { byte: 12, bit: 0 }));
        assert_eq!(resolve_address(TagType::Bool, 0.7), Ok(TagAddress::Bit { byte: 0, bit: 7 }));
        assert_eq!(resolve_address(TagType::Bool, 0.8), Err(DecodeError::BitOutOfRange(8)));
        assert_eq!(resolve_address(TagType::Bool, 3.9), Err(DecodeError::BitOutOfRange(9)));
    }

    #[test]
    fn test_resolve_byte_offsets() {
        assert_eq!(resolve_address(TagType::Real, 8.0), Ok(TagAddress::Real { byte: 8 }));
        assert_eq!(resolve_address(TagType::Int, 86.0), Ok(TagAddress::Int { byte: 86 }));
        assert_eq!(resolve_address(TagType::Int, -2.0), Err(DecodeError::NegativeOffset(-2.0)));
        assert_eq!(resolve_address(TagType::String, 0.0), Err(DecodeError::NotReadable("string")));
    }

    #[test]
    fn test_builtin_catalog() {
        let catalog = Catalog::builtin();
        assert_eq!(catalog.target().ip, "192.168.1.33");
        assert_eq!(catalog.target().db_number, 19);
        assert_eq!(catalog.pollable().count(), 3);
        let jusante = catalog.get("Eclusa_Nivel_Jusante").unwrap();
        assert_eq!(jusante.address, Ok(TagAddress::Real { byte: 8 }));
        assert!(catalog.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_load_marks_unreadable_tags() {
        let fixture = CatalogFixture::new()
            .unwrap()
            .plc("10.1.1.1", 0, 2, 5)
            .tag("Level", "real", 0.0)
            .tag("Motor", "int", 4.0)
            .tag("Pump", "bool", 6.3)
            .tag("BadBit", "bool", 6.9)
            .tag("Counter", "dint", 8.0)
            .tag("Label", "string", 12.0)
            .tag(r#"Porta "Jusante""#, "real", 16.0)
            .raw_tag("Spare", serde_json::json!({"type": "real", "offset": 20, "is_active": false}));
        let path = fixture.write().unwrap();

        let catalog = Catalog::load(&path).await.unwrap();
        assert_eq!(catalog.target().slot, 2);
        assert_eq!(catalog.tags().len(), 8);
        assert_eq!(catalog.unreadable_count(), 3);

        let pollable: Vec<&str> = catalog.pollable().map(|(t, _)| t.name.as_str()).collect();
        assert_eq!(pollable, vec!["Level", "Motor", r#"Porta "Jusante""#, "Pump"]);

        let counter = catalog.get("Counter").unwrap();
        assert_eq!(counter.address, Err(DecodeError::UnsupportedType("dint".into())));
        assert!(counter.tag_type.is_none());
        assert!(!catalog.get("Spare").unwrap().active);
    }

    #[tokio::test]
    async fn test_fallback_order() {
        let fixture = CatalogFixture::new().unwrap().tag("Only", "real", 0.0);
        let broken = fixture.write_raw("broken.json", "{ not json").unwrap();
        let good = fixture.write().unwrap();
        let missing = fixture.dir().join("missing.json");

        let catalog = Catalog::load_or_default(&[missing.clone(), broken.clone(), good.clone()]).await;
        assert_eq!(catalog.source(), good.display().to_string());
        assert!(catalog.get("Only").is_some());

        let fallback = Catalog::load_or_default(&[missing, broken]).await;
        assert_eq!(fallback.source(), "built-in");
        assert_eq!(fallback.tags().len(), 3);
    }
}
