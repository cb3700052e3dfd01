/*!
Utilitaires de test pour le kernel Eclusa

- Fixtures de catalogue (`tags.json`, via serde_json) écrites dans un dossier temporaire
- Attente active d'une condition avec timeout
*/

use anyhow::Result;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Catalogue de tags écrit sur disque pour les tests de chargement
pub struct CatalogFixture {
    dir: TempDir,
    tags: Map<String, Value>,
    plc: Value,
}

impl CatalogFixture {
    pub fn new() -> Result<Self> {
        env_logger::try_init().ok(); // Init logging pour tests

        Ok(Self {
            dir: TempDir::new()?,
            tags: Map::new(),
            plc: json!({"ip": "127.0.0.1", "rack": 0, "slot": 1, "db_number": 19}),
        })
    }

    /// Remplace la section `plc_config`
    pub fn plc(mut self, ip: &str, rack: u16, slot: u16, db_number: u16) -> Self {
        self.plc = json!({"ip": ip, "rack": rack, "slot": slot, "db_number": db_number});
        self
    }

    /// Ajoute un tag (type brut, pour pouvoir tester les types invalides)
    pub fn tag(self, name: &str, tag_type: &str, offset: f64) -> Self {
        self.raw_tag(name, json!({"type": tag_type, "offset": offset, "description": name}))
    }

    /// Ajoute un tag décrit par un objet JSON complet
    pub fn raw_tag(mut self, name: &str, body: Value) -> Self {
        self.tags.insert(name.to_string(), body);
        self
    }

    /// Document `tags.json` tel qu'il sera écrit
    pub fn document(&self) -> Value {
        json!({"plc_config": self.plc, "tags": self.tags})
    }

    /// Écrit `tags.json` et retourne son chemin
    pub fn write(&self) -> Result<PathBuf> {
        let json = serde_json::to_string_pretty(&self.document())?;
        self.write_raw("tags.json", &json)
    }

    /// Écrit un fichier arbitraire (ex: JSON invalide)
    pub fn write_raw(&self, file_name: &str, content: &str) -> Result<PathBuf> {
        let path = self.dir.path().join(file_name);
        std::fs::write(&path, content)?;
        Ok(path)
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }
}

/// Attend qu'une condition devienne vraie, vérifiée toutes les 10 ms
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_writes_catalog() {
        let fixture = CatalogFixture::new()
            .unwrap()
            .plc("10.0.0.5", 0, 2, 7)
            .tag("Level", "real", 0.0)
            .tag("Pump", "bool", 4.3);
        let path = fixture.write().unwrap();

        let written: Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(written["plc_config"]["ip"], json!("10.0.0.5"));
        assert_eq!(written["plc_config"]["db_number"], json!(7));
        assert_eq!(written["tags"]["Pump"], json!({"type": "bool", "offset": 4.3, "description": "Pump"}));
    }

    #[test]
    fn test_fixture_escapes_names_and_non_finite_offsets() {
        let fixture = CatalogFixture::new()
            .unwrap()
            .tag(r#"Porta "A""#, "real", 0.0)
            .tag("Nan", "real", f64::NAN)
            .raw_tag("Spare", json!({"type": "int", "offset": 2, "is_active": false}));
        let path = fixture.write().unwrap();

        let written: Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(written["tags"][r#"Porta "A""#]["description"], json!(r#"Porta "A""#));
        // pas de littéral NaN dans le fichier : null à la place
        assert!(written["tags"]["Nan"]["offset"].is_null());
        assert_eq!(written["tags"]["Spare"]["is_active"], json!(false));
    }

    #[tokio::test]
    async fn test_wait_until() {
        let start = Instant::now();
        assert!(wait_until(Duration::from_secs(1), || start.elapsed() > Duration::from_millis(30)).await);
        assert!(!wait_until(Duration::from_millis(30), || false).await);
    }
}
