/*!
# Eclusa DevKit - Automate simulé et utilitaires de test

Bibliothèque facilitant le développement du kernel sans automate réel:
- Data block construit en mémoire (real / int / bool aux offsets S7)
- Faux automate S7 servant ce data block en ISO-on-TCP
- Fixtures de catalogue de tags et helpers d'attente pour les tests
*/

pub mod block;
pub mod fake_plc;
pub mod test_utils;

pub use block::DataBlock;
pub use fake_plc::FakePlc;
pub use test_utils::{CatalogFixture, wait_until};
