/**
 * LIVE VALUE CACHE - Dernière valeur lue par tag
 *
 * RÔLE : Map nom -> dernière valeur lue sans erreur. Un tag absent n'a jamais été lu
 * depuis le démarrage ; une lecture ratée ne touche pas l'entrée (valeur périmée
 * conservée, jamais remplacée par un zéro).
 *
 * CONCURRENCE : RwLock parking_lot, tenu le temps d'une copie ou d'une insertion.
 * Écrivains : boucle de polling et push admin. Lecteurs : snapshots, vues HTTP.
 */

use crate::models::{TagValue, ValueMap};
use crate::state::{new_state, Shared};
use std::collections::HashMap;
use time::OffsetDateTime;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheEntry {
    pub value: TagValue,
    pub updated_at: OffsetDateTime,
}

/// Résultat d'une écriture dans le cache
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CacheUpdate {
    First,
    Changed { previous: TagValue },
    Unchanged,
}

impl CacheUpdate {
    pub fn is_change(&self) -> bool {
        !matches!(self, CacheUpdate::Unchanged)
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    last_change: Option<OffsetDateTime>,
}

#[derive(Clone)]
pub struct LiveValueCache {
    state: Shared<CacheState>,
}

impl Default for LiveValueCache {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveValueCache {
    pub fn new() -> Self {
        Self { state: new_state(CacheState::default()) }
    }

    /// Enregistre une valeur lue ; comparaison bit à bit avec la précédente
    pub fn record(&self, name: &str, value: TagValue) -> CacheUpdate {
        let now = OffsetDateTime::now_utc();
        let mut guard = self.state.write();
        let state = &mut *guard;
        let first_ever = state.entries.is_empty();

        let update = match state.entries.get_mut(name) {
            Some(entry) if entry.value.same_as(&value) => CacheUpdate::Unchanged,
            Some(entry) => {
                let previous = entry.value;
                *entry = CacheEntry { value, updated_at: now };
                CacheUpdate::Changed { previous }
            }
            None => {
                state.entries.insert(name.to_string(), CacheEntry { value, updated_at: now });
                CacheUpdate::First
            }
        };
        if update.is_change() {
            state.last_change = Some(now);
        }
        drop(guard);

        if first_ever && update == CacheUpdate::First {
            info!("[cache] first value read: {} = {}", name, value);
        }
        update
    }

    /// Copie profonde de toutes les entrées
    pub fn snapshot(&self) -> HashMap<String, CacheEntry> {
        self.state.read().entries.clone()
    }

    /// Copie des seules valeurs, entrée du codec
    pub fn values(&self) -> ValueMap {
        self.state
            .read()
            .entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.value))
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<CacheEntry> {
        self.state.read().entries.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read_at_least_once(&self) -> bool {
        !self.is_empty()
    }

    pub fn last_change(&self) -> Option<OffsetDateTime> {
        self.state.read().last_change
    }
}
