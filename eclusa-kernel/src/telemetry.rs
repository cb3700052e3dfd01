/**
 * TELEMETRY - Assemblage explicite des composants du pipeline
 *
 * RÔLE : Construit une seule fois au démarrage et passé par Arc à qui en a besoin
 * (poller, hub via SnapshotFn, routes HTTP). Pas d'état global caché.
 *
 * API pour l'extérieur du cœur : payload courant, push d'une valeur externe
 * (même chemin de broadcast que le polling), statistiques, vue des tags.
 */

use crate::cache::LiveValueCache;
use crate::catalog::{Catalog, TagAddress, TagType};
use crate::codec::{build_payload, TelemetryPayload};
use crate::device::DeviceLink;
use crate::hub::{Frame, HubHandle, HubStats, SnapshotFn};
use crate::models::TagValue;
use crate::publisher::{BroadcastPublisher, PublishOutcome, PublisherStats};
use serde::Serialize;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{error, info};

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum PushError {
    #[error("unknown tag '{0}'")]
    UnknownTag(String),
    #[error("tag '{0}' has type '{1}', which cannot be written")]
    NotWritable(String, String),
    #[error("tag '{0}' is unreadable: {1}")]
    Unreadable(String, String),
}

#[derive(Debug, Clone, Serialize)]
pub struct TagView {
    pub name: String,
    #[serde(rename = "type")]
    pub tag_type: String,
    pub offset: f64,
    pub unit: String,
    pub description: String,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub active: bool,
    pub readable: bool,
    pub error: Option<String>,
    pub value: Option<TagValue>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetryStats {
    pub subscribers: usize,
    pub cache_size: usize,
    pub read_at_least_once: bool,
    pub last_broadcast: Option<String>,
    pub last_change: Option<String>,
    pub hub: HubStats,
    pub publisher: PublisherStats,
}

pub struct Telemetry {
    catalog: Arc<Catalog>,
    cache: LiveValueCache,
    link: Arc<DeviceLink>,
    hub: HubHandle,
    publisher: Arc<BroadcastPublisher>,
}

fn rfc3339(t: OffsetDateTime) -> Option<String> {
    t.format(&Rfc3339).ok()
}

impl Telemetry {
    pub fn new(catalog: Arc<Catalog>, link: Arc<DeviceLink>, hub: HubHandle) -> Arc<Self> {
        let publisher = BroadcastPublisher::new(hub.broadcast_sender());
        Arc::new(Self {
            catalog,
            cache: LiveValueCache::new(),
            link,
            hub,
            publisher,
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn cache(&self) -> &LiveValueCache {
        &self.cache
    }

    pub fn link(&self) -> &Arc<DeviceLink> {
        &self.link
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    pub fn publisher(&self) -> &Arc<BroadcastPublisher> {
        &self.publisher
    }

    /// Payload complet construit depuis le cache, à l'instant présent
    pub fn current_payload(&self) -> TelemetryPayload {
        build_payload(&self.cache.values(), self.link.is_connected(), OffsetDateTime::now_utc())
    }

    pub fn snapshot_frame(&self) -> Option<Frame> {
        match self.current_payload().to_json() {
            Ok(json) => Some(Frame::from(json)),
            Err(e) => {
                error!("[telemetry] cannot encode payload: {}", e);
                None
            }
        }
    }

    /// Snapshot à passer au dispatcher du hub
    pub fn snapshot_fn(self: &Arc<Self>) -> SnapshotFn {
        let this = self.clone();
        Arc::new(move || this.snapshot_frame())
    }

    /// Payload construit sous le verrou du publisher : un écrivain plus lent ne peut pas
    /// republier un état antérieur à celui d'un autre
    pub fn publish_current(&self) -> PublishOutcome {
        self.publisher.publish_with(|| self.snapshot_frame())
    }

    /// Injecte une valeur externe (admin) puis la diffuse comme un changement lu
    pub fn push_value(&self, name: &str, raw: f64) -> Result<TagValue, PushError> {
        let tag = self
            .catalog
            .get(name)
            .ok_or_else(|| PushError::UnknownTag(name.to_string()))?;
        let address = match (tag.tag_type, &tag.address) {
            (Some(TagType::String) | None, _) => {
                return Err(PushError::NotWritable(name.to_string(), tag.declared_type.clone()));
            }
            (_, Err(e)) => return Err(PushError::Unreadable(name.to_string(), e.to_string())),
            (_, Ok(address)) => *address,
        };

        let bounded = |v: f64| {
            let v = tag.min_value.map_or(v, |min| v.max(min));
            tag.max_value.map_or(v, |max| v.min(max))
        };
        let value = match address {
            TagAddress::Real { .. } => TagValue::Real(bounded(raw) as f32),
            TagAddress::Int { .. } => {
                let v = bounded(raw.round()).clamp(i16::MIN as f64, i16::MAX as f64);
                TagValue::Int(v as i16)
            }
            TagAddress::Bit { .. } => TagValue::Bool(raw != 0.0),
        };

        self.cache.record(name, value);
        let outcome = self.publish_current();
        info!("[telemetry] external update {} = {} ({:?})", name, value, outcome);
        Ok(value)
    }

    pub fn tag_views(&self) -> Vec<TagView> {
        let entries = self.cache.snapshot();
        self.catalog
            .tags()
            .iter()
            .map(|tag| {
                let entry = entries.get(&tag.name);
                TagView {
                    name: tag.name.clone(),
                    tag_type: tag.declared_type.clone(),
                    offset: tag.offset,
                    unit: tag.unit.clone(),
                    description: tag.description.clone(),
                    min_value: tag.min_value,
                    max_value: tag.max_value,
                    active: tag.active,
                    readable: tag.address.is_ok(),
                    error: tag.address.as_ref().err().map(|e| e.to_string()),
                    value: entry.map(|e| e.value),
                    updated_at: entry.and_then(|e| rfc3339(e.updated_at)),
                }
            })
            .collect()
    }

    pub fn stats(&self) -> TelemetryStats {
        let hub = self.hub.stats();
        TelemetryStats {
            subscribers: hub.active_subscribers,
            cache_size: self.cache.len(),
            read_at_least_once: self.cache.read_at_least_once(),
            last_broadcast: hub.last_broadcast.clone(),
            last_change: self.cache.last_change().and_then(rfc3339),
            hub,
            publisher: self.publisher.stats(),
        }
    }
}
