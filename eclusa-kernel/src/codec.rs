/**
 * MESSAGE CODEC - Valeurs brutes -> payload JSON des clients WebSocket
 *
 * RÔLE : Fonction pure et totale. Pour n'importe quelle map de valeurs (même vide),
 * produit un payload complet à forme fixe : chaque champ est toujours présent.
 *
 * CONTRAT DE REPLI : tag absent ou de mauvais type -> valeur zéro du type cible
 * (0.0, 0, false). Un float non fini est aussi ramené à 0.0 pour garder un JSON valide.
 *
 * Utilisé à l'identique pour le broadcast sur changement et le snapshot d'un nouveau client.
 */

use crate::models::{TagValue, ValueMap};
use serde::Serialize;
use std::collections::BTreeMap;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy)]
enum Shape {
    Real { clamp: Option<(f32, f32)> },
    Int { clamp: Option<(i16, i16)> },
    Bool,
    /// Float multiplié par un facteur (cotes en mètres)
    Scaled { factor: f32 },
}

const PERCENT: Shape = Shape::Real { clamp: Some((0.0, 100.0)) };
const RAW_REAL: Shape = Shape::Real { clamp: None };
const MOTOR_STATE: Shape = Shape::Int { clamp: Some((0, 2)) };
// Niveau 0..100 % -> cote 0..25 m
const LEVEL_TO_METRES: Shape = Shape::Scaled { factor: 0.25 };

struct Field {
    output: &'static str,
    source: &'static str,
    shape: Shape,
}

const fn field(output: &'static str, source: &'static str, shape: Shape) -> Field {
    Field { output, source, shape }
}

const FIELDS: &[Field] = &[
    // niveaux et portes de l'écluse
    field("nivelCaldeiraValue", "Eclusa_Nivel_Caldeira", PERCENT),
    field("nivelMontanteValue", "Eclusa_Nivel_Montante", PERCENT),
    field("nivelJusanteValue", "Eclusa_Nivel_Jusante", PERCENT),
    field("eclusaPortaJusanteValue", "Eclusa_Porta_Jusante", PERCENT),
    field("eclusaPortaMontanteValue", "Eclusa_Porta_Montante", PERCENT),
    // radars et lasers
    field("radarCaldeiraDistanciaValue", "Eclusa_Radar_Caldeira_Distancia", RAW_REAL),
    field("radarCaldeiraVelocidadeValue", "Eclusa_Radar_Caldeira_Velocidade", RAW_REAL),
    field("radarMontanteDistanciaValue", "Eclusa_Radar_Montante_Distancia", RAW_REAL),
    field("radarMontanteVelocidadeValue", "Eclusa_Radar_Montante_Velocidade", RAW_REAL),
    field("radarJusanteDistanciaValue", "Eclusa_Radar_Jusante_Distancia", RAW_REAL),
    field("radarJusanteVelocidadeValue", "Eclusa_Radar_Jusante_Velocidade", RAW_REAL),
    field("laserMontanteValue", "Eclusa_Laser_Montante", RAW_REAL),
    field("laserJusanteValue", "Eclusa_Laser_Jusante", RAW_REAL),
    field("radarDistanciaValue", "Eclusa_Radar_Caldeira_Distancia", RAW_REAL),
    // états
    field("comunicacaoPLCValue", "Eclusa_Comunicação_PLC", Shape::Bool),
    field("operacaoValue", "Eclusa_Operação", Shape::Bool),
    field("alarmesAtivoValue", "Eclusa_Alarmes_Ativo", Shape::Bool),
    field("emergenciaAtivaValue", "Eclusa_Emergencia_Ativa", Shape::Bool),
    field("inundacaoValue", "Eclusa_Inundacao", Shape::Bool),
    // anciens noms gardés pour les composants front existants
    field("nivelValue", "Porta Jusante", PERCENT),
    field("motorValue", "Porta Jusante", PERCENT),
    field("portaMontanteValue", "Porta Montante", PERCENT),
    field("contrapesoDirectoValue", "PortaJusante_ContraPeso Direito", PERCENT),
    field("contrapesoEsquerdoValue", "PortaJusante_ContraPeso Esquerdo", PERCENT),
    field("portaMontanteContrapesoDirectoValue", "PortaMontante_ContraPesoDireito", PERCENT),
    field("portaMontanteContrapesoEsquerdoValue", "PortaMontante_ContraPesoEsquerdo", PERCENT),
    // moteurs des portes (0 arrêt, 1 / 2 sens de marche)
    field("motorDireitoValue", "PortaJusante_MotorDireita", MOTOR_STATE),
    field("motorEsquerdoValue", "PortaJusante_MotorEsquerda", MOTOR_STATE),
    field("portaMontanteMotorDireitoValue", "PortaMontante_MotorDireita", MOTOR_STATE),
    field("portaMontanteMotorEsquerdoValue", "PortaMontante_MotorEsquerda", MOTOR_STATE),
    // cotes calculées depuis les niveaux
    field("cotaCaldeiraValue", "Eclusa_Nivel_Caldeira", LEVEL_TO_METRES),
    field("cotaMontanteValue", "Eclusa_Nivel_Montante", LEVEL_TO_METRES),
    field("cotaJusanteValue", "Eclusa_Nivel_Jusante", LEVEL_TO_METRES),
];

/// Tableau de tags `Source[i]` déroulé en champs `prefix_i`
struct Unrolled {
    source: &'static str,
    output_prefix: &'static str,
    len: usize,
    shape: Shape,
}

const UNROLLED: &[Unrolled] = &[
    Unrolled { source: "PipeSystem", output_prefix: "pipe_system_", len: 24, shape: Shape::Bool },
    Unrolled { source: "ValvulasOnOFF", output_prefix: "valvulas_onoff_", len: 6, shape: Shape::Int { clamp: None } },
];

const SEMAFORO_COLORS: [&str; 2] = ["verde", "vermelho"];
const SEMAFOROS_PER_COLOR: usize = 4;

/// Payload envoyé aux abonnés, sérialisé à plat (+ objet `semaforos`)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryPayload {
    #[serde(flatten)]
    pub fields: BTreeMap<String, TagValue>,
    pub semaforos: BTreeMap<String, bool>,
    pub timestamp: i64,
    pub connected: bool,
}

impl TelemetryPayload {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn extract(value: Option<&TagValue>, shape: Shape) -> TagValue {
    match shape {
        Shape::Real { clamp } => {
            let v = finite(value.and_then(TagValue::as_real));
            TagValue::Real(match clamp {
                Some((lo, hi)) => v.clamp(lo, hi),
                None => v,
            })
        }
        Shape::Scaled { factor } => TagValue::Real(finite(value.and_then(TagValue::as_real)) * factor),
        Shape::Int { clamp } => {
            let v = value.and_then(TagValue::as_int).unwrap_or(0);
            TagValue::Int(match clamp {
                Some((lo, hi)) => v.clamp(lo, hi),
                None => v,
            })
        }
        Shape::Bool => TagValue::Bool(value.and_then(TagValue::as_bool).unwrap_or(false)),
    }
}

fn finite(v: Option<f32>) -> f32 {
    v.filter(|v| v.is_finite()).unwrap_or(0.0)
}

/// Construit le payload complet depuis l'ensemble des valeurs connues
pub fn build_payload(values: &ValueMap, connected: bool, captured_at: OffsetDateTime) -> TelemetryPayload {
    let mut fields = BTreeMap::new();

    for f in FIELDS {
        fields.insert(f.output.to_string(), extract(values.get(f.source), f.shape));
    }

    for array in UNROLLED {
        for i in 0..array.len {
            let source = format!("{}[{}]", array.source, i);
            fields.insert(
                format!("{}{}", array.output_prefix, i),
                extract(values.get(&source), array.shape),
            );
        }
    }

    let mut semaforos = BTreeMap::new();
    for color in SEMAFORO_COLORS {
        for i in 0..SEMAFOROS_PER_COLOR {
            let name = format!("Eclusa_Semaforo_{color}_{i}");
            let on = values.get(&name).and_then(TagValue::as_bool).unwrap_or(false);
            semaforos.insert(name, on);
        }
    }

    TelemetryPayload {
        fields,
        semaforos,
        timestamp: captured_at.unix_timestamp(),
        connected,
    }
}
