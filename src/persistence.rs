//! Registro de calibración en JSON.
//!
//! Formato actual: cada peso de referencia (clave en kg) guarda una lista de
//! mediciones. Al cargar se aceptan también las formas antiguas (un único
//! voltaje por peso, pares `[voltaje, fuerza]`, o `calibration_points`) y se
//! convierten a lista sin avisar.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::calibration::{weight_stats, CalibrationEngine, MeasurementSummary, WeightKey, WeightStats};
use crate::types::{GRAVITY, N_PER_VOLT};

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid reference weight key {0:?}")]
    InvalidWeight(String),
}

/// Calibración persistida
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationRecord {
    pub n_per_volt: f64,
    pub weights: BTreeMap<WeightKey, Vec<MeasurementSummary>>,
    pub r_squared: Option<f64>,
    pub rmse_n: Option<f64>,
    pub measurements_per_weight: usize,
    pub saved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum StoredMeasurement {
    Pair(f64, f64),
    Summary(MeasurementSummary),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum StoredWeight {
    Single(f64),
    Many(Vec<StoredMeasurement>),
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    #[serde(default = "default_n_per_volt")]
    n_per_volt: f64,
    #[serde(default)]
    calibration_weights: BTreeMap<String, StoredWeight>,
    /// `[fuerza real N, voltaje, fuerza medida N]`
    #[serde(default, skip_serializing)]
    calibration_points: Vec<Vec<f64>>,
    #[serde(default, skip_deserializing)]
    weight_statistics: BTreeMap<String, WeightStats>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    r_squared: Option<f64>,
    #[serde(default)]
    rmse: Option<f64>,
    #[serde(default)]
    measurements_per_weight: Option<usize>,
}

fn default_n_per_volt() -> f64 {
    N_PER_VOLT
}

fn weight_label(key: WeightKey) -> String {
    format!("{}", key.kg())
}

/// Acepta RFC 3339 y el formato ISO sin zona horaria de registros antiguos
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|t| t.and_utc())
        })
}

impl CalibrationRecord {
    pub fn new(n_per_volt: f64, measurements_per_weight: usize) -> Self {
        Self {
            n_per_volt,
            weights: BTreeMap::new(),
            r_squared: None,
            rmse_n: None,
            measurements_per_weight,
            saved_at: None,
        }
    }

    /// Instantánea del motor de calibración con el factor N/V vigente
    pub fn from_engine(engine: &CalibrationEngine, n_per_volt: f64) -> Self {
        let snapshot = engine.snapshot();
        Self {
            n_per_volt,
            weights: engine.measurements().clone(),
            r_squared: snapshot.curve.as_ref().map(|c| c.r_squared),
            rmse_n: snapshot.curve.as_ref().map(|c| c.rmse_n),
            measurements_per_weight: snapshot.measurements_per_weight,
            saved_at: None,
        }
    }

    /// Carga las mediciones en el motor (sustituye las que hubiera)
    pub fn apply_to(&self, engine: &mut CalibrationEngine) {
        engine.load_measurements(self.weights.clone());
    }

    pub fn measurement_count(&self) -> usize {
        self.weights.values().map(Vec::len).sum()
    }

    pub fn from_json(content: &str) -> Result<Self, RecordError> {
        let stored: StoredRecord = serde_json::from_str(content)?;

        let mut weights: BTreeMap<WeightKey, Vec<MeasurementSummary>> = BTreeMap::new();
        for (label, stored_weight) in stored.calibration_weights {
            let kg: f64 = label
                .trim()
                .parse()
                .map_err(|_| RecordError::InvalidWeight(label.clone()))?;
            if !kg.is_finite() || kg < 0.0 {
                return Err(RecordError::InvalidWeight(label));
            }

            let list = match stored_weight {
                StoredWeight::Single(voltage) => vec![legacy_summary(voltage, kg * GRAVITY)],
                StoredWeight::Many(items) => items
                    .into_iter()
                    .map(|item| match item {
                        StoredMeasurement::Pair(voltage, force) => legacy_summary(voltage, force),
                        StoredMeasurement::Summary(summary) => summary,
                    })
                    .collect(),
            };
            weights.entry(WeightKey::from_kg(kg)).or_default().extend(list);
        }

        if weights.is_empty() && !stored.calibration_points.is_empty() {
            debug!(
                points = stored.calibration_points.len(),
                "Convirtiendo calibration_points antiguos"
            );
            for point in &stored.calibration_points {
                let &[actual_n, voltage, measured_n] = point.as_slice() else {
                    return Err(RecordError::InvalidWeight(format!("{:?}", point)));
                };
                weights
                    .entry(WeightKey::from_kg(actual_n / GRAVITY))
                    .or_default()
                    .push(legacy_summary(voltage, measured_n));
            }
        }

        Ok(Self {
            n_per_volt: stored.n_per_volt,
            weights,
            r_squared: stored.r_squared,
            rmse_n: stored.rmse,
            measurements_per_weight: stored.measurements_per_weight.unwrap_or(3),
            saved_at: stored.timestamp.as_deref().and_then(parse_timestamp),
        })
    }

    pub fn to_json(&self) -> Result<String, RecordError> {
        let stored = StoredRecord {
            n_per_volt: self.n_per_volt,
            calibration_weights: self
                .weights
                .iter()
                .map(|(key, list)| {
                    let items = list.iter().cloned().map(StoredMeasurement::Summary).collect();
                    (weight_label(*key), StoredWeight::Many(items))
                })
                .collect(),
            calibration_points: Vec::new(),
            weight_statistics: self
                .weights
                .iter()
                .filter(|(_, list)| !list.is_empty())
                .map(|(key, list)| (weight_label(*key), weight_stats(key.kg(), list)))
                .collect(),
            timestamp: self.saved_at.map(|t| t.to_rfc3339()),
            r_squared: self.r_squared,
            rmse: self.rmse_n,
            measurements_per_weight: Some(self.measurements_per_weight),
        };
        Ok(serde_json::to_string_pretty(&stored)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RecordError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let record = Self::from_json(&content)?;
        info!(
            ?path,
            weights = record.weights.len(),
            measurements = record.measurement_count(),
            n_per_volt = record.n_per_volt,
            "Calibración cargada"
        );
        Ok(record)
    }

    /// Guarda el registro marcando la hora de guardado
    pub fn save(&mut self, path: impl AsRef<Path>) -> Result<(), RecordError> {
        let path = path.as_ref();
        self.saved_at = Some(Utc::now());
        let json = self.to_json()?;

        // Escribir aparte y renombrar: nunca queda un fichero a medias
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;

        info!(?path, measurements = self.measurement_count(), "Calibración guardada");
        Ok(())
    }
}

fn legacy_summary(mean_voltage: f64, mean_force: f64) -> MeasurementSummary {
    MeasurementSummary {
        mean_voltage,
        mean_force,
        sample_count: 0,
        timestamp: None,
    }
}
