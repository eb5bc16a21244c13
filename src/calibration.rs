//! Máquina de estados de calibración.
//!
//! Un mismo ciclo `Idle → Countdown → Collecting → Complete | Failed` sirve
//! para dos objetivos:
//!
//! - **Peso corporal**: el sujeto permanece quieto y se obtiene la línea base
//!   (media y desviación típica) que usa el detector de fases.
//! - **Peso de referencia**: se coloca una masa conocida y se registra el
//!   voltaje medio; con al menos dos pesos distintos se ajusta el factor N/V.
//!
//! La cuenta atrás se deriva del tiempo de las muestras (índice / frecuencia),
//! nunca de un temporizador, así el jitter de entrega no la distorsiona.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::sample_buffer::Reading;
use crate::types::GRAVITY;

/// Por debajo de esto el peso corporal se acepta pero se marca como sospechoso
pub const LOW_BODYWEIGHT_N: f64 = 200.0;

/// CV% por encima del cual la repetibilidad es mala / dudosa
const CV_POOR_PERCENT: f64 = 5.0;
const CV_MARGINAL_PERCENT: f64 = 2.0;

/// Ventana y frecuencia del control de estabilidad (segundos)
const STABILITY_WINDOW_SECS: f64 = 0.5;
const STABILITY_CHECK_SECS: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationPhase {
    Idle,
    Countdown,
    Collecting,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CalibrationTarget {
    Bodyweight,
    ReferenceWeight { kg: f64 },
}

/// Clave de peso en gramos, para no indexar mapas con `f64`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WeightKey(i64);

impl WeightKey {
    pub fn from_kg(kg: f64) -> Self {
        WeightKey((kg * 1000.0).round() as i64)
    }

    pub fn kg(self) -> f64 {
        self.0 as f64 / 1000.0
    }
}

/// Resumen de una medición con peso de referencia
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSummary {
    pub mean_voltage: f64,
    #[serde(default)]
    pub mean_force: f64,
    #[serde(default)]
    pub sample_count: usize,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CvQuality {
    Good,
    Marginal,
    Poor,
}

impl CvQuality {
    pub fn from_cv_percent(cv: f64) -> Self {
        if cv > CV_POOR_PERCENT {
            CvQuality::Poor
        } else if cv > CV_MARGINAL_PERCENT {
            CvQuality::Marginal
        } else {
            CvQuality::Good
        }
    }
}

/// Estadísticas de repetibilidad de un peso de referencia
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightStats {
    pub weight_kg: f64,
    pub measurements: usize,
    pub mean_voltage: f64,
    pub std_voltage: f64,
    pub cv_percent: f64,
    pub mean_force: f64,
    pub quality: CvQuality,
}

/// Recta fuerza = k · voltaje ajustada por mínimos cuadrados por el origen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationCurve {
    pub n_per_volt: f64,
    pub r_squared: f64,
    pub rmse_n: f64,
    pub weights_used: usize,
}

impl CalibrationCurve {
    /// Diferencia porcentual respecto al factor vigente
    pub fn percent_change(&self, current_n_per_volt: f64) -> f64 {
        if current_n_per_volt == 0.0 {
            return f64::INFINITY;
        }
        (self.n_per_volt - current_n_per_volt).abs() / current_n_per_volt * 100.0
    }
}

/// Línea base de peso corporal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyweightBaseline {
    pub bodyweight_n: f64,
    pub std_n: f64,
    pub sample_count: usize,
    /// Índice de la última muestra usada
    pub completed_at_index: u64,
    pub completed_at: f64,
}

impl BodyweightBaseline {
    pub fn is_low(&self) -> bool {
        self.bodyweight_n < LOW_BODYWEIGHT_N
    }

    pub fn mass_kg(&self) -> f64 {
        self.bodyweight_n / GRAVITY
    }
}

/// Copia de solo lectura del estado de calibración
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSnapshot {
    pub phase: CalibrationPhase,
    pub target: Option<CalibrationTarget>,
    /// Segundos enteros restantes para mostrar (0 fuera de la cuenta atrás)
    pub countdown_remaining: u32,
    pub collected_samples: usize,
    pub bodyweight: Option<BodyweightBaseline>,
    pub weights: Vec<WeightStats>,
    pub curve: Option<CalibrationCurve>,
    pub failure: Option<PipelineError>,
    pub measurements_per_weight: usize,
}

pub struct CalibrationEngine {
    countdown_secs: f64,
    window_secs: f64,
    min_samples: usize,
    window_samples: usize,
    measurements_per_weight: usize,
    stability_std_n: f64,
    stability_window: usize,
    stability_every: usize,

    phase: CalibrationPhase,
    target: Option<CalibrationTarget>,
    countdown_start: Option<f64>,
    countdown_display: u32,
    collect_start: Option<f64>,
    forces: Vec<f64>,
    volts: Vec<f64>,
    last_index: u64,

    measurements: BTreeMap<WeightKey, Vec<MeasurementSummary>>,
    bodyweight: Option<BodyweightBaseline>,
    curve: Option<CalibrationCurve>,
    failure: Option<PipelineError>,
}

impl CalibrationEngine {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            countdown_secs: config.calibration_countdown_secs,
            window_secs: config.calibration_window_secs,
            min_samples: config.min_calibration_samples,
            window_samples: config.secs_to_samples(config.calibration_window_secs),
            measurements_per_weight: config.measurements_per_weight,
            stability_std_n: config.stability_std_n,
            stability_window: config
                .secs_to_samples(STABILITY_WINDOW_SECS)
                .min(config.secs_to_samples(config.calibration_window_secs))
                .max(2),
            stability_every: config.secs_to_samples(STABILITY_CHECK_SECS).max(1),
            phase: CalibrationPhase::Idle,
            target: None,
            countdown_start: None,
            countdown_display: 0,
            collect_start: None,
            forces: Vec::new(),
            volts: Vec::new(),
            last_index: 0,
            measurements: BTreeMap::new(),
            bodyweight: None,
            curve: None,
            failure: None,
        }
    }

    /// Inicia una medición (`Idle/Complete/Failed → Countdown`).
    ///
    /// Se rechaza sin tocar el estado si la adquisición no está activa, si la
    /// plataforma no está a cero (solo pesos de referencia) o si ya hay una
    /// medición en curso.
    pub fn start(
        &mut self,
        target: CalibrationTarget,
        ingestion_active: bool,
        plate_zeroed: bool,
    ) -> Result<()> {
        if !ingestion_active {
            return Err(PipelineError::precondition(
                "calibration requested while ingestion is not active",
            ));
        }
        if self.is_running() {
            return Err(PipelineError::precondition("a calibration is already running"));
        }
        if let CalibrationTarget::ReferenceWeight { kg } = target {
            if !plate_zeroed {
                return Err(PipelineError::precondition("plate has not been zeroed"));
            }
            if !kg.is_finite() || kg < 0.0 {
                return Err(PipelineError::precondition(format!(
                    "invalid reference weight {} kg",
                    kg
                )));
            }
            let recorded = self.measurement_count(kg);
            if recorded >= self.measurements_per_weight {
                return Err(PipelineError::precondition(format!(
                    "already have {} measurements for {:.2} kg",
                    recorded, kg
                )));
            }
        }

        // El peso corporal anterior sigue vigente hasta que la nueva medición se acepte
        self.phase = CalibrationPhase::Countdown;
        self.target = Some(target);
        self.countdown_start = None;
        self.countdown_display = self.countdown_secs.ceil() as u32;
        self.collect_start = None;
        self.forces.clear();
        self.volts.clear();
        self.failure = None;

        info!(?target, countdown = self.countdown_secs, "Calibración iniciada");
        Ok(())
    }

    /// Procesa una muestra. Devuelve `true` si cambió algo visible
    /// (fase o segundos de la cuenta atrás).
    pub fn feed(&mut self, reading: &Reading) -> bool {
        let t = reading.sample.timestamp;
        self.last_index = reading.sample.index;

        match self.phase {
            CalibrationPhase::Countdown => {
                let start = *self.countdown_start.get_or_insert(t);
                let remaining = (self.countdown_secs - (t - start)).max(0.0);

                if remaining <= 0.0 {
                    self.phase = CalibrationPhase::Collecting;
                    self.countdown_display = 0;
                    self.collect_start = Some(t);
                    self.collect(reading);
                    debug!(at = t, "Cuenta atrás terminada, recogiendo muestras");
                    return true;
                }

                let display = remaining.ceil() as u32;
                let changed = display != self.countdown_display;
                self.countdown_display = display;
                changed
            }

            CalibrationPhase::Collecting => {
                self.collect(reading);

                if self.target == Some(CalibrationTarget::Bodyweight) && self.is_unstable() {
                    // Demasiado movimiento: reiniciar la ventana de recogida
                    warn!(
                        std = std_dev(self.recent_forces()),
                        "Sujeto inestable, reiniciando la medición de peso corporal"
                    );
                    self.collect_start = Some(t);
                    self.forces.clear();
                    self.volts.clear();
                    self.collect(reading);
                    return false;
                }

                let start = self.collect_start.unwrap_or(t);
                if t - start >= self.window_secs {
                    self.finish_measurement();
                    return true;
                }
                false
            }

            CalibrationPhase::Idle | CalibrationPhase::Complete | CalibrationPhase::Failed => false,
        }
    }

    fn collect(&mut self, reading: &Reading) {
        self.forces.push(reading.sample.force);
        self.volts.push(reading.volts);
    }

    fn recent_forces(&self) -> &[f64] {
        let start = self.forces.len().saturating_sub(self.stability_window);
        &self.forces[start..]
    }

    fn is_unstable(&self) -> bool {
        self.forces.len() >= self.stability_window
            && self.forces.len() % self.stability_every == 0
            && std_dev(self.recent_forces()) > self.stability_std_n
    }

    /// La adquisición se detuvo: una medición en curso queda incompleta
    pub fn ingestion_stopped(&mut self) -> bool {
        match self.phase {
            CalibrationPhase::Countdown | CalibrationPhase::Collecting => {
                let expected = self.expected_samples();
                let actual = self.forces.len();
                self.fail(PipelineError::InsufficientSamples { expected, actual });
                true
            }
            _ => false,
        }
    }

    fn expected_samples(&self) -> usize {
        self.window_samples.max(self.min_samples)
    }

    fn finish_measurement(&mut self) {
        let count = self.forces.len();
        if count < self.min_samples {
            self.fail(PipelineError::InsufficientSamples {
                expected: self.min_samples,
                actual: count,
            });
            return;
        }

        let mean_force = mean(&self.forces);
        let mean_voltage = mean(&self.volts);

        match self.target {
            Some(CalibrationTarget::Bodyweight) => {
                let baseline = BodyweightBaseline {
                    bodyweight_n: mean_force,
                    std_n: std_dev(&self.forces),
                    sample_count: count,
                    completed_at_index: self.last_index,
                    completed_at: self.collect_start.unwrap_or(0.0) + self.window_secs,
                };
                if baseline.is_low() {
                    warn!(
                        bodyweight = baseline.bodyweight_n,
                        "Peso corporal estimado bajo"
                    );
                }
                info!(
                    bodyweight = baseline.bodyweight_n,
                    std = baseline.std_n,
                    samples = count,
                    "Calibración de peso corporal completa"
                );
                self.bodyweight = Some(baseline);
            }
            Some(CalibrationTarget::ReferenceWeight { kg }) => {
                let summary = MeasurementSummary {
                    mean_voltage,
                    mean_force,
                    sample_count: count,
                    timestamp: Some(Utc::now()),
                };
                let list = self.measurements.entry(WeightKey::from_kg(kg)).or_default();
                list.push(summary);
                info!(
                    kg,
                    mean_voltage,
                    measurement = list.len(),
                    of = self.measurements_per_weight,
                    "Medición con peso de referencia aceptada"
                );
            }
            None => {}
        }

        self.phase = CalibrationPhase::Complete;
        self.forces.clear();
        self.volts.clear();
    }

    fn fail(&mut self, error: PipelineError) {
        warn!(%error, target = ?self.target, "Calibración fallida");
        self.phase = CalibrationPhase::Failed;
        self.forces.clear();
        self.volts.clear();
        self.failure = Some(error);
    }

    /// Descarta la medición en curso; lo recogido no se mezcla con lo aceptado
    pub fn abort(&mut self) -> bool {
        if !self.is_running() {
            return false;
        }
        info!(target = ?self.target, "Calibración cancelada");
        self.phase = CalibrationPhase::Idle;
        self.target = None;
        self.countdown_start = None;
        self.countdown_display = 0;
        self.collect_start = None;
        self.forces.clear();
        self.volts.clear();
        true
    }

    /// Ajusta el factor N/V con las mediciones aceptadas.
    ///
    /// Con menos de dos pesos distintos pasa a `Failed` y borra la curva
    /// anterior para no mostrar datos obsoletos.
    pub fn complete(&mut self) -> Result<CalibrationCurve> {
        if self.is_running() {
            return Err(PipelineError::precondition("a measurement is still running"));
        }

        let points: Vec<(f64, Vec<MeasurementSummary>)> = self
            .measurements
            .iter()
            .map(|(k, list)| (k.kg(), list.clone()))
            .collect();

        match fit_curve(&points) {
            Ok(curve) => {
                info!(
                    n_per_volt = curve.n_per_volt,
                    r_squared = curve.r_squared,
                    rmse = curve.rmse_n,
                    "Curva de calibración ajustada"
                );
                self.curve = Some(curve.clone());
                self.phase = CalibrationPhase::Complete;
                self.failure = None;
                Ok(curve)
            }
            Err(error) => {
                self.curve = None;
                self.fail(error.clone());
                Err(error)
            }
        }
    }

    /// Elimina una medición concreta de un peso; si queda vacío se quita el peso
    pub fn remove_measurement(&mut self, kg: f64, position: usize) -> bool {
        let key = WeightKey::from_kg(kg);
        let Some(list) = self.measurements.get_mut(&key) else {
            return false;
        };
        if position >= list.len() {
            return false;
        }
        list.remove(position);
        if list.is_empty() {
            self.measurements.remove(&key);
        }
        self.curve = None;
        true
    }

    /// Borra todas las mediciones de referencia y la curva
    pub fn clear_measurements(&mut self) {
        self.measurements.clear();
        self.curve = None;
    }

    /// Sustituye las mediciones (p. ej. al cargar un registro guardado)
    pub fn load_measurements(&mut self, measurements: BTreeMap<WeightKey, Vec<MeasurementSummary>>) {
        self.measurements = measurements;
        self.curve = None;
    }

    pub fn measurements(&self) -> &BTreeMap<WeightKey, Vec<MeasurementSummary>> {
        &self.measurements
    }

    pub fn measurement_count(&self, kg: f64) -> usize {
        self.measurements
            .get(&WeightKey::from_kg(kg))
            .map(|l| l.len())
            .unwrap_or(0)
    }

    pub fn weight_stats(&self) -> Vec<WeightStats> {
        self.measurements
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(key, list)| weight_stats(key.kg(), list))
            .collect()
    }

    pub fn snapshot(&self) -> CalibrationSnapshot {
        CalibrationSnapshot {
            phase: self.phase,
            target: self.target,
            countdown_remaining: if self.phase == CalibrationPhase::Countdown {
                self.countdown_display
            } else {
                0
            },
            collected_samples: self.forces.len(),
            bodyweight: self.bodyweight.clone(),
            weights: self.weight_stats(),
            curve: self.curve.clone(),
            failure: self.failure.clone(),
            measurements_per_weight: self.measurements_per_weight,
        }
    }

    pub fn phase(&self) -> CalibrationPhase {
        self.phase
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.phase,
            CalibrationPhase::Countdown | CalibrationPhase::Collecting
        )
    }

    pub fn bodyweight(&self) -> Option<&BodyweightBaseline> {
        self.bodyweight.as_ref()
    }

    pub fn curve(&self) -> Option<&CalibrationCurve> {
        self.curve.as_ref()
    }

    /// Vuelve al estado inicial conservando las mediciones de referencia
    pub fn reset(&mut self) {
        self.abort();
        self.phase = CalibrationPhase::Idle;
        self.target = None;
        self.bodyweight = None;
        self.failure = None;
    }
}

/// Ajusta `F = k·V` con el voltaje medio de cada peso de referencia
pub fn fit_curve(points: &[(f64, Vec<MeasurementSummary>)]) -> Result<CalibrationCurve> {
    let mut by_weight: BTreeMap<WeightKey, Vec<f64>> = BTreeMap::new();
    for (kg, list) in points {
        by_weight
            .entry(WeightKey::from_kg(*kg))
            .or_default()
            .extend(list.iter().map(|m| m.mean_voltage));
    }
    by_weight.retain(|_, v| !v.is_empty());

    let distinct = by_weight.len();
    let nonzero = by_weight.keys().filter(|k| k.0 != 0).count();
    if distinct < 2 || nonzero == 0 {
        return Err(PipelineError::InsufficientCalibrationPoints { distinct });
    }

    let forces: Vec<f64> = by_weight.keys().map(|k| k.kg() * GRAVITY).collect();
    let voltages: Vec<f64> = by_weight.values().map(|v| mean(v)).collect();

    let sum_fv: f64 = forces.iter().zip(&voltages).map(|(f, v)| f * v).sum();
    let sum_vv: f64 = voltages.iter().map(|v| v * v).sum();
    if sum_vv <= f64::EPSILON {
        return Err(PipelineError::InsufficientCalibrationPoints { distinct });
    }
    let slope = sum_fv / sum_vv;

    let mean_f = mean(&forces);
    let ss_res: f64 = forces
        .iter()
        .zip(&voltages)
        .map(|(f, v)| (f - slope * v).powi(2))
        .sum();
    let ss_tot: f64 = forces.iter().map(|f| (f - mean_f).powi(2)).sum();
    let r_squared = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 0.0 };
    let rmse_n = (ss_res / forces.len() as f64).sqrt();

    Ok(CalibrationCurve {
        n_per_volt: slope,
        r_squared,
        rmse_n,
        weights_used: distinct,
    })
}

/// Media, desviación típica y CV% de las mediciones de un peso
pub fn weight_stats(weight_kg: f64, list: &[MeasurementSummary]) -> WeightStats {
    let voltages: Vec<f64> = list.iter().map(|m| m.mean_voltage).collect();
    let forces: Vec<f64> = list.iter().map(|m| m.mean_force).collect();
    let mean_voltage = mean(&voltages);
    let std_voltage = if voltages.len() > 1 { std_dev(&voltages) } else { 0.0 };
    let cv_percent = if mean_voltage.abs() > f64::EPSILON && voltages.len() > 1 {
        std_voltage / mean_voltage.abs() * 100.0
    } else {
        0.0
    };

    WeightStats {
        weight_kg,
        measurements: list.len(),
        mean_voltage,
        std_voltage,
        cv_percent,
        mean_force: mean(&forces),
        quality: CvQuality::from_cv_percent(cv_percent),
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Desviación típica poblacional
fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Sample;

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            calibration_countdown_secs: 0.1,
            calibration_window_secs: 0.2,
            ..Default::default()
        }
    }

    fn reading(index: u64, force: f64, volts: f64) -> Reading {
        Reading {
            sample: Sample {
                index,
                timestamp: index as f64 / 1000.0,
                force,
            },
            volts,
        }
    }

    /// Alimenta muestras constantes hasta que la medición termina
    fn run_measurement(engine: &mut CalibrationEngine, next: &mut u64, force: f64, volts: f64) {
        for _ in 0..1000 {
            engine.feed(&reading(*next, force, volts));
            *next += 1;
            if !engine.is_running() {
                return;
            }
        }
        panic!("measurement did not finish");
    }

    #[test]
    fn test_start_requires_ingestion() {
        let mut engine = CalibrationEngine::new(&test_config());
        let err = engine
            .start(CalibrationTarget::Bodyweight, false, true)
            .unwrap_err();
        assert!(matches!(err, PipelineError::PreconditionNotMet(_)));
        assert_eq!(engine.phase(), CalibrationPhase::Idle);
    }

    #[test]
    fn test_reference_weight_requires_zeroed_plate() {
        let mut engine = CalibrationEngine::new(&test_config());
        let err = engine
            .start(CalibrationTarget::ReferenceWeight { kg: 10.0 }, true, false)
            .unwrap_err();
        assert!(matches!(err, PipelineError::PreconditionNotMet(_)));
        assert_eq!(engine.phase(), CalibrationPhase::Idle);
    }

    #[test]
    fn test_countdown_from_sample_time() {
        let config = PipelineConfig {
            calibration_countdown_secs: 3.0,
            calibration_window_secs: 3.0,
            ..Default::default()
        };
        let mut engine = CalibrationEngine::new(&config);
        engine.start(CalibrationTarget::Bodyweight, true, true).unwrap();
        assert_eq!(engine.snapshot().countdown_remaining, 3);

        // 1.5 s de muestras → quedan 2 s (redondeo hacia arriba)
        for i in 0..1501 {
            engine.feed(&reading(i, 700.0, 2.14));
        }
        assert_eq!(engine.phase(), CalibrationPhase::Countdown);
        assert_eq!(engine.snapshot().countdown_remaining, 2);

        for i in 1501..3001 {
            engine.feed(&reading(i, 700.0, 2.14));
        }
        assert_eq!(engine.phase(), CalibrationPhase::Collecting);
        assert_eq!(engine.snapshot().countdown_remaining, 0);
    }

    #[test]
    fn test_bodyweight_baseline() {
        let mut engine = CalibrationEngine::new(&test_config());
        engine.start(CalibrationTarget::Bodyweight, true, true).unwrap();

        let mut next = 0;
        for _ in 0..2000 {
            let force = if next % 2 == 0 { 702.0 } else { 698.0 };
            engine.feed(&reading(next, force, 2.14));
            next += 1;
            if !engine.is_running() {
                break;
            }
        }

        assert_eq!(engine.phase(), CalibrationPhase::Complete);
        let baseline = engine.bodyweight().unwrap();
        assert!((baseline.bodyweight_n - 700.0).abs() < 0.1);
        assert!((baseline.std_n - 2.0).abs() < 0.1);
        assert!(!baseline.is_low());
    }

    #[test]
    fn test_failed_recalibration_keeps_previous_bodyweight() {
        let mut engine = CalibrationEngine::new(&test_config());
        let mut next = 0;
        engine.start(CalibrationTarget::Bodyweight, true, true).unwrap();
        run_measurement(&mut engine, &mut next, 700.0, 2.14);

        // Cancelada a mitad de la ventana
        engine.start(CalibrationTarget::Bodyweight, true, true).unwrap();
        for _ in 0..150 {
            engine.feed(&reading(next, 640.0, 1.96));
            next += 1;
        }
        assert!(engine.abort());
        assert!((engine.bodyweight().unwrap().bodyweight_n - 700.0).abs() < 1e-9);

        // Interrumpida por fin de adquisición
        engine.start(CalibrationTarget::Bodyweight, true, true).unwrap();
        engine.feed(&reading(next, 640.0, 1.96));
        assert!(engine.ingestion_stopped());
        assert_eq!(engine.phase(), CalibrationPhase::Failed);
        assert!((engine.snapshot().bodyweight.unwrap().bodyweight_n - 700.0).abs() < 1e-9);

        // Una medición aceptada sí sustituye la anterior
        engine.start(CalibrationTarget::Bodyweight, true, true).unwrap();
        run_measurement(&mut engine, &mut next, 640.0, 1.96);
        assert!((engine.bodyweight().unwrap().bodyweight_n - 640.0).abs() < 1e-9);
    }

    #[test]
    fn test_unstable_subject_restarts_window() {
        let mut engine = CalibrationEngine::new(&test_config());
        engine.start(CalibrationTarget::Bodyweight, true, true).unwrap();

        // Cuenta atrás + 150 ms estables, luego balanceo de ±60 N
        let mut next = 0;
        for _ in 0..250 {
            engine.feed(&reading(next, 700.0, 2.14));
            next += 1;
        }
        for _ in 0..600 {
            let force = if (next / 50) % 2 == 0 { 760.0 } else { 640.0 };
            engine.feed(&reading(next, force, 2.14));
            next += 1;
        }
        // Nunca se completa mientras se mueve
        assert_eq!(engine.phase(), CalibrationPhase::Collecting);

        run_measurement(&mut engine, &mut next, 700.0, 2.14);
        assert_eq!(engine.phase(), CalibrationPhase::Complete);
        assert!((engine.bodyweight().unwrap().bodyweight_n - 700.0).abs() < 1e-9);
    }

    #[test]
    fn test_two_weights_fit_curve() {
        let mut engine = CalibrationEngine::new(&test_config());
        let true_factor = 300.0;
        let mut next = 0;

        for (kg, offset_noise) in [(0.0, [0.0005, -0.0005]), (10.0, [0.001, -0.001])] {
            for noise in offset_noise {
                engine
                    .start(CalibrationTarget::ReferenceWeight { kg }, true, true)
                    .unwrap();
                let volts = kg * GRAVITY / true_factor + noise;
                run_measurement(&mut engine, &mut next, volts * 327.0, volts);
                assert_eq!(engine.phase(), CalibrationPhase::Complete);
            }
        }

        assert_eq!(engine.measurement_count(10.0), 2);
        let curve = engine.complete().unwrap();
        assert!((curve.n_per_volt - true_factor).abs() < 1.0, "{}", curve.n_per_volt);
        assert_eq!(curve.weights_used, 2);
        assert!(engine.snapshot().curve.is_some());
    }

    #[test]
    fn test_single_weight_fails_and_clears_curve() {
        let mut engine = CalibrationEngine::new(&test_config());
        let mut next = 0;

        for kg in [5.0, 10.0] {
            engine
                .start(CalibrationTarget::ReferenceWeight { kg }, true, true)
                .unwrap();
            run_measurement(&mut engine, &mut next, kg * GRAVITY, kg * GRAVITY / 327.0);
        }
        assert!(engine.complete().is_ok());
        assert!(engine.curve().is_some());

        // Quitar un peso deja una sola referencia
        assert!(engine.remove_measurement(5.0, 0));
        let err = engine.complete().unwrap_err();
        assert_eq!(err, PipelineError::InsufficientCalibrationPoints { distinct: 1 });
        assert_eq!(engine.phase(), CalibrationPhase::Failed);
        assert!(engine.curve().is_none());
        assert!(engine.snapshot().curve.is_none());
    }

    #[test]
    fn test_measurement_limit_per_weight() {
        let config = PipelineConfig {
            measurements_per_weight: 1,
            ..test_config()
        };
        let mut engine = CalibrationEngine::new(&config);
        let mut next = 0;
        engine
            .start(CalibrationTarget::ReferenceWeight { kg: 10.0 }, true, true)
            .unwrap();
        run_measurement(&mut engine, &mut next, 98.1, 0.3);

        let err = engine
            .start(CalibrationTarget::ReferenceWeight { kg: 10.0 }, true, true)
            .unwrap_err();
        assert!(matches!(err, PipelineError::PreconditionNotMet(_)));
    }

    #[test]
    fn test_insufficient_samples_keeps_prior_measurements() {
        let mut engine = CalibrationEngine::new(&test_config());
        let mut next = 0;
        engine
            .start(CalibrationTarget::ReferenceWeight { kg: 10.0 }, true, true)
            .unwrap();
        run_measurement(&mut engine, &mut next, 98.1, 0.3);

        // Segunda medición interrumpida al parar la adquisición
        engine
            .start(CalibrationTarget::ReferenceWeight { kg: 10.0 }, true, true)
            .unwrap();
        for _ in 0..5 {
            engine.feed(&reading(next, 98.1, 0.3));
            next += 1;
        }
        assert!(engine.ingestion_stopped());

        assert_eq!(engine.phase(), CalibrationPhase::Failed);
        let snapshot = engine.snapshot();
        assert!(matches!(
            snapshot.failure,
            Some(PipelineError::InsufficientSamples { .. })
        ));
        assert_eq!(engine.measurement_count(10.0), 1);
    }

    #[test]
    fn test_abort_discards_partial_measurement() {
        let mut engine = CalibrationEngine::new(&test_config());
        engine
            .start(CalibrationTarget::ReferenceWeight { kg: 20.0 }, true, true)
            .unwrap();
        for i in 0..150 {
            engine.feed(&reading(i, 196.2, 0.6));
        }
        assert!(engine.abort());
        assert_eq!(engine.phase(), CalibrationPhase::Idle);
        assert_eq!(engine.measurement_count(20.0), 0);
        assert!(!engine.abort());
    }

    #[test]
    fn test_cv_quality_flags() {
        assert_eq!(CvQuality::from_cv_percent(1.0), CvQuality::Good);
        assert_eq!(CvQuality::from_cv_percent(3.0), CvQuality::Marginal);
        assert_eq!(CvQuality::from_cv_percent(7.5), CvQuality::Poor);

        let list: Vec<MeasurementSummary> = [1.0, 1.1, 0.9]
            .iter()
            .map(|&v| MeasurementSummary {
                mean_voltage: v,
                mean_force: v * 327.0,
                sample_count: 3000,
                timestamp: None,
            })
            .collect();
        let stats = weight_stats(10.0, &list);
        assert!((stats.mean_voltage - 1.0).abs() < 1e-12);
        assert!((stats.cv_percent - 8.1649658).abs() < 1e-4);
        assert_eq!(stats.quality, CvQuality::Poor);
    }

    #[test]
    fn test_fit_curve_rejects_only_zero_weights() {
        let summary = MeasurementSummary {
            mean_voltage: 0.0,
            mean_force: 0.0,
            sample_count: 100,
            timestamp: None,
        };
        let err = fit_curve(&[(0.0, vec![summary])]).unwrap_err();
        assert_eq!(err, PipelineError::InsufficientCalibrationPoints { distinct: 1 });
    }
}
