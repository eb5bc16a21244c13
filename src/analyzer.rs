//! Análisis posterior de un salto detectado.
//!
//! Sobre la ventana capturada se calculan dos alturas independientes:
//!
//! - **Tiempo de vuelo**: `h = ½·g·t²` con despegue y aterrizaje interpolados
//!   entre las dos muestras crudas que cruzan el umbral.
//! - **Impulso-momento**: integral de la fuerza neta filtrada durante la
//!   propulsión → velocidad de despegue → `h = v² / 2g`.
//!
//! Ambas se reportan juntas; no se promedian ni se reconcilian.

use tracing::{debug, info};

use crate::calibration::{BodyweightBaseline, LOW_BODYWEIGHT_N};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::filter::LowPassFilter;
use crate::sample_buffer::SampleBuffer;
use crate::types::{JumpMetrics, JumpWindow, QualityFlag, Sample, GRAVITY};

/// Suelo del umbral de inicio de movimiento cuando la SD calibrada es ~0
const MIN_ONSET_DELTA_N: f64 = 10.0;

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzerParams {
    pub sample_rate: f64,
    pub flight_threshold_n: f64,
    pub movement_delta_n: f64,
    pub landing_window_samples: usize,
    pub min_flight_time_secs: f64,
    pub max_typical_flight_time_secs: f64,
    pub height_agreement_tolerance: f64,
}

impl AnalyzerParams {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            sample_rate: config.sample_rate_hz,
            flight_threshold_n: config.flight_threshold_n,
            movement_delta_n: config.movement_delta_n,
            landing_window_samples: config.secs_to_samples(config.landing_window_secs),
            min_flight_time_secs: config.min_flight_time_secs,
            max_typical_flight_time_secs: config.max_typical_flight_time_secs,
            height_agreement_tolerance: config.height_agreement_tolerance,
        }
    }
}

pub struct EventAnalyzer {
    params: AnalyzerParams,
    filter: LowPassFilter,
}

impl EventAnalyzer {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        Ok(Self {
            params: AnalyzerParams::from_config(config),
            filter: LowPassFilter::from_config(config)?,
        })
    }

    pub fn params(&self) -> &AnalyzerParams {
        &self.params
    }

    /// Extrae la ventana del buffer y la analiza.
    ///
    /// Si el margen previo ya fue desalojado se usa lo que quede, siempre que
    /// el inicio de movimiento siga disponible.
    pub fn analyze(
        &self,
        window: &JumpWindow,
        buffer: &SampleBuffer,
        baseline: &BodyweightBaseline,
    ) -> Result<JumpMetrics> {
        let start = window.start_index.max(buffer.oldest_index());
        if start > window.movement_start_index {
            return Err(PipelineError::RangeUnavailable {
                requested: buffer.timestamp_of(window.movement_start_index),
                oldest: buffer.timestamp_of(buffer.oldest_index()),
            });
        }
        let samples = buffer.slice_indices(start, window.end_index)?;
        self.analyze_samples(window, &samples, baseline)
    }

    /// Analiza muestras contiguas que empiezan en o antes del inicio de movimiento
    pub fn analyze_samples(
        &self,
        window: &JumpWindow,
        samples: &[Sample],
        baseline: &BodyweightBaseline,
    ) -> Result<JumpMetrics> {
        let Some(first) = samples.first() else {
            return Err(PipelineError::incomplete("window holds no samples"));
        };
        let base = first.index;
        let last_index = base + samples.len() as u64 - 1;

        if window.movement_start_index < base
            || window.takeoff_index < window.movement_start_index
            || window.landing_index <= window.takeoff_index
            || window.landing_index > last_index
        {
            return Err(PipelineError::incomplete(format!(
                "samples {}..={} do not cover a full standing-flight-landing cycle",
                base, last_index
            )));
        }

        let raw: Vec<f64> = samples.iter().map(|s| s.force).collect();
        let filtered = self.filter.filtfilt(&raw)?;

        let rel = |index: u64| (index - base) as usize;
        let dt = 1.0 / self.params.sample_rate;
        let time_at = |position: f64| first.timestamp + position * dt;
        let bodyweight = baseline.bodyweight_n;
        let threshold = self.params.flight_threshold_n;

        // 1. Despegue y aterrizaje con precisión sub-muestra
        let takeoff_pos = down_crossing(&raw, threshold, rel(window.takeoff_index))
            .ok_or_else(|| PipelineError::incomplete("no takeoff crossing before flight"))?;
        let landing_pos = up_crossing(&raw, threshold, rel(window.landing_index))
            .ok_or_else(|| PipelineError::incomplete("no landing crossing after flight"))?;
        if landing_pos <= takeoff_pos {
            return Err(PipelineError::incomplete("landing precedes takeoff"));
        }

        let takeoff_timestamp = time_at(takeoff_pos);
        let landing_timestamp = time_at(landing_pos);
        let flight_time = landing_timestamp - takeoff_timestamp;
        let height_flight = 0.5 * GRAVITY * flight_time * flight_time;

        // 2. Inicio de movimiento refinado sobre la señal filtrada
        let onset_delta = (5.0 * baseline.std_n)
            .max(MIN_ONSET_DELTA_N)
            .min(self.params.movement_delta_n);
        let onset = movement_onset(
            &filtered,
            bodyweight,
            onset_delta,
            rel(window.movement_start_index),
        );
        let movement_start_timestamp = time_at(onset as f64);

        // 3. Impulso neto durante la propulsión
        let takeoff_sample = rel(window.takeoff_index);
        let net_impulse = trapezoid(&filtered[onset..=takeoff_sample], bodyweight, dt);
        let mass = bodyweight / GRAVITY;
        let takeoff_velocity = if mass > 0.0 { net_impulse / mass } else { 0.0 };
        let height_impulse = if takeoff_velocity > 0.0 {
            takeoff_velocity * takeoff_velocity / (2.0 * GRAVITY)
        } else {
            0.0
        };

        // 4. Picos
        let peak_propulsive = max_of(&filtered[onset..takeoff_sample.max(onset + 1)]);
        let landing_sample = rel(window.landing_index);
        let landing_end = (landing_sample + self.params.landing_window_samples).min(raw.len() - 1);
        let peak_landing = max_of(&filtered[landing_sample..=landing_end]);

        let contraction_time_ms = (takeoff_timestamp - movement_start_timestamp) * 1000.0;

        // 5. Avisos de calidad
        let mut quality_flags = Vec::new();
        if flight_time < self.params.min_flight_time_secs
            || flight_time > self.params.max_typical_flight_time_secs
        {
            quality_flags.push(QualityFlag::FlightTimeOutOfRange);
        }
        // La concordancia se mide en velocidad de despegue (vuelo simétrico: v = g·t/2)
        let flight_velocity = 0.5 * GRAVITY * flight_time;
        let disagreement =
            (takeoff_velocity - flight_velocity).abs() / flight_velocity.max(f64::EPSILON);
        if disagreement > self.params.height_agreement_tolerance {
            quality_flags.push(QualityFlag::HeightMethodsDisagree);
        }
        if last_index < window.end_index {
            quality_flags.push(QualityFlag::LandingWindowTruncated);
        }
        if bodyweight < LOW_BODYWEIGHT_N {
            quality_flags.push(QualityFlag::LowBodyweight);
        }

        debug!(
            takeoff_pos,
            landing_pos,
            onset,
            net_impulse,
            ?quality_flags,
            "Ventana analizada"
        );

        let metrics = JumpMetrics {
            jump_number: window.jump_number,
            bodyweight_n: bodyweight,
            flight_time_seconds: flight_time,
            height_flight_method: height_flight,
            height_impulse_method: height_impulse,
            net_impulse_ns: net_impulse,
            takeoff_velocity,
            peak_propulsive_force: peak_propulsive,
            peak_landing_force: peak_landing,
            contraction_time_ms,
            movement_start_timestamp,
            takeoff_timestamp,
            landing_timestamp,
            quality_flags,
        };

        info!(
            jump = metrics.jump_number,
            flight_time = metrics.flight_time_seconds,
            height_flight_m = metrics.height_flight_method,
            height_impulse_m = metrics.height_impulse_method,
            "Salto analizado"
        );

        Ok(metrics)
    }
}

/// Último cruce descendente en o antes de `from`, interpolado.
///
/// Con `x[i-1] >= thr > x[i]` devuelve `(i-1) + (x[i-1]-thr)/(x[i-1]-x[i])`.
fn down_crossing(x: &[f64], threshold: f64, from: usize) -> Option<f64> {
    let from = from.min(x.len().saturating_sub(1));
    (1..=from).rev().find_map(|i| {
        let (before, after) = (x[i - 1], x[i]);
        (before >= threshold && after < threshold)
            .then(|| (i - 1) as f64 + (before - threshold) / (before - after))
    })
}

/// Último cruce ascendente en o antes de `from`, interpolado
fn up_crossing(x: &[f64], threshold: f64, from: usize) -> Option<f64> {
    let from = from.min(x.len().saturating_sub(1));
    (1..=from).rev().find_map(|i| {
        let (before, after) = (x[i - 1], x[i]);
        (before < threshold && after >= threshold)
            .then(|| (i - 1) as f64 + (threshold - before) / (after - before))
    })
}

/// Retrocede desde `from` mientras la señal siga desviada del peso corporal
fn movement_onset(filtered: &[f64], bodyweight: f64, delta: f64, from: usize) -> usize {
    let mut onset = from.min(filtered.len().saturating_sub(1));
    while onset > 0 && (filtered[onset - 1] - bodyweight).abs() > delta {
        onset -= 1;
    }
    onset
}

/// Integral trapezoidal de `(x - offset)·dt`
fn trapezoid(x: &[f64], offset: f64, dt: f64) -> f64 {
    x.windows(2)
        .map(|w| 0.5 * ((w[0] - offset) + (w[1] - offset)) * dt)
        .sum()
}

fn max_of(x: &[f64]) -> f64 {
    x.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}
