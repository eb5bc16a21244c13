use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::types::{N_PER_VOLT, NUM_CHANNELS, SAMPLING_RATE};

/// Parámetros de la sesión de procesamiento.
///
/// Se entregan una sola vez al arrancar la sesión y solo cambian a través
/// de `Coordinator::reset_session`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Frecuencia de muestreo por canal en Hz (default: 1000)
    pub sample_rate_hz: f64,
    /// Número de canales analógicos (default: 4)
    pub channel_count: usize,
    /// Offset de cero por canal en voltios (default: ceros)
    pub zero_offset_volts: Vec<f64>,
    /// Factor de conversión por canal en N/V (default: 327.0)
    pub n_per_volt: f64,
    /// Corte del filtro paso bajo en Hz (default: 50)
    pub lowpass_cutoff_hz: f64,
    /// Orden del Butterworth, debe ser par (default: 4)
    pub filter_order: usize,
    /// Umbral absoluto de vuelo en N (default: 20)
    pub flight_threshold_n: f64,
    /// Desviación del peso corporal que marca inicio de movimiento (default: 50 N)
    pub movement_delta_n: f64,
    /// Muestras consecutivas para confirmar una transición (default: 10)
    pub min_contact_samples: usize,
    /// Tiempo estable tras aterrizar antes de aceptar otro salto (default: 0.5 s)
    pub quiet_time_secs: f64,
    /// Margen antes del inicio de movimiento incluido en la ventana (default: 0.5 s)
    pub pre_roll_secs: f64,
    /// Datos tras el aterrizaje necesarios para el pico de aterrizaje (default: 0.5 s)
    pub landing_window_secs: f64,
    /// Duración máxima de la fase de movimiento sin despegar (default: 4 s)
    pub max_movement_secs: f64,
    /// Vuelo más largo que esto se interpreta como bajarse de la plataforma (default: 1.5 s)
    pub max_flight_secs: f64,
    /// Historial retenido en el buffer circular (default: 10 s)
    pub buffer_max_duration_secs: f64,
    /// Cuenta atrás antes de medir (default: 3 s)
    pub calibration_countdown_secs: f64,
    /// Ventana de recogida por medición (default: 3 s)
    pub calibration_window_secs: f64,
    /// Muestras mínimas para aceptar una medición (default: 10)
    pub min_calibration_samples: usize,
    /// Repeticiones por peso de referencia, 1..=10 (default: 3)
    pub measurements_per_weight: usize,
    /// Desviación típica máxima al medir el peso corporal (default: 10 N)
    pub stability_std_n: f64,
    /// Rango típico del tiempo de vuelo (default: 0.05-0.8 s)
    pub min_flight_time_secs: f64,
    pub max_typical_flight_time_secs: f64,
    /// Discrepancia relativa tolerada entre las dos alturas (default: 0.25)
    pub height_agreement_tolerance: f64,
    /// Capacidad del canal de bloques (default: 16)
    pub channel_capacity: usize,
    /// Bloques pendientes a partir de los cuales se avisa de retraso (default: 4)
    pub backlog_warning: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: SAMPLING_RATE,
            channel_count: NUM_CHANNELS,
            zero_offset_volts: vec![0.0; NUM_CHANNELS],
            n_per_volt: N_PER_VOLT,
            lowpass_cutoff_hz: 50.0,
            filter_order: 4,
            flight_threshold_n: 20.0,
            movement_delta_n: 50.0,
            min_contact_samples: 10,
            quiet_time_secs: 0.5,
            pre_roll_secs: 0.5,
            landing_window_secs: 0.5,
            max_movement_secs: 4.0,
            max_flight_secs: 1.5,
            buffer_max_duration_secs: 10.0,
            calibration_countdown_secs: 3.0,
            calibration_window_secs: 3.0,
            min_calibration_samples: 10,
            measurements_per_weight: 3,
            stability_std_n: 10.0,
            min_flight_time_secs: 0.05,
            max_typical_flight_time_secs: 0.8,
            height_agreement_tolerance: 0.25,
            channel_capacity: 16,
            backlog_warning: 4,
        }
    }
}

impl PipelineConfig {
    /// Carga la configuración desde un JSON; los campos ausentes toman su valor por defecto
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("No se pudo leer la configuración {:?}", path))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Configuración inválida en {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let fail = |msg: String| Err(PipelineError::precondition(msg));

        if !(self.sample_rate_hz > 0.0) {
            return fail(format!("sample rate must be positive ({})", self.sample_rate_hz));
        }
        if self.channel_count == 0 {
            return fail("channel count must be at least 1".to_string());
        }
        if self.zero_offset_volts.len() != self.channel_count {
            return fail(format!(
                "expected {} zero offsets, got {}",
                self.channel_count,
                self.zero_offset_volts.len()
            ));
        }
        if self.filter_order == 0 || self.filter_order % 2 != 0 {
            return fail(format!("filter order must be even ({})", self.filter_order));
        }
        if !(self.lowpass_cutoff_hz > 0.0) || self.lowpass_cutoff_hz >= self.nyquist() {
            return fail(format!(
                "cutoff {} Hz must be within (0, {}) Hz",
                self.lowpass_cutoff_hz,
                self.nyquist()
            ));
        }
        if self.min_contact_samples == 0 {
            return fail("min contact samples must be at least 1".to_string());
        }
        if !(1..=10).contains(&self.measurements_per_weight) {
            return fail(format!(
                "measurements per weight must be within 1..=10 ({})",
                self.measurements_per_weight
            ));
        }
        if self.buffer_capacity() == 0 {
            return fail("buffer duration too short for the sample rate".to_string());
        }
        if self.channel_capacity == 0 {
            return fail("channel capacity must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn nyquist(&self) -> f64 {
        self.sample_rate_hz / 2.0
    }

    /// Capacidad del buffer circular en muestras
    pub fn buffer_capacity(&self) -> usize {
        (self.buffer_max_duration_secs * self.sample_rate_hz).round() as usize
    }

    /// Convierte una duración en segundos a número de muestras
    pub fn secs_to_samples(&self, secs: f64) -> usize {
        (secs * self.sample_rate_hz).round().max(0.0) as usize
    }
}
