//! Adquisición simulada para demos y pruebas sin hardware.
//!
//! Genera saltos con contramovimiento de forma periódica sobre una base de
//! peso corporal y entrega bloques de tamaño fijo por un canal acotado, con
//! el mismo ritmo que tendría la tarjeta de adquisición.

use std::f64::consts::FRAC_PI_2;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::types::{Chunk, DAQ_READ_CHUNK_SIZE, NUM_CHANNELS, SAMPLING_RATE};

/// Forma de onda del salto, en voltios por canal
#[derive(Debug, Clone, PartialEq)]
pub struct CmjWaveform {
    /// Periodo entre saltos (default: 5 s)
    pub cycle_secs: f64,
    /// Duración del salto completo dentro del ciclo (default: 1.5 s)
    pub jump_secs: f64,
    /// Tiempo de vuelo (default: 0.3 s)
    pub flight_secs: f64,
    /// Voltaje de referencia por canal (default: 0.6 V)
    pub base_voltage: f64,
    pub bw_factor: f64,
    pub unweight_factor: f64,
    pub peak_factor: f64,
    pub landing_peak_factor: f64,
}

impl Default for CmjWaveform {
    fn default() -> Self {
        Self {
            cycle_secs: 5.0,
            jump_secs: 1.5,
            flight_secs: 0.3,
            base_voltage: 0.6,
            bw_factor: 0.9,
            unweight_factor: 0.3,
            peak_factor: 2.5,
            landing_peak_factor: 3.0,
        }
    }
}

impl CmjWaveform {
    /// Voltaje de un canal en el instante `t` (segundos desde el inicio)
    pub fn voltage_at(&self, t: f64) -> f64 {
        let jump_secs = self.jump_secs.min(self.cycle_secs - 0.1);
        let jump_start = self.cycle_secs - jump_secs;

        let mut active = jump_secs - self.flight_secs;
        if active <= 0.1 {
            active = jump_secs * 0.7;
        }

        let unweight_end = active * 0.15;
        let brake_peak = active * 0.40;
        let takeoff = active * 0.75;
        let flight_end = takeoff + self.flight_secs;
        let landing_peak = flight_end + active * 0.05;
        let settle_end = flight_end + active * 0.25;

        let bw = self.base_voltage * self.bw_factor;
        let unweight = self.base_voltage * self.unweight_factor;
        let peak = self.base_voltage * self.peak_factor;
        let landing = self.base_voltage * self.landing_peak_factor;

        let t_cycle = t.rem_euclid(self.cycle_secs);
        if t_cycle < jump_start {
            return bw;
        }
        let t = t_cycle - jump_start;

        let ease = |from: f64, to: f64, start: f64, end: f64| {
            let progress = (t - start) / (end - start);
            from + (to - from) * (progress * FRAC_PI_2).sin()
        };

        if t < unweight_end {
            ease(bw, unweight, 0.0, unweight_end)
        } else if t < brake_peak {
            ease(unweight, peak, unweight_end, brake_peak)
        } else if t < takeoff {
            // Caída lineal hasta el despegue
            peak * (1.0 - (t - brake_peak) / (takeoff - brake_peak))
        } else if t < flight_end {
            0.0
        } else if t < landing_peak {
            ease(0.0, landing, flight_end, landing_peak)
        } else if t < settle_end {
            ease(landing, bw, landing_peak, settle_end)
        } else {
            bw
        }
    }
}

/// Parámetros de entrega de bloques
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorConfig {
    pub sample_rate_hz: f64,
    pub channel_count: usize,
    pub chunk_size: usize,
    /// Amplitud del ruido por canal en voltios (0 = señal limpia)
    pub noise_volts: f64,
    /// Variación relativa del intervalo entre bloques, 0..1
    pub jitter: f64,
    /// 1.0 = tiempo real, 0.0 = tan rápido como acepte el canal
    pub time_scale: f64,
    /// Muestras a generar; `None` hasta que se pida parar
    pub total_samples: Option<u64>,
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: SAMPLING_RATE,
            channel_count: NUM_CHANNELS,
            chunk_size: DAQ_READ_CHUNK_SIZE,
            noise_volts: 0.002,
            jitter: 0.2,
            time_scale: 1.0,
            total_samples: None,
            seed: 7,
        }
    }
}

pub struct Simulator {
    config: SimulatorConfig,
    waveform: CmjWaveform,
    rng: StdRng,
    next_index: u64,
}

impl Simulator {
    pub fn new(config: SimulatorConfig, waveform: CmjWaveform) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            waveform,
            rng,
            next_index: 0,
        }
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    fn remaining(&self) -> Option<u64> {
        self.config
            .total_samples
            .map(|total| total.saturating_sub(self.next_index))
    }

    /// Siguiente bloque, o `None` si ya se generaron todas las muestras
    pub fn next_chunk(&mut self) -> Option<Chunk> {
        let mut count = self.config.chunk_size.max(1) as u64;
        if let Some(remaining) = self.remaining() {
            if remaining == 0 {
                return None;
            }
            count = count.min(remaining);
        }

        let channels = self.config.channel_count;
        let mut readings = Vec::with_capacity(count as usize * channels);
        for i in self.next_index..self.next_index + count {
            let t = i as f64 / self.config.sample_rate_hz;
            let volts = self.waveform.voltage_at(t);
            for _ in 0..channels {
                readings.push(volts + self.noise());
            }
        }

        let chunk = Chunk::new(self.next_index, channels, readings);
        self.next_index += count;
        Some(chunk)
    }

    fn noise(&mut self) -> f64 {
        if self.config.noise_volts <= 0.0 {
            return 0.0;
        }
        // Distribución triangular en [-noise, noise]
        let u: f64 = self.rng.gen::<f64>() + self.rng.gen::<f64>() - 1.0;
        u * self.config.noise_volts
    }

    fn chunk_interval(&mut self, samples: usize) -> Duration {
        let nominal = samples as f64 / self.config.sample_rate_hz * self.config.time_scale;
        if nominal <= 0.0 {
            return Duration::ZERO;
        }
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            1.0 + self.rng.gen_range(-jitter..=jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64(nominal * factor)
    }

    /// Envía bloques hasta agotar muestras, cerrarse el receptor o activarse `stop`.
    ///
    /// Devuelve el número de muestras entregadas. El envío bloquea si el
    /// canal está lleno: los bloques nunca se descartan.
    pub fn run(mut self, tx: Sender<Chunk>, stop: Arc<AtomicBool>) -> u64 {
        info!(
            channels = self.config.channel_count,
            chunk_size = self.config.chunk_size,
            "Adquisición simulada iniciada"
        );

        while !stop.load(Ordering::Relaxed) {
            let Some(chunk) = self.next_chunk() else {
                break;
            };
            let pause = self.chunk_interval(chunk.sample_count());
            if !pause.is_zero() {
                thread::sleep(pause);
            }
            if tx.send(chunk).is_err() {
                debug!("Receptor cerrado, fin de la simulación");
                break;
            }
        }

        info!(samples = self.next_index, "Adquisición simulada detenida");
        self.next_index
    }

    /// Lanza la simulación en su propio hilo
    pub fn spawn(self, tx: Sender<Chunk>, stop: Arc<AtomicBool>) -> Result<JoinHandle<u64>> {
        thread::Builder::new()
            .name("simulator".to_string())
            .spawn(move || self.run(tx, stop))
            .context("No se pudo lanzar el hilo de simulación")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    fn fast_config(total: u64) -> SimulatorConfig {
        SimulatorConfig {
            channel_count: 2,
            noise_volts: 0.0,
            time_scale: 0.0,
            total_samples: Some(total),
            ..Default::default()
        }
    }

    #[test]
    fn test_waveform_phases() {
        let w = CmjWaveform::default();
        let bw = 0.6 * 0.9;
        assert!((w.voltage_at(1.0) - bw).abs() < 1e-12);
        // Despegue a 3.5 + 0.9 s, vuelo de 0.3 s
        assert_eq!(w.voltage_at(4.5), 0.0);
        assert!(w.voltage_at(4.4 - 0.01) > 0.0);
        // Pico de aterrizaje
        assert!((w.voltage_at(4.76) - 0.6 * 3.0).abs() < 1e-6);
        // La estabilización termina justo en el límite del ciclo
        assert!((w.voltage_at(4.99) - bw).abs() < 1e-3);
        assert!(w.voltage_at(4.99) > bw);
        assert!((w.voltage_at(5.0) - bw).abs() < 1e-12);
        assert!((w.voltage_at(6.0) - bw).abs() < 1e-12);
    }

    #[test]
    fn test_chunks_cover_total_samples() {
        let mut sim = Simulator::new(fast_config(1200), CmjWaveform::default());
        let sizes: Vec<usize> = std::iter::from_fn(|| sim.next_chunk())
            .map(|c| c.sample_count())
            .collect();
        assert_eq!(sizes, vec![500, 500, 200]);
        assert_eq!(sim.next_index(), 1200);
    }

    #[test]
    fn test_same_seed_same_signal() {
        let config = SimulatorConfig {
            noise_volts: 0.01,
            ..fast_config(500)
        };
        let a = Simulator::new(config.clone(), CmjWaveform::default()).next_chunk();
        let b = Simulator::new(config, CmjWaveform::default()).next_chunk();
        assert_eq!(a, b);
    }

    #[test]
    fn test_run_delivers_contiguous_chunks() {
        let (tx, rx) = bounded(2);
        let stop = Arc::new(AtomicBool::new(false));
        let handle = Simulator::new(fast_config(2600), CmjWaveform::default())
            .spawn(tx, stop)
            .unwrap();

        let mut expected = 0;
        for chunk in rx.iter() {
            assert_eq!(chunk.start_sample_index, expected);
            assert!(chunk.is_well_formed());
            expected = chunk.end_sample_index();
        }
        assert_eq!(expected, 2600);
        assert_eq!(handle.join().unwrap(), 2600);
    }
}
