//! Filtro Butterworth paso bajo de fase cero.
//!
//! El diseño sigue el camino clásico: polos del prototipo analógico,
//! pre-distorsión de la frecuencia de corte y transformada bilineal a
//! secciones de segundo orden (biquads en forma directa II transpuesta).
//! El filtrado de fase cero aplica la cascada hacia delante y hacia atrás
//! sobre la señal extendida con reflexión impar en ambos extremos.

use std::f64::consts::PI;

use crate::error::{PipelineError, Result};

/// Sección de segundo orden: H(z) = (b0 + b1 z⁻¹ + b2 z⁻²) / (1 + a1 z⁻¹ + a2 z⁻²)
#[derive(Debug, Clone, Copy, PartialEq)]
struct Biquad {
    b: [f64; 3],
    a: [f64; 2],
}

impl Biquad {
    /// Par de polos conjugados `p = re ± j·im` (rad/s) llevado al plano z
    fn lowpass_from_pole(re: f64, im: f64, sample_rate: f64) -> Self {
        let k = 2.0 * sample_rate;
        let k2 = k * k;
        let mag_sq = re * re + im * im;
        let d = k2 - 2.0 * k * re + mag_sq;

        Self {
            b: [mag_sq / d, 2.0 * mag_sq / d, mag_sq / d],
            a: [2.0 * (mag_sq - k2) / d, (k2 + 2.0 * k * re + mag_sq) / d],
        }
    }

    /// Filtra en sitio arrancando en régimen estacionario para `x[0]`
    fn run(&self, x: &mut [f64]) {
        let Some(&x0) = x.first() else {
            return;
        };
        // Ganancia unitaria en continua: la salida estacionaria es x0
        let mut s0 = x0 * (1.0 - self.b[0]);
        let mut s1 = x0 * (self.b[2] - self.a[1]);

        for v in x.iter_mut() {
            let input = *v;
            let output = self.b[0] * input + s0;
            s0 = self.b[1] * input - self.a[0] * output + s1;
            s1 = self.b[2] * input - self.a[1] * output;
            *v = output;
        }
    }

    fn dc_gain(&self) -> f64 {
        (self.b[0] + self.b[1] + self.b[2]) / (1.0 + self.a[0] + self.a[1])
    }

    fn is_stable(&self) -> bool {
        let (a1, a2) = (self.a[0], self.a[1]);
        a2.abs() < 1.0 && a1.abs() < 1.0 + a2
    }
}

/// Butterworth paso bajo de orden par, aplicado sin desfase
#[derive(Debug, Clone, PartialEq)]
pub struct LowPassFilter {
    sections: Vec<Biquad>,
    order: usize,
    cutoff_hz: f64,
    sample_rate: f64,
}

impl LowPassFilter {
    pub fn butterworth(order: usize, cutoff_hz: f64, sample_rate: f64) -> Result<Self> {
        if order == 0 || order % 2 != 0 {
            return Err(PipelineError::precondition(format!(
                "filter order must be even, got {}",
                order
            )));
        }
        if !(cutoff_hz > 0.0) || cutoff_hz >= sample_rate / 2.0 {
            return Err(PipelineError::precondition(format!(
                "cutoff {} Hz outside (0, {}) Hz",
                cutoff_hz,
                sample_rate / 2.0
            )));
        }

        // Pre-distorsión para que el corte caiga en cutoff_hz tras la bilineal
        let wc = 2.0 * sample_rate * (PI * cutoff_hz / sample_rate).tan();

        // Un polo por cada par conjugado del semiplano izquierdo
        let sections = (0..order / 2)
            .map(|k| {
                let theta = PI * (2 * k + order + 1) as f64 / (2 * order) as f64;
                Biquad::lowpass_from_pole(wc * theta.cos(), wc * theta.sin(), sample_rate)
            })
            .collect();

        Ok(Self {
            sections,
            order,
            cutoff_hz,
            sample_rate,
        })
    }

    pub fn from_config(config: &crate::config::PipelineConfig) -> Result<Self> {
        Self::butterworth(
            config.filter_order,
            config.lowpass_cutoff_hz,
            config.sample_rate_hz,
        )
    }

    /// Muestras de extensión en cada extremo: 3 × (orden + 1)
    pub fn padlen(&self) -> usize {
        3 * (self.order + 1)
    }

    /// Longitud mínima de señal que admite `filtfilt`
    pub fn min_len(&self) -> usize {
        self.padlen() + 1
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn cutoff_hz(&self) -> f64 {
        self.cutoff_hz
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn is_stable(&self) -> bool {
        self.sections.iter().all(Biquad::is_stable)
    }

    pub fn dc_gain(&self) -> f64 {
        self.sections.iter().map(Biquad::dc_gain).product()
    }

    /// Filtrado hacia delante y hacia atrás: fase cero, orden efectivo doble
    pub fn filtfilt(&self, x: &[f64]) -> Result<Vec<f64>> {
        let pad = self.padlen();
        let n = x.len();
        if n <= pad {
            return Err(PipelineError::incomplete(format!(
                "{} samples are too few to filter (need more than {})",
                n, pad
            )));
        }

        // Reflexión impar alrededor de cada extremo
        let first = x[0];
        let last = x[n - 1];
        let mut ext = Vec::with_capacity(n + 2 * pad);
        ext.extend((1..=pad).rev().map(|i| 2.0 * first - x[i]));
        ext.extend_from_slice(x);
        ext.extend((1..=pad).map(|i| 2.0 * last - x[n - 1 - i]));

        for section in &self.sections {
            section.run(&mut ext);
        }
        ext.reverse();
        for section in &self.sections {
            section.run(&mut ext);
        }
        ext.reverse();

        Ok(ext[pad..pad + n].to_vec())
    }
}
