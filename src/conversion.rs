//! Conversión de voltaje crudo a fuerza vertical total.

use crate::error::{PipelineError, Result};

/// Lectura de una muestra ya corregida: voltaje sumado y fuerza sumada
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvertedSample {
    /// Suma de voltajes de todos los canales tras restar el offset de cero
    pub volts: f64,
    /// Fuerza vertical total en N
    pub force: f64,
}

/// Aplica offset de cero, factor N/V y suma los canales
#[derive(Debug, Clone, PartialEq)]
pub struct ForceConverter {
    zero_offset: Vec<f64>,
    n_per_volt: f64,
}

impl ForceConverter {
    pub fn new(zero_offset: Vec<f64>, n_per_volt: f64) -> Self {
        Self {
            zero_offset,
            n_per_volt,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.zero_offset.len()
    }

    pub fn n_per_volt(&self) -> f64 {
        self.n_per_volt
    }

    pub fn zero_offset(&self) -> &[f64] {
        &self.zero_offset
    }

    pub fn set_n_per_volt(&mut self, n_per_volt: f64) {
        self.n_per_volt = n_per_volt;
    }

    pub fn set_zero_offset(&mut self, offset: Vec<f64>) -> Result<()> {
        if offset.len() != self.zero_offset.len() {
            return Err(PipelineError::precondition(format!(
                "expected {} zero offsets, got {}",
                self.zero_offset.len(),
                offset.len()
            )));
        }
        self.zero_offset = offset;
        Ok(())
    }

    /// Convierte una fila `[canal]` de voltajes
    pub fn convert(&self, row: &[f64]) -> ConvertedSample {
        let volts: f64 = row
            .iter()
            .zip(&self.zero_offset)
            .map(|(v, offset)| v - offset)
            .sum();

        ConvertedSample {
            volts,
            force: volts * self.n_per_volt,
        }
    }
}

/// Promedia lecturas en reposo para obtener el offset de cero por canal
#[derive(Debug, Clone)]
pub struct ZeroOffsetEstimator {
    sums: Vec<f64>,
    count: usize,
    required: usize,
}

impl ZeroOffsetEstimator {
    pub const DEFAULT_SAMPLES: usize = 100;

    pub fn new(channel_count: usize, required: usize) -> Self {
        Self {
            sums: vec![0.0; channel_count],
            count: 0,
            required: required.max(1),
        }
    }

    /// Añade una lectura instantánea `[canal]`; devuelve `true` al completar
    pub fn push(&mut self, row: &[f64]) -> Result<bool> {
        if row.len() != self.sums.len() {
            return Err(PipelineError::InvalidChunk(format!(
                "expected {} channels, got {}",
                self.sums.len(),
                row.len()
            )));
        }
        for (sum, v) in self.sums.iter_mut().zip(row) {
            *sum += v;
        }
        self.count += 1;
        Ok(self.is_complete())
    }

    pub fn is_complete(&self) -> bool {
        self.count >= self.required
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Offset promedio por canal; falla si aún faltan lecturas
    pub fn finish(&self) -> Result<Vec<f64>> {
        if !self.is_complete() {
            return Err(PipelineError::InsufficientSamples {
                expected: self.required,
                actual: self.count,
            });
        }
        Ok(self.sums.iter().map(|s| s / self.count as f64).collect())
    }
}
