use crate::config::PipelineConfig;
use crate::conversion::ForceConverter;
use crate::error::{PipelineError, Result};
use crate::types::{Chunk, Sample};

/// Tolerancia para comparar tiempos derivados de índices
const TIME_EPS: f64 = 1e-9;

/// Muestra recién insertada junto con su voltaje sumado (para calibración)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub sample: Sample,
    pub volts: f64,
}

/// Buffer circular de capacidad fija direccionado por índice de muestra.
///
/// La muestra con índice `i` vive en la ranura `i % capacity`. El índice es
/// el número acumulado de muestras añadidas en la sesión, y el tiempo de
/// cada muestra es `session_start + i / sample_rate`: nunca se usa la hora
/// de llegada del bloque.
pub struct SampleBuffer {
    forces: Vec<f64>,
    capacity: usize,
    sample_rate: f64,
    session_start: f64,
    /// Índice de la próxima muestra a insertar (= total añadido)
    next_index: u64,
}

impl SampleBuffer {
    /// Crea un buffer vacío con capacidad para `capacity` muestras
    pub fn new(sample_rate: f64, capacity: usize, session_start: f64) -> Self {
        let capacity = capacity.max(1);
        Self {
            forces: vec![0.0; capacity],
            capacity,
            sample_rate,
            session_start,
            next_index: 0,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.sample_rate_hz, config.buffer_capacity(), 0.0)
    }

    /// Vacía el buffer e inicia una sesión nueva
    pub fn reset(&mut self, session_start: f64) {
        self.session_start = session_start;
        self.next_index = 0;
    }

    /// Convierte e inserta todas las muestras del bloque.
    ///
    /// El bloque se rechaza entero (sin mutar nada) si su anchura no coincide
    /// con el conversor o si su índice inicial rompe la contigüidad.
    pub fn append(&mut self, chunk: &Chunk, converter: &ForceConverter) -> Result<Vec<Reading>> {
        if !chunk.is_well_formed() {
            return Err(PipelineError::InvalidChunk(format!(
                "{} readings do not split into {} channels",
                chunk.readings.len(),
                chunk.channel_count
            )));
        }
        if chunk.channel_count != converter.channel_count() {
            return Err(PipelineError::InvalidChunk(format!(
                "expected {} channels, got {}",
                converter.channel_count(),
                chunk.channel_count
            )));
        }
        if chunk.start_sample_index != self.next_index {
            return Err(PipelineError::InvalidChunk(format!(
                "chunk starts at sample {} but buffer expects {}",
                chunk.start_sample_index, self.next_index
            )));
        }

        let mut readings = Vec::with_capacity(chunk.sample_count());
        for row in chunk.rows() {
            let converted = converter.convert(row);
            let sample = self.push(converted.force);
            readings.push(Reading {
                sample,
                volts: converted.volts,
            });
        }

        Ok(readings)
    }

    /// Inserta una fuerza ya convertida, desalojando la más antigua si está lleno
    pub fn push(&mut self, force: f64) -> Sample {
        let index = self.next_index;
        let slot = (index % self.capacity as u64) as usize;
        self.forces[slot] = force;
        self.next_index += 1;

        Sample {
            index,
            timestamp: self.timestamp_of(index),
            force,
        }
    }

    /// Muestras con `t0 <= timestamp < t1`, en orden.
    ///
    /// Falla con `RangeUnavailable` si `t0` es anterior a la muestra más
    /// antigua retenida.
    pub fn slice(&self, t0: f64, t1: f64) -> Result<Vec<Sample>> {
        if self.is_empty() {
            return Ok(Vec::new());
        }

        let oldest = self.timestamp_of(self.oldest_index());
        if t0 < oldest - TIME_EPS {
            return Err(PipelineError::RangeUnavailable {
                requested: t0,
                oldest,
            });
        }

        let first = self.index_at_or_after(t0);
        let end = self.index_at_or_after(t1).min(self.next_index);
        if first >= end {
            return Ok(Vec::new());
        }

        Ok((first..end).map(|i| self.sample_unchecked(i)).collect())
    }

    /// Muestras con índice en `[first, last]`; `last` se recorta a lo disponible
    pub fn slice_indices(&self, first: u64, last: u64) -> Result<Vec<Sample>> {
        if first < self.oldest_index() {
            return Err(PipelineError::RangeUnavailable {
                requested: self.timestamp_of(first),
                oldest: self.timestamp_of(self.oldest_index()),
            });
        }
        let end = last.saturating_add(1).min(self.next_index);
        if first >= end {
            return Ok(Vec::new());
        }

        Ok((first..end).map(|i| self.sample_unchecked(i)).collect())
    }

    /// Las `n` muestras más recientes (o todas si hay menos), en orden
    pub fn latest(&self, n: usize) -> Vec<Sample> {
        let n = n.min(self.len()) as u64;
        let first = self.next_index - n;
        (first..self.next_index)
            .map(|i| self.sample_unchecked(i))
            .collect()
    }

    /// Muestra por índice absoluto, si sigue retenida
    pub fn get(&self, index: u64) -> Option<Sample> {
        if index < self.oldest_index() || index >= self.next_index {
            return None;
        }
        Some(self.sample_unchecked(index))
    }

    pub fn latest_force(&self) -> Option<f64> {
        self.next_index
            .checked_sub(1)
            .and_then(|i| self.get(i))
            .map(|s| s.force)
    }

    pub fn timestamp_of(&self, index: u64) -> f64 {
        self.session_start + index as f64 / self.sample_rate
    }

    /// Primer índice cuya marca de tiempo es `>= t`
    fn index_at_or_after(&self, t: f64) -> u64 {
        let position = (t - self.session_start) * self.sample_rate;
        if position <= 0.0 {
            return 0;
        }
        (position - TIME_EPS * self.sample_rate).ceil().max(0.0) as u64
    }

    fn sample_unchecked(&self, index: u64) -> Sample {
        let slot = (index % self.capacity as u64) as usize;
        Sample {
            index,
            timestamp: self.timestamp_of(index),
            force: self.forces[slot],
        }
    }

    pub fn oldest_index(&self) -> u64 {
        self.next_index.saturating_sub(self.capacity as u64)
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn len(&self) -> usize {
        (self.next_index - self.oldest_index()) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.next_index == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn session_start(&self) -> f64 {
        self.session_start
    }
}
