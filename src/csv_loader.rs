use std::io::Write;
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use csv::{ReaderBuilder, Trim, WriterBuilder};

use crate::sample_buffer::SampleBuffer;
use crate::types::{Chunk, Sample};

/// Sesión grabada: una fila de voltajes por muestra
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedSession {
    pub channel_count: usize,
    /// Estimada a partir de la columna de tiempo, si hay al menos dos filas
    pub sample_rate_hz: Option<f64>,
    pub rows: Vec<Vec<f64>>,
}

impl RecordedSession {
    pub fn sample_count(&self) -> usize {
        self.rows.len()
    }

    /// Parte la sesión en bloques consecutivos de `chunk_size` muestras
    pub fn chunks(&self, chunk_size: usize) -> Vec<Chunk> {
        let chunk_size = chunk_size.max(1);
        self.rows
            .chunks(chunk_size)
            .enumerate()
            .map(|(k, rows)| Chunk::from_rows((k * chunk_size) as u64, rows))
            .collect()
    }
}

/// Carga una sesión en el formato `tiempo,canal0,canal1,...`.
///
/// La primera fila es la cabecera. Las filas que no son numéricas (como la
/// línea de metadatos `Sample Rate (Hz): ...` que sigue a la cabecera en las
/// grabaciones antiguas) se ignoran.
pub fn load_session_csv(path: impl AsRef<Path>) -> Result<RecordedSession> {
    let path = path.as_ref();
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_path(path)
        .with_context(|| format!("No se pudo abrir el CSV {:?}", path))?;

    let headers = reader
        .headers()
        .with_context(|| format!("Cabecera inválida en {:?}", path))?
        .clone();
    ensure!(
        headers.len() >= 2,
        "El CSV {:?} necesita una columna de tiempo y al menos un canal",
        path
    );
    let channel_count = headers.len() - 1;

    let mut times = Vec::new();
    let mut rows = Vec::new();

    for (row_idx, result) in reader.records().enumerate() {
        let record =
            result.with_context(|| format!("Fila {} inválida en {:?}", row_idx + 1, path))?;

        let Some(Ok(time)) = record.get(0).map(str::parse::<f64>) else {
            continue;
        };
        if record.len() != headers.len() {
            bail!(
                "La fila {} tiene {} columnas, se esperaban {}",
                row_idx + 1,
                record.len(),
                headers.len()
            );
        }

        let mut row = Vec::with_capacity(channel_count);
        for (col, field) in record.iter().enumerate().skip(1) {
            let value: f64 = field.parse().with_context(|| {
                format!("Valor inválido en fila {}, columna {}", row_idx + 1, col)
            })?;
            row.push(value);
        }
        times.push(time);
        rows.push(row);
    }

    if rows.is_empty() {
        bail!("El CSV {:?} no contiene datos", path);
    }

    Ok(RecordedSession {
        channel_count,
        sample_rate_hz: estimate_sample_rate(&times),
        rows,
    })
}

fn estimate_sample_rate(times: &[f64]) -> Option<f64> {
    let (first, last) = (times.first()?, times.last()?);
    let span = last - first;
    if times.len() < 2 || span <= 0.0 {
        return None;
    }
    Some((times.len() - 1) as f64 / span)
}

/// Escribe muestras como `time_s,force_n`
pub fn write_force_history<W: Write>(writer: W, samples: &[Sample]) -> Result<()> {
    let mut writer = WriterBuilder::new().from_writer(writer);
    writer.write_record(["time_s", "force_n"])?;
    for sample in samples {
        writer.write_record([
            format!("{:.6}", sample.timestamp),
            format!("{:.3}", sample.force),
        ])?;
    }
    writer.flush().context("No se pudo vaciar el CSV")?;
    Ok(())
}

/// Exporta todo el historial retenido del buffer; devuelve las muestras escritas
pub fn export_force_history(buffer: &SampleBuffer, path: impl AsRef<Path>) -> Result<usize> {
    let path = path.as_ref();
    let samples = buffer.latest(buffer.len());
    let file = std::fs::File::create(path)
        .with_context(|| format!("No se pudo crear el CSV {:?}", path))?;
    write_force_history(file, &samples)
        .with_context(|| format!("No se pudo escribir el historial en {:?}", path))?;
    Ok(samples.len())
}
