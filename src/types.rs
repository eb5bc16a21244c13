use serde::{Deserialize, Serialize};

/// Aceleración de la gravedad (m/s²)
pub const GRAVITY: f64 = 9.81;

/// Constantes del hardware de adquisición por defecto
pub const SAMPLING_RATE: f64 = 1000.0; // Hz por canal
pub const NUM_CHANNELS: usize = 4;
pub const DAQ_READ_CHUNK_SIZE: usize = 500; // muestras por canal y bloque (~500 ms @ 1 kHz)
pub const N_PER_VOLT: f64 = 327.0; // 0-333 kg por canal sobre 0-10 V

/// Una muestra de fuerza vertical total (suma de canales).
///
/// El `timestamp` se deriva siempre del índice de muestra, nunca del reloj
/// de llegada del bloque.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub index: u64,
    pub timestamp: f64,
    pub force: f64,
}

/// Bloque de lecturas crudas multicanal tal como lo entrega la adquisición.
///
/// Layout: `readings[s * channel_count + c]`, muestra `s`, canal `c` (voltios).
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub start_sample_index: u64,
    pub channel_count: usize,
    pub readings: Vec<f64>,
}

impl Chunk {
    pub fn new(start_sample_index: u64, channel_count: usize, readings: Vec<f64>) -> Self {
        Self {
            start_sample_index,
            channel_count,
            readings,
        }
    }

    /// Construye un bloque desde filas `[muestra][canal]`
    pub fn from_rows(start_sample_index: u64, rows: &[Vec<f64>]) -> Self {
        let channel_count = rows.first().map(|r| r.len()).unwrap_or(0);
        let readings = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Self::new(start_sample_index, channel_count, readings)
    }

    pub fn sample_count(&self) -> usize {
        if self.channel_count == 0 {
            0
        } else {
            self.readings.len() / self.channel_count
        }
    }

    /// Un bloque es coherente si todas las filas tienen `channel_count` lecturas
    pub fn is_well_formed(&self) -> bool {
        self.channel_count > 0 && self.readings.len() % self.channel_count == 0
    }

    /// Itera las filas del bloque (una por muestra)
    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        self.readings.chunks_exact(self.channel_count.max(1))
    }

    /// Índice de la primera muestra posterior a este bloque
    pub fn end_sample_index(&self) -> u64 {
        self.start_sample_index + self.sample_count() as u64
    }
}

/// Tramo del historial que el analizador debe examinar tras un salto.
///
/// Todos los índices son índices absolutos de muestra de la sesión.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JumpWindow {
    pub jump_number: u32,
    /// Inicio del tramo (inicio de movimiento menos el margen previo)
    pub start_index: u64,
    /// Primera muestra que se desvió del peso corporal
    pub movement_start_index: u64,
    /// Primera muestra por debajo del umbral de vuelo
    pub takeoff_index: u64,
    /// Primera muestra de nuevo por encima del umbral
    pub landing_index: u64,
    /// Última muestra (incluida) que el analizador necesita
    pub end_index: u64,
}

impl JumpWindow {
    pub fn flight_samples(&self) -> u64 {
        self.landing_index.saturating_sub(self.takeoff_index)
    }

    pub fn len(&self) -> u64 {
        self.end_index.saturating_sub(self.start_index) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end_index < self.start_index
    }
}

/// Avisos de calidad adjuntos a cada resultado (no invalidan el salto)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QualityFlag {
    /// Tiempo de vuelo fuera del rango típico de un salto
    FlightTimeOutOfRange,
    /// Las alturas por tiempo de vuelo y por impulso no concuerdan
    HeightMethodsDisagree,
    /// La ventana de aterrizaje quedó recortada
    LandingWindowTruncated,
    /// Peso corporal calibrado sospechosamente bajo
    LowBodyweight,
}

/// Métricas de un salto. Se crean una sola vez y no se modifican.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JumpMetrics {
    pub jump_number: u32,
    pub bodyweight_n: f64,
    pub flight_time_seconds: f64,
    pub height_flight_method: f64,
    pub height_impulse_method: f64,
    pub net_impulse_ns: f64,
    pub takeoff_velocity: f64,
    pub peak_propulsive_force: f64,
    pub peak_landing_force: f64,
    pub contraction_time_ms: f64,
    pub movement_start_timestamp: f64,
    pub takeoff_timestamp: f64,
    pub landing_timestamp: f64,
    pub quality_flags: Vec<QualityFlag>,
}

impl JumpMetrics {
    pub fn has_flag(&self, flag: QualityFlag) -> bool {
        self.quality_flags.contains(&flag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_rows() {
        let chunk = Chunk::from_rows(10, &[vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]]);
        assert_eq!(chunk.channel_count, 2);
        assert_eq!(chunk.sample_count(), 3);
        assert_eq!(chunk.end_sample_index(), 13);

        let rows: Vec<&[f64]> = chunk.rows().collect();
        assert_eq!(rows[1], &[3.0, 4.0]);
    }

    #[test]
    fn test_chunk_malformed() {
        let chunk = Chunk::new(0, 3, vec![1.0, 2.0, 3.0, 4.0]);
        assert!(!chunk.is_well_formed());
        assert!(!Chunk::new(0, 0, vec![]).is_well_formed());
    }

    #[test]
    fn test_window_flight_samples() {
        let window = JumpWindow {
            jump_number: 1,
            start_index: 1500,
            movement_start_index: 2000,
            takeoff_index: 2000,
            landing_index: 2400,
            end_index: 2900,
        };
        assert_eq!(window.flight_samples(), 400);
        assert_eq!(window.len(), 1401);
    }
}
