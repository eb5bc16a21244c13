//! Procesamiento en tiempo real de una plataforma de fuerzas para saltos verticales.
//!
//! Flujo: bloques crudos → `SampleBuffer` → calibración o detector de fases →
//! analizador de eventos → métricas del salto publicadas como eventos.

pub mod analyzer;
pub mod calibration;
pub mod config;
pub mod conversion;
pub mod coordinator;
pub mod csv_loader;
pub mod error;
pub mod events;
pub mod filter;
pub mod logging;
pub mod persistence;
pub mod phase_detector;
pub mod runtime;
pub mod sample_buffer;
pub mod simulator;
pub mod types;

pub use config::PipelineConfig;
pub use coordinator::Coordinator;
pub use error::{PipelineError, Result};
pub use events::PipelineEvent;
