//! Hilo único de procesamiento.
//!
//! La adquisición entrega bloques por un canal acotado; las órdenes de la
//! interfaz llegan por otro canal. Un solo hilo es dueño del `Coordinator`,
//! así que nada del núcleo necesita cerrojos.

use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context};
use crossbeam_channel::{bounded, never, select, unbounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::calibration::CalibrationTarget;
use crate::config::PipelineConfig;
use crate::coordinator::Coordinator;
use crate::error::{PipelineError, Result};
use crate::events::PipelineEvent;
use crate::persistence::CalibrationRecord;
use crate::types::Chunk;

/// Órdenes aceptadas por el hilo de procesamiento
#[derive(Debug, Clone)]
pub enum Command {
    StartIngestion { session_start: f64 },
    StopIngestion,
    ZeroPlate(Vec<Vec<f64>>),
    SetZeroOffset(Vec<f64>),
    StartCalibration(CalibrationTarget),
    AbortCalibration,
    CompleteCalibration,
    ApplyCalibration,
    RemoveMeasurement { kg: f64, position: usize },
    ClearMeasurements,
    LoadCalibration(CalibrationRecord),
    AbortPendingJump,
    ResetSession(PipelineConfig),
    Shutdown,
}

/// Acceso al pipeline en marcha
pub struct PipelineHandle {
    chunk_tx: Sender<Chunk>,
    command_tx: Sender<Command>,
    events: Receiver<PipelineEvent>,
    worker: JoinHandle<Coordinator>,
}

impl PipelineHandle {
    /// Lanza el hilo de procesamiento con el coordinador dado
    pub fn spawn(mut coordinator: Coordinator) -> anyhow::Result<Self> {
        let capacity = coordinator.config().channel_capacity;
        let backlog_warning = coordinator.config().backlog_warning;
        let (chunk_tx, chunk_rx) = bounded::<Chunk>(capacity);
        let (command_tx, command_rx) = unbounded::<Command>();
        let events = coordinator.subscribe();

        let worker = thread::Builder::new()
            .name("pipeline".to_string())
            .spawn(move || run(coordinator, chunk_rx, command_rx, backlog_warning))
            .context("No se pudo lanzar el hilo de procesamiento")?;

        Ok(Self {
            chunk_tx,
            command_tx,
            events,
            worker,
        })
    }

    /// Emisor para el colaborador de adquisición
    pub fn chunk_sender(&self) -> Sender<Chunk> {
        self.chunk_tx.clone()
    }

    pub fn send_command(&self, command: Command) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|_| PipelineError::precondition("processing thread has stopped"))
    }

    pub fn events(&self) -> &Receiver<PipelineEvent> {
        &self.events
    }

    /// Procesa lo pendiente, detiene el hilo y devuelve el coordinador
    pub fn shutdown(self) -> anyhow::Result<Coordinator> {
        let Self {
            chunk_tx,
            command_tx,
            worker,
            ..
        } = self;
        drop(chunk_tx);
        // Si el hilo ya terminó el envío falla; da igual
        let _ = command_tx.send(Command::Shutdown);
        worker
            .join()
            .map_err(|_| anyhow!("El hilo de procesamiento terminó con pánico"))
    }
}

fn run(
    mut coordinator: Coordinator,
    chunk_rx: Receiver<Chunk>,
    command_rx: Receiver<Command>,
    backlog_warning: usize,
) -> Coordinator {
    let closed = never::<Chunk>();
    let mut chunks_open = true;
    let mut falling_behind = false;

    info!("Hilo de procesamiento iniciado");

    loop {
        select! {
            recv(command_rx) -> msg => match msg {
                Ok(Command::Shutdown) | Err(_) => {
                    // Primero el backlog completo: nunca se descartan bloques
                    let pending: Vec<Chunk> = chunk_rx.try_iter().collect();
                    if !pending.is_empty() {
                        debug!(chunks = pending.len(), "Procesando backlog antes de salir");
                    }
                    for chunk in &pending {
                        let _ = coordinator.process_chunk(chunk);
                    }
                    break;
                }
                Ok(command) => apply_command(&mut coordinator, command),
            },
            recv(if chunks_open { &chunk_rx } else { &closed }) -> msg => match msg {
                Ok(chunk) => {
                    let backlog = chunk_rx.len();
                    if backlog >= backlog_warning && !falling_behind {
                        warn!(backlog, "Procesamiento retrasado respecto a la adquisición");
                        falling_behind = true;
                    } else if backlog == 0 && falling_behind {
                        info!("Backlog recuperado");
                        falling_behind = false;
                    }
                    // Los errores ya se publican como eventos
                    let _ = coordinator.process_chunk(&chunk);
                }
                Err(_) => {
                    debug!("Emisor de bloques cerrado");
                    chunks_open = false;
                }
            },
        }
    }

    info!("Hilo de procesamiento detenido");
    coordinator
}

fn apply_command(coordinator: &mut Coordinator, command: Command) {
    debug!(?command, "Orden recibida");
    let result = match command {
        Command::StartIngestion { session_start } => {
            coordinator.start_ingestion(session_start);
            Ok(())
        }
        Command::StopIngestion => {
            coordinator.stop_ingestion();
            Ok(())
        }
        Command::ZeroPlate(rows) => coordinator.zero_plate(&rows).map(|_| ()),
        Command::SetZeroOffset(offset) => coordinator.set_zero_offset(offset),
        Command::StartCalibration(target) => coordinator.start_calibration(target),
        Command::AbortCalibration => {
            coordinator.abort_calibration();
            Ok(())
        }
        Command::CompleteCalibration => coordinator.complete_calibration().map(|_| ()),
        Command::ApplyCalibration => coordinator.apply_calibration().map(|_| ()),
        Command::RemoveMeasurement { kg, position } => {
            coordinator.remove_measurement(kg, position);
            Ok(())
        }
        Command::ClearMeasurements => {
            coordinator.clear_measurements();
            Ok(())
        }
        Command::LoadCalibration(record) => coordinator.load_calibration_record(&record),
        Command::AbortPendingJump => {
            coordinator.abort_pending_jump();
            Ok(())
        }
        Command::ResetSession(config) => coordinator.reset_session(config),
        Command::Shutdown => Ok(()),
    };

    if let Err(error) = result {
        debug!(%error, "Orden rechazada");
    }
}
