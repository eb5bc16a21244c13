use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::calibration::CalibrationSnapshot;
use crate::error::ErrorKind;
use crate::phase_detector::PhaseTransition;
use crate::types::JumpMetrics;

/// Eventos que el núcleo publica hacia fuera (interfaz, persistencia, logs)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PipelineEvent {
    ChunkProcessed { sample_count: usize, latest_force: f64 },
    CalibrationStateChanged(CalibrationSnapshot),
    PhaseChanged(PhaseTransition),
    JumpAnalyzed(JumpMetrics),
    PipelineError { kind: ErrorKind, message: String },
}

type Listener = Box<dyn FnMut(&PipelineEvent) + Send>;

/// Reparte cada evento a todos los suscriptores.
///
/// Los suscriptores reciben copias; nunca referencias al estado interno.
#[derive(Default)]
pub struct EventBus {
    senders: Vec<Sender<PipelineEvent>>,
    listeners: Vec<Listener>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nuevo receptor por canal
    pub fn subscribe(&mut self) -> Receiver<PipelineEvent> {
        let (tx, rx) = unbounded();
        self.senders.push(tx);
        rx
    }

    /// Callback invocado en el hilo de procesamiento
    pub fn add_listener<F>(&mut self, listener: F)
    where
        F: FnMut(&PipelineEvent) + Send + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    pub fn publish(&mut self, event: PipelineEvent) {
        for listener in self.listeners.iter_mut() {
            listener(&event);
        }
        // Los receptores cerrados se olvidan
        self.senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders.len() + self.listeners.len()
    }
}
