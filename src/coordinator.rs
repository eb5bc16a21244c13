//! Coordinador del pipeline.
//!
//! Dueño único de buffer, calibración, detector y analizador. Cada bloque se
//! procesa de principio a fin en una sola llamada; hacia fuera solo salen
//! eventos e instantáneas de solo lectura.

use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};

use crate::analyzer::EventAnalyzer;
use crate::calibration::{
    CalibrationCurve, CalibrationEngine, CalibrationPhase, CalibrationSnapshot, CalibrationTarget,
};
use crate::config::PipelineConfig;
use crate::conversion::{ForceConverter, ZeroOffsetEstimator};
use crate::error::{PipelineError, Result};
use crate::events::{EventBus, PipelineEvent};
use crate::persistence::CalibrationRecord;
use crate::phase_detector::{DetectorParams, JumpPhase, PhaseDetector};
use crate::sample_buffer::SampleBuffer;
use crate::types::{Chunk, JumpMetrics};

/// Diferencia relativa del nuevo factor N/V a partir de la cual se avisa (%)
const CURVE_CHANGE_WARNING_PERCENT: f64 = 10.0;

pub struct Coordinator {
    config: PipelineConfig,
    converter: ForceConverter,
    buffer: SampleBuffer,
    calibration: CalibrationEngine,
    detector: PhaseDetector,
    analyzer: EventAnalyzer,
    bus: EventBus,

    ingesting: bool,
    plate_zeroed: bool,
    latest_metrics: Option<JumpMetrics>,
}

impl Coordinator {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            converter: ForceConverter::new(config.zero_offset_volts.clone(), config.n_per_volt),
            buffer: SampleBuffer::from_config(&config),
            calibration: CalibrationEngine::new(&config),
            detector: PhaseDetector::new(DetectorParams::from_config(&config)),
            analyzer: EventAnalyzer::new(&config)?,
            bus: EventBus::new(),
            ingesting: false,
            plate_zeroed: false,
            latest_metrics: None,
            config,
        })
    }

    /// Reinicia la sesión con una configuración nueva; los suscriptores se conservan
    pub fn reset_session(&mut self, config: PipelineConfig) -> Result<()> {
        config.validate()?;
        let analyzer = EventAnalyzer::new(&config)?;

        info!(
            sample_rate = config.sample_rate_hz,
            channels = config.channel_count,
            "Sesión reiniciada"
        );
        self.converter = ForceConverter::new(config.zero_offset_volts.clone(), config.n_per_volt);
        self.buffer = SampleBuffer::from_config(&config);
        self.calibration = CalibrationEngine::new(&config);
        self.detector = PhaseDetector::new(DetectorParams::from_config(&config));
        self.analyzer = analyzer;
        self.ingesting = false;
        self.plate_zeroed = false;
        self.latest_metrics = None;
        self.config = config;
        self.publish_calibration();
        Ok(())
    }

    pub fn subscribe(&mut self) -> Receiver<PipelineEvent> {
        self.bus.subscribe()
    }

    pub fn add_listener<F>(&mut self, listener: F)
    where
        F: FnMut(&PipelineEvent) + Send + 'static,
    {
        self.bus.add_listener(listener);
    }

    // ----- adquisición -----

    /// Empieza una sesión de adquisición: el buffer se vacía y los índices
    /// de muestra vuelven a 0
    pub fn start_ingestion(&mut self, session_start: f64) {
        self.buffer.reset(session_start);
        self.detector.reset();
        self.ingesting = true;
        info!(session_start, "Adquisición iniciada");
    }

    pub fn stop_ingestion(&mut self) {
        if !self.ingesting {
            return;
        }
        self.ingesting = false;

        if self.calibration.ingestion_stopped() {
            self.publish_calibration();
            self.publish_failure_of_calibration();
        }
        // Un salto pendiente se analiza con lo que haya
        if self.detector.pending_window().is_some() {
            self.analyze_pending();
        }
        info!(samples = self.buffer.next_index(), "Adquisición detenida");
    }

    pub fn is_ingesting(&self) -> bool {
        self.ingesting
    }

    /// Procesa un bloque completo: conversión, calibración, detección y,
    /// si la ventana pendiente ya está completa, análisis.
    pub fn process_chunk(&mut self, chunk: &Chunk) -> Result<()> {
        if !self.ingesting {
            return self.fail(PipelineError::precondition(
                "chunk received while ingestion is not active",
            ));
        }

        let readings = match self.buffer.append(chunk, &self.converter) {
            Ok(readings) => readings,
            Err(error) => {
                warn!(%error, start = chunk.start_sample_index, "Bloque rechazado");
                return self.fail(error);
            }
        };

        for reading in &readings {
            if self.calibration.is_running() {
                if self.calibration.feed(reading) {
                    self.on_calibration_progress();
                }
                continue;
            }

            if let Some(transition) = self.detector.feed(&reading.sample) {
                self.bus.publish(PipelineEvent::PhaseChanged(transition));
            }
        }

        let window_complete = self
            .detector
            .pending_window()
            .is_some_and(|w| self.buffer.next_index() > w.end_index);
        if window_complete {
            self.analyze_pending();
        }

        self.bus.publish(PipelineEvent::ChunkProcessed {
            sample_count: readings.len(),
            latest_force: self.buffer.latest_force().unwrap_or(0.0),
        });
        Ok(())
    }

    fn on_calibration_progress(&mut self) {
        match self.calibration.phase() {
            CalibrationPhase::Complete => {
                if let Some(baseline) = self.calibration.bodyweight() {
                    self.detector.set_bodyweight(Some(baseline.bodyweight_n));
                }
            }
            CalibrationPhase::Failed => self.publish_failure_of_calibration(),
            _ => {}
        }
        self.publish_calibration();
    }

    fn analyze_pending(&mut self) {
        let Some(window) = self.detector.pending_window().copied() else {
            return;
        };
        let Some(baseline) = self.calibration.bodyweight().cloned() else {
            self.detector.abort_pending();
            return;
        };

        match self.analyzer.analyze(&window, &self.buffer, &baseline) {
            Ok(metrics) => {
                self.detector.mark_analyzed();
                self.latest_metrics = Some(metrics.clone());
                self.bus.publish(PipelineEvent::JumpAnalyzed(metrics));
            }
            Err(error) => {
                warn!(%error, jump = window.jump_number, "Análisis de salto fallido");
                self.detector.abort_pending();
                self.publish_error(&error);
            }
        }
    }

    // ----- puesta a cero -----

    /// Promedia lecturas instantáneas sin carga y fija el offset de cero.
    /// Solo con la adquisición parada.
    pub fn zero_plate(&mut self, rows: &[Vec<f64>]) -> Result<Vec<f64>> {
        if self.ingesting {
            return self.fail(PipelineError::precondition(
                "cannot zero the plate while ingestion is active",
            ));
        }
        // Siempre las 100 lecturas completas; con menos, `finish` falla
        let mut estimator = ZeroOffsetEstimator::new(
            self.config.channel_count,
            ZeroOffsetEstimator::DEFAULT_SAMPLES,
        );
        for row in rows {
            if let Err(error) = estimator.push(row) {
                return self.fail(error);
            }
        }
        let offset = match estimator.finish() {
            Ok(offset) => offset,
            Err(error) => return self.fail(error),
        };
        self.set_zero_offset(offset.clone())?;
        Ok(offset)
    }

    pub fn set_zero_offset(&mut self, offset: Vec<f64>) -> Result<()> {
        if let Err(error) = self.converter.set_zero_offset(offset) {
            return self.fail(error);
        }
        self.plate_zeroed = true;
        info!(offset = ?self.converter.zero_offset(), "Plataforma puesta a cero");
        Ok(())
    }

    pub fn is_plate_zeroed(&self) -> bool {
        self.plate_zeroed
    }

    // ----- calibración -----

    pub fn start_calibration(&mut self, target: CalibrationTarget) -> Result<()> {
        if let Err(error) = self
            .calibration
            .start(target, self.ingesting, self.plate_zeroed)
        {
            return self.fail(error);
        }
        self.publish_calibration();
        Ok(())
    }

    pub fn abort_calibration(&mut self) -> bool {
        let aborted = self.calibration.abort();
        if aborted {
            self.publish_calibration();
        }
        aborted
    }

    /// Ajusta la curva N/V con las mediciones de referencia (no la aplica)
    pub fn complete_calibration(&mut self) -> Result<CalibrationCurve> {
        let result = self.calibration.complete();
        self.publish_calibration();
        match result {
            Ok(curve) => {
                let change = curve.percent_change(self.converter.n_per_volt());
                if change > CURVE_CHANGE_WARNING_PERCENT {
                    warn!(
                        current = self.converter.n_per_volt(),
                        new = curve.n_per_volt,
                        change_percent = change,
                        "El nuevo factor difiere mucho del actual"
                    );
                }
                Ok(curve)
            }
            Err(error) => {
                self.publish_error(&error);
                Err(error)
            }
        }
    }

    /// Aplica la última curva ajustada al conversor
    pub fn apply_calibration(&mut self) -> Result<f64> {
        let Some(curve) = self.calibration.curve() else {
            return self.fail(PipelineError::precondition("no fitted calibration curve"));
        };
        let n_per_volt = curve.n_per_volt;
        self.converter.set_n_per_volt(n_per_volt);
        info!(n_per_volt, "Factor de calibración aplicado");
        Ok(n_per_volt)
    }

    pub fn remove_measurement(&mut self, kg: f64, position: usize) -> bool {
        let removed = self.calibration.remove_measurement(kg, position);
        if removed {
            self.publish_calibration();
        }
        removed
    }

    pub fn clear_measurements(&mut self) {
        self.calibration.clear_measurements();
        self.publish_calibration();
    }

    pub fn calibration_record(&self) -> CalibrationRecord {
        CalibrationRecord::from_engine(&self.calibration, self.converter.n_per_volt())
    }

    /// Restaura mediciones y factor N/V de un registro guardado
    pub fn load_calibration_record(&mut self, record: &CalibrationRecord) -> Result<()> {
        if self.calibration.is_running() {
            return self.fail(PipelineError::precondition(
                "cannot load a calibration record while measuring",
            ));
        }
        record.apply_to(&mut self.calibration);
        self.converter.set_n_per_volt(record.n_per_volt);
        debug!(n_per_volt = record.n_per_volt, "Registro de calibración restaurado");
        self.publish_calibration();
        Ok(())
    }

    // ----- consultas -----

    pub fn calibration_snapshot(&self) -> CalibrationSnapshot {
        self.calibration.snapshot()
    }

    pub fn latest_metrics(&self) -> Option<&JumpMetrics> {
        self.latest_metrics.as_ref()
    }

    pub fn phase(&self) -> JumpPhase {
        self.detector.phase()
    }

    pub fn buffer(&self) -> &SampleBuffer {
        &self.buffer
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn n_per_volt(&self) -> f64 {
        self.converter.n_per_volt()
    }

    /// Descarta un salto pendiente de análisis
    pub fn abort_pending_jump(&mut self) -> bool {
        self.detector.abort_pending().is_some()
    }

    // ----- publicación -----

    fn publish_calibration(&mut self) {
        let snapshot = self.calibration.snapshot();
        self.bus
            .publish(PipelineEvent::CalibrationStateChanged(snapshot));
    }

    fn publish_failure_of_calibration(&mut self) {
        if let Some(error) = self.calibration.snapshot().failure {
            self.publish_error(&error);
        }
    }

    fn publish_error(&mut self, error: &PipelineError) {
        self.bus.publish(PipelineEvent::PipelineError {
            kind: error.kind(),
            message: error.to_string(),
        });
    }

    fn fail<T>(&mut self, error: PipelineError) -> Result<T> {
        self.publish_error(&error);
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    /// Un canal, 1 N/V: el voltaje es directamente la fuerza
    fn config() -> PipelineConfig {
        PipelineConfig {
            channel_count: 1,
            zero_offset_volts: vec![0.0],
            n_per_volt: 1.0,
            calibration_countdown_secs: 0.1,
            calibration_window_secs: 0.5,
            ..Default::default()
        }
    }

    struct Feeder {
        next: u64,
    }

    impl Feeder {
        fn send(&mut self, coordinator: &mut Coordinator, forces: &[f64]) -> Result<()> {
            for part in forces.chunks(500) {
                let chunk = Chunk::new(self.next, 1, part.to_vec());
                self.next += part.len() as u64;
                coordinator.process_chunk(&chunk)?;
            }
            Ok(())
        }

        fn constant(&mut self, c: &mut Coordinator, force: f64, n: usize) {
            self.send(c, &vec![force; n]).unwrap();
        }
    }

    fn calibrated() -> (Coordinator, Feeder, Receiver<PipelineEvent>) {
        let mut c = Coordinator::new(config()).unwrap();
        let rx = c.subscribe();
        c.start_ingestion(0.0);
        let mut feeder = Feeder { next: 0 };
        c.start_calibration(CalibrationTarget::Bodyweight).unwrap();
        feeder.constant(&mut c, 700.0, 1000);
        assert_eq!(c.calibration_snapshot().phase, CalibrationPhase::Complete);
        (c, feeder, rx)
    }

    #[test]
    fn test_chunk_rejected_when_not_ingesting() {
        let mut c = Coordinator::new(config()).unwrap();
        let rx = c.subscribe();
        let err = c.process_chunk(&Chunk::new(0, 1, vec![1.0; 10])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionNotMet);
        assert!(matches!(
            rx.try_recv(),
            Ok(PipelineEvent::PipelineError {
                kind: ErrorKind::PreconditionNotMet,
                ..
            })
        ));
    }

    #[test]
    fn test_calibration_requires_ingestion() {
        let mut c = Coordinator::new(config()).unwrap();
        assert!(c.start_calibration(CalibrationTarget::Bodyweight).is_err());
        assert_eq!(c.calibration_snapshot().phase, CalibrationPhase::Idle);

        c.start_ingestion(0.0);
        // Peso de referencia sin poner a cero
        assert!(c
            .start_calibration(CalibrationTarget::ReferenceWeight { kg: 10.0 })
            .is_err());
    }

    #[test]
    fn test_detects_and_analyzes_jump() {
        let (mut c, mut feeder, rx) = calibrated();
        feeder.constant(&mut c, 700.0, 1000);
        feeder.constant(&mut c, 0.0, 400);
        feeder.constant(&mut c, 700.0, 1100);

        let metrics = c.latest_metrics().cloned().unwrap();
        assert!((metrics.flight_time_seconds - 0.4).abs() <= 0.001);
        assert!((metrics.height_flight_method - 0.7848).abs() < 0.01);

        let events: Vec<PipelineEvent> = rx.try_iter().collect();
        let jumps = events
            .iter()
            .filter(|e| matches!(e, PipelineEvent::JumpAnalyzed(_)))
            .count();
        assert_eq!(jumps, 1);
        assert!(events
            .iter()
            .any(|e| matches!(e, PipelineEvent::PhaseChanged(t) if t.to == JumpPhase::Flight)));
        assert!(c.detector.pending_window().is_none());
    }

    #[test]
    fn test_discontinuous_chunk_leaves_state_untouched() {
        let (mut c, mut feeder, _rx) = calibrated();
        let before = c.buffer().next_index();
        let err = c
            .process_chunk(&Chunk::new(before + 5, 1, vec![700.0; 10]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidChunk);
        assert_eq!(c.buffer().next_index(), before);

        // La sesión sigue
        feeder.constant(&mut c, 700.0, 10);
        assert_eq!(c.buffer().next_index(), before + 10);
    }

    #[test]
    fn test_stop_ingestion_fails_running_calibration() {
        let mut c = Coordinator::new(config()).unwrap();
        let rx = c.subscribe();
        c.start_ingestion(0.0);
        c.start_calibration(CalibrationTarget::Bodyweight).unwrap();
        let mut feeder = Feeder { next: 0 };
        feeder.constant(&mut c, 700.0, 50);

        c.stop_ingestion();
        let snapshot = c.calibration_snapshot();
        assert_eq!(snapshot.phase, CalibrationPhase::Failed);
        assert!(rx.try_iter().any(|e| matches!(
            e,
            PipelineEvent::PipelineError {
                kind: ErrorKind::InsufficientSamples,
                ..
            }
        )));
    }

    #[test]
    fn test_reference_calibration_and_apply() {
        let mut c = Coordinator::new(config()).unwrap();
        c.zero_plate(&vec![vec![0.0]; 100]).unwrap();
        assert!(c.is_plate_zeroed());
        c.start_ingestion(0.0);
        let mut feeder = Feeder { next: 0 };

        // Factor real 300 N/V: el conversor a 1 N/V deja pasar los voltios
        for kg in [0.0, 10.0] {
            for _ in 0..2 {
                c.start_calibration(CalibrationTarget::ReferenceWeight { kg })
                    .unwrap();
                let volts = kg * crate::types::GRAVITY / 300.0;
                feeder.constant(&mut c, volts, 700);
                assert_eq!(c.calibration_snapshot().phase, CalibrationPhase::Complete);
            }
        }

        let curve = c.complete_calibration().unwrap();
        assert!((curve.n_per_volt - 300.0).abs() < 1e-6);
        assert_eq!(c.apply_calibration().unwrap(), curve.n_per_volt);
        assert_eq!(c.n_per_volt(), curve.n_per_volt);

        let record = c.calibration_record();
        assert_eq!(record.measurement_count(), 4);
    }

    #[test]
    fn test_zeroing_rejected_while_ingesting() {
        let mut c = Coordinator::new(config()).unwrap();
        c.start_ingestion(0.0);
        assert!(c.zero_plate(&vec![vec![0.0]; 100]).is_err());
        assert!(!c.is_plate_zeroed());
    }

    #[test]
    fn test_zeroing_needs_full_set_of_readings() {
        let mut c = Coordinator::new(config()).unwrap();
        let rx = c.subscribe();
        let err = c.zero_plate(&vec![vec![0.02]; 1]).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InsufficientSamples {
                expected: 100,
                actual: 1
            }
        ));
        assert!(!c.is_plate_zeroed());
        assert!(rx.try_iter().any(|e| matches!(
            e,
            PipelineEvent::PipelineError {
                kind: ErrorKind::InsufficientSamples,
                ..
            }
        )));

        let offset = c.zero_plate(&vec![vec![0.02]; 100]).unwrap();
        assert!((offset[0] - 0.02).abs() < 1e-12);
        assert!(c.is_plate_zeroed());
    }

    #[test]
    fn test_step_trace_right_after_calibration() {
        let (mut c, mut feeder, rx) = calibrated();
        let _ = rx.try_iter().count();
        feeder.constant(&mut c, 700.0, 1000);
        feeder.constant(&mut c, 0.0, 400);
        feeder.constant(&mut c, 700.0, 1500);

        let jumps: Vec<JumpMetrics> = rx
            .try_iter()
            .filter_map(|e| match e {
                PipelineEvent::JumpAnalyzed(m) => Some(m),
                _ => None,
            })
            .collect();
        assert_eq!(jumps.len(), 1);
        assert!((jumps[0].flight_time_seconds - 0.4).abs() <= 0.001);
    }

    #[test]
    fn test_aborted_recalibration_keeps_detection() {
        let (mut c, mut feeder, rx) = calibrated();
        c.start_calibration(CalibrationTarget::Bodyweight).unwrap();
        feeder.constant(&mut c, 650.0, 300);
        assert!(c.abort_calibration());

        assert_eq!(c.detector.bodyweight(), Some(700.0));
        let bw = c.calibration_snapshot().bodyweight.unwrap();
        assert!((bw.bodyweight_n - 700.0).abs() < 1e-9);

        let _ = rx.try_iter().count();
        feeder.constant(&mut c, 700.0, 1000);
        feeder.constant(&mut c, 0.0, 400);
        feeder.constant(&mut c, 700.0, 1100);
        assert!(rx
            .try_iter()
            .any(|e| matches!(e, PipelineEvent::JumpAnalyzed(_))));
    }

    #[test]
    fn test_interrupted_recalibration_keeps_detection() {
        let (mut c, mut feeder, _rx) = calibrated();
        c.start_calibration(CalibrationTarget::Bodyweight).unwrap();
        feeder.constant(&mut c, 650.0, 50);
        c.stop_ingestion();
        assert_eq!(c.calibration_snapshot().phase, CalibrationPhase::Failed);
        assert_eq!(c.detector.bodyweight(), Some(700.0));

        // Nueva sesión de adquisición: índices desde 0 y el peso anterior sigue vigente
        c.start_ingestion(10.0);
        let rx = c.subscribe();
        let mut feeder = Feeder { next: 0 };
        feeder.constant(&mut c, 700.0, 1000);
        feeder.constant(&mut c, 0.0, 400);
        feeder.constant(&mut c, 700.0, 1100);
        let jumps = rx
            .try_iter()
            .filter(|e| matches!(e, PipelineEvent::JumpAnalyzed(_)))
            .count();
        assert_eq!(jumps, 1);
    }

    #[test]
    fn test_reference_measurement_does_not_resume_stale_movement() {
        let (mut c, mut feeder, rx) = calibrated();
        c.set_zero_offset(vec![0.0]).unwrap();
        feeder.constant(&mut c, 700.0, 600);
        // Inicio de movimiento que no llega a confirmarse
        feeder.constant(&mut c, 600.0, 6);

        c.start_calibration(CalibrationTarget::ReferenceWeight { kg: 10.0 })
            .unwrap();
        feeder.constant(&mut c, 600.0, 700);
        assert_eq!(c.calibration_snapshot().phase, CalibrationPhase::Complete);

        let _ = rx.try_iter().count();
        feeder.constant(&mut c, 600.0, 6);
        let transitions = rx
            .try_iter()
            .filter(|e| matches!(e, PipelineEvent::PhaseChanged(_)))
            .count();
        assert_eq!(transitions, 0);
        assert_eq!(c.phase(), JumpPhase::Standing);
    }

    #[test]
    fn test_reset_session_keeps_subscribers() {
        let (mut c, _feeder, rx) = calibrated();
        let _ = rx.try_iter().count();

        c.reset_session(config()).unwrap();
        assert!(!c.is_ingesting());
        assert!(c.buffer().is_empty());
        assert!(c.calibration_snapshot().bodyweight.is_none());
        assert!(matches!(
            rx.try_recv(),
            Ok(PipelineEvent::CalibrationStateChanged(_))
        ));
    }
}
