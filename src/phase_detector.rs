use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::types::{JumpWindow, Sample};

/// Parámetros del detector de fases (en muestras salvo los umbrales)
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorParams {
    /// Umbral absoluto de vuelo en N (default: 20)
    pub flight_threshold_n: f64,
    /// Desviación del peso corporal que inicia el movimiento (default: 50 N)
    pub movement_delta_n: f64,
    /// Muestras consecutivas para confirmar una transición (default: 10)
    pub min_contact_samples: usize,
    /// Muestras estables para volver a `Standing` (default: 500)
    pub quiet_samples: usize,
    /// Margen previo incluido en la ventana (default: 500)
    pub pre_roll_samples: usize,
    /// Muestras tras el aterrizaje que necesita el análisis (default: 500)
    pub landing_window_samples: usize,
    /// Movimiento más largo que esto sin despegar se descarta (default: 4000)
    pub max_movement_samples: usize,
    /// Vuelo más largo que esto se descarta (default: 1500)
    pub max_flight_samples: usize,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl DetectorParams {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            flight_threshold_n: config.flight_threshold_n,
            movement_delta_n: config.movement_delta_n,
            min_contact_samples: config.min_contact_samples.max(1),
            quiet_samples: config.secs_to_samples(config.quiet_time_secs).max(1),
            pre_roll_samples: config.secs_to_samples(config.pre_roll_secs),
            landing_window_samples: config.secs_to_samples(config.landing_window_secs),
            max_movement_samples: config.secs_to_samples(config.max_movement_secs),
            max_flight_samples: config.secs_to_samples(config.max_flight_secs),
        }
    }
}

/// Fases de un salto
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JumpPhase {
    /// De pie y quieto sobre la plataforma
    Standing,
    /// Contramovimiento / impulso, aún en contacto
    Movement,
    /// En el aire
    Flight,
    /// Recién aterrizado, esperando a que se estabilice
    Landing,
}

/// Motivo por el que una fase se abandonó sin completar el salto
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    /// Volvió al peso corporal sin despegar
    MovementSettled,
    /// Movimiento demasiado largo sin despegar
    MovementTimeout,
    /// Vuelo demasiado largo: se bajó de la plataforma
    FlightTimeout,
}

/// Transición confirmada.
///
/// `index` es la muestra donde se cruzó el umbral por primera vez;
/// `confirmed_index` la muestra donde el anti-rebote la dio por buena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: JumpPhase,
    pub to: JumpPhase,
    pub index: u64,
    pub confirmed_index: u64,
    pub abort: Option<AbortReason>,
    /// Presente solo en `Flight → Landing`
    pub window: Option<JumpWindow>,
}

/// Racha de muestras consecutivas que cumplen una condición
#[derive(Debug, Clone, Copy, Default)]
struct Run {
    len: usize,
    start: u64,
}

impl Run {
    fn update(&mut self, holds: bool, index: u64) {
        if holds {
            if self.len == 0 {
                self.start = index;
            }
            self.len += 1;
        } else {
            self.len = 0;
        }
    }
}

/// Detector de fases en streaming.
///
/// Una única variable `phase` es la fuente de verdad; como mucho se produce
/// una transición por muestra.
pub struct PhaseDetector {
    params: DetectorParams,
    bodyweight: Option<f64>,
    phase: JumpPhase,
    last_transition_index: u64,
    /// Solo se reconoce un salto tras un periodo quieto sobre la plataforma
    armed: bool,

    deviating: Run,
    quiet: Run,
    below: Run,
    above: Run,

    movement_start: u64,
    takeoff: u64,
    pending: Option<JumpWindow>,
    jump_count: u32,
    /// Última muestra vista, para detectar huecos en la secuencia
    last_index: Option<u64>,
}

impl PhaseDetector {
    pub fn new(params: DetectorParams) -> Self {
        Self {
            params,
            bodyweight: None,
            phase: JumpPhase::Standing,
            last_transition_index: 0,
            armed: false,
            deviating: Run::default(),
            quiet: Run::default(),
            below: Run::default(),
            above: Run::default(),
            movement_start: 0,
            takeoff: 0,
            pending: None,
            jump_count: 0,
            last_index: None,
        }
    }

    /// Fija la línea base; sin ella el detector no hace nada
    pub fn set_bodyweight(&mut self, bodyweight: Option<f64>) {
        if self.bodyweight != bodyweight {
            self.bodyweight = bodyweight;
            self.reset();
        }
    }

    pub fn bodyweight(&self) -> Option<f64> {
        self.bodyweight
    }

    /// Vuelve a `Standing` descartando cualquier salto en curso o pendiente
    pub fn reset(&mut self) {
        self.phase = JumpPhase::Standing;
        self.armed = false;
        self.deviating = Run::default();
        self.quiet = Run::default();
        self.below = Run::default();
        self.above = Run::default();
        self.movement_start = 0;
        self.takeoff = 0;
        self.pending = None;
        self.last_index = None;
    }

    /// Hubo muestras que no pasaron por el detector (p. ej. durante una
    /// calibración): las rachas y el salto en curso dejan de valer.
    /// La ventana pendiente se conserva; sus muestras siguen en el buffer.
    fn interrupt(&mut self, index: u64) {
        debug!(index, phase = ?self.phase, "Hueco en la secuencia de muestras");
        self.deviating = Run::default();
        self.quiet = Run::default();
        self.below = Run::default();
        self.above = Run::default();
        self.armed = false;
        if matches!(self.phase, JumpPhase::Movement | JumpPhase::Flight) {
            self.phase = JumpPhase::Standing;
        }
    }

    /// Procesa una muestra y devuelve la transición confirmada, si la hay
    pub fn feed(&mut self, sample: &Sample) -> Option<PhaseTransition> {
        let index = sample.index;
        if self.last_index.is_some_and(|last| index != last + 1) {
            self.interrupt(index);
        }
        self.last_index = Some(index);

        let bodyweight = self.bodyweight?;
        let force = sample.force;

        let deviates = (force - bodyweight).abs() > self.params.movement_delta_n;
        self.deviating.update(deviates, index);
        self.quiet.update(!deviates, index);
        let below = force < self.params.flight_threshold_n;
        self.below.update(below, index);
        self.above.update(!below, index);

        let min_contact = self.params.min_contact_samples;

        match self.phase {
            JumpPhase::Standing => {
                if !self.armed {
                    self.armed = self.quiet.len >= self.params.quiet_samples;
                    return None;
                }
                if self.pending.is_none() && self.deviating.len >= min_contact {
                    self.movement_start = self.deviating.start;
                    return Some(self.transition(JumpPhase::Movement, self.movement_start, index));
                }
                None
            }

            JumpPhase::Movement => {
                if self.below.len >= min_contact {
                    self.takeoff = self.below.start;
                    return Some(self.transition(JumpPhase::Flight, self.takeoff, index));
                }
                if self.quiet.len >= self.params.quiet_samples {
                    return Some(self.abort(AbortReason::MovementSettled, self.quiet.start, index));
                }
                if index - self.movement_start > self.params.max_movement_samples as u64 {
                    return Some(self.abort(AbortReason::MovementTimeout, index, index));
                }
                None
            }

            JumpPhase::Flight => {
                if self.above.len >= min_contact {
                    let landing = self.above.start;
                    let window = self.build_window(landing);
                    self.pending = Some(window);
                    info!(
                        jump = window.jump_number,
                        takeoff = window.takeoff_index,
                        landing = window.landing_index,
                        flight_samples = window.flight_samples(),
                        "Salto detectado"
                    );
                    let mut t = self.transition(JumpPhase::Landing, landing, index);
                    t.window = Some(window);
                    return Some(t);
                }
                if index - self.takeoff > self.params.max_flight_samples as u64 {
                    return Some(self.abort(AbortReason::FlightTimeout, index, index));
                }
                None
            }

            JumpPhase::Landing => {
                if self.quiet.len >= self.params.quiet_samples {
                    self.armed = true;
                    return Some(self.transition(JumpPhase::Standing, self.quiet.start, index));
                }
                None
            }
        }
    }

    fn build_window(&mut self, landing: u64) -> JumpWindow {
        self.jump_count += 1;
        JumpWindow {
            jump_number: self.jump_count,
            start_index: self
                .movement_start
                .saturating_sub(self.params.pre_roll_samples as u64),
            movement_start_index: self.movement_start,
            takeoff_index: self.takeoff,
            landing_index: landing,
            end_index: landing + self.params.landing_window_samples as u64,
        }
    }

    fn transition(&mut self, to: JumpPhase, index: u64, confirmed_index: u64) -> PhaseTransition {
        let from = self.phase;
        debug!(?from, ?to, index, confirmed_index, "Transición de fase");
        self.phase = to;
        self.last_transition_index = index;
        PhaseTransition {
            from,
            to,
            index,
            confirmed_index,
            abort: None,
            window: None,
        }
    }

    fn abort(&mut self, reason: AbortReason, index: u64, confirmed_index: u64) -> PhaseTransition {
        info!(?reason, phase = ?self.phase, index, "Salto descartado");
        // Tras un movimiento asentado ya hay periodo quieto; en otro caso hay que esperarlo
        self.armed = reason == AbortReason::MovementSettled;
        let mut t = self.transition(JumpPhase::Standing, index, confirmed_index);
        t.abort = Some(reason);
        t
    }

    /// Ventana pendiente de análisis
    pub fn pending_window(&self) -> Option<&JumpWindow> {
        self.pending.as_ref()
    }

    /// El análisis terminó con éxito: libera la ventana pendiente
    pub fn mark_analyzed(&mut self) -> Option<JumpWindow> {
        self.pending.take()
    }

    /// El análisis falló: se descarta la ventana y se vuelve a `Standing`
    pub fn abort_pending(&mut self) -> Option<JumpWindow> {
        let window = self.pending.take();
        self.reset();
        window
    }

    pub fn phase(&self) -> JumpPhase {
        self.phase
    }

    /// Longitud de la racha actual de contacto (fuerza ≥ umbral de vuelo)
    pub fn contact_run_length(&self) -> usize {
        self.above.len
    }

    pub fn last_transition_index(&self) -> u64 {
        self.last_transition_index
    }

    pub fn jump_count(&self) -> u32 {
        self.jump_count
    }

    pub fn params(&self) -> &DetectorParams {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> PhaseDetector {
        let mut d = PhaseDetector::new(DetectorParams::default());
        d.set_bodyweight(Some(700.0));
        d
    }

    /// Alimenta la traza y recoge todas las transiciones
    fn run(detector: &mut PhaseDetector, forces: &[f64]) -> Vec<PhaseTransition> {
        forces
            .iter()
            .enumerate()
            .filter_map(|(i, &force)| {
                detector.feed(&Sample {
                    index: i as u64,
                    timestamp: i as f64 / 1000.0,
                    force,
                })
            })
            .collect()
    }

    fn trace(parts: &[(f64, usize)]) -> Vec<f64> {
        parts
            .iter()
            .flat_map(|&(f, n)| std::iter::repeat(f).take(n))
            .collect()
    }

    #[test]
    fn test_synthetic_jump() {
        let mut d = detector();
        let forces = trace(&[(700.0, 2000), (0.0, 400), (700.0, 1500)]);
        let transitions = run(&mut d, &forces);

        let phases: Vec<JumpPhase> = transitions.iter().map(|t| t.to).collect();
        assert_eq!(
            phases,
            vec![
                JumpPhase::Movement,
                JumpPhase::Flight,
                JumpPhase::Landing,
                JumpPhase::Standing
            ]
        );

        // Índices del primer cruce, no de la confirmación
        assert_eq!(transitions[1].index, 2000);
        assert_eq!(transitions[1].confirmed_index, 2010);
        assert_eq!(transitions[2].index, 2400);
        assert_eq!(transitions[2].confirmed_index, 2409);

        let window = transitions[2].window.unwrap();
        assert_eq!(window.flight_samples(), 400);
        assert_eq!(window.start_index, 1500);
        assert_eq!(window.end_index, 2900);
        assert_eq!(d.pending_window(), Some(&window));
    }

    #[test]
    fn test_noise_spike_is_debounced() {
        let mut d = detector();
        let forces = trace(&[(700.0, 1000), (0.0, 5), (700.0, 1000)]);
        let transitions = run(&mut d, &forces);
        assert!(transitions.is_empty());
        assert_eq!(d.phase(), JumpPhase::Standing);
    }

    #[test]
    fn test_no_detection_without_bodyweight() {
        let mut d = PhaseDetector::new(DetectorParams::default());
        let forces = trace(&[(700.0, 100), (0.0, 400), (700.0, 100)]);
        assert!(run(&mut d, &forces).is_empty());
    }

    #[test]
    fn test_countermovement_without_takeoff_settles() {
        let mut d = detector();
        // Sentadilla: baja a 500 N y vuelve, sin despegar
        let forces = trace(&[(700.0, 500), (500.0, 300), (700.0, 600)]);
        let transitions = run(&mut d, &forces);

        assert_eq!(transitions.len(), 2);
        assert_eq!(transitions[0].to, JumpPhase::Movement);
        assert_eq!(transitions[1].to, JumpPhase::Standing);
        assert_eq!(transitions[1].abort, Some(AbortReason::MovementSettled));
        assert!(d.pending_window().is_none());
    }

    #[test]
    fn test_stepping_off_aborts_flight() {
        let mut d = detector();
        let forces = trace(&[(700.0, 500), (0.0, 2000)]);
        let transitions = run(&mut d, &forces);

        let last = transitions.last().unwrap();
        assert_eq!(last.from, JumpPhase::Flight);
        assert_eq!(last.abort, Some(AbortReason::FlightTimeout));
        assert_eq!(d.phase(), JumpPhase::Standing);
    }

    #[test]
    fn test_no_new_window_while_pending() {
        let mut d = detector();
        let jump = trace(&[(700.0, 1000), (0.0, 300), (700.0, 1000)]);
        let mut forces = jump.clone();
        forces.extend_from_slice(&jump);

        let transitions = run(&mut d, &forces);
        let windows: Vec<_> = transitions.iter().filter_map(|t| t.window).collect();
        assert_eq!(windows.len(), 1);
        assert_eq!(d.jump_count(), 1);

        // Tras analizar, el siguiente salto sí se detecta
        assert!(d.mark_analyzed().is_some());
        let more: Vec<_> = jump
            .iter()
            .enumerate()
            .filter_map(|(i, &force)| {
                let index = forces.len() as u64 + i as u64;
                d.feed(&Sample {
                    index,
                    timestamp: index as f64 / 1000.0,
                    force,
                })
            })
            .filter_map(|t| t.window)
            .collect();
        assert_eq!(more.len(), 1);
        assert_eq!(more[0].jump_number, 2);
    }

    fn feed_from(detector: &mut PhaseDetector, start: u64, forces: &[f64]) -> Vec<PhaseTransition> {
        forces
            .iter()
            .enumerate()
            .filter_map(|(i, &force)| {
                let index = start + i as u64;
                detector.feed(&Sample {
                    index,
                    timestamp: index as f64 / 1000.0,
                    force,
                })
            })
            .collect()
    }

    #[test]
    fn test_gap_in_indices_restarts_runs() {
        let mut d = detector();
        assert!(run(&mut d, &trace(&[(700.0, 1000), (500.0, 6)])).is_empty());

        // Las muestras 1006..3000 no pasaron por el detector
        assert!(feed_from(&mut d, 3000, &[500.0; 6]).is_empty());
        assert_eq!(d.phase(), JumpPhase::Standing);

        // Hay que volver a estar quieto antes de reconocer un movimiento
        let transitions = feed_from(&mut d, 3006, &trace(&[(700.0, 600), (500.0, 20)]));
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].to, JumpPhase::Movement);
        assert_eq!(transitions[0].index, 3606);
    }

    #[test]
    fn test_gap_during_flight_drops_jump() {
        let mut d = detector();
        run(&mut d, &trace(&[(700.0, 1000), (0.0, 100)]));
        assert_eq!(d.phase(), JumpPhase::Flight);

        let transitions = feed_from(&mut d, 5000, &[700.0; 100]);
        assert!(transitions.is_empty());
        assert_eq!(d.phase(), JumpPhase::Standing);
        assert!(d.pending_window().is_none());
    }

    #[test]
    fn test_abort_pending_resets() {
        let mut d = detector();
        run(&mut d, &trace(&[(700.0, 1000), (0.0, 300), (700.0, 20)]));
        assert_eq!(d.phase(), JumpPhase::Landing);
        assert!(d.abort_pending().is_some());
        assert_eq!(d.phase(), JumpPhase::Standing);
        assert!(d.pending_window().is_none());
    }
}
