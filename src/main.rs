/*
Plataforma de fuerzas en tiempo real con adquisición simulada.

1. Genera saltos con contramovimiento sintéticos (4 canales, 1 kHz)
2. Mide el peso corporal con la cuenta atrás habitual
3. Detecta cada salto y publica tiempo de vuelo, alturas e impulso

Para ejecutar:
     cargo run --release -- --duration 30 --config plataforma.json
     RUST_LOG=debug cargo run -- --export sesion.csv
*/

use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{after, select};
use tracing::info;

use saltometro::calibration::{CalibrationPhase, CalibrationTarget};
use saltometro::csv_loader::export_force_history;
use saltometro::logging::{init_logging, DEFAULT_FILTER};
use saltometro::persistence::CalibrationRecord;
use saltometro::runtime::{Command, PipelineHandle};
use saltometro::simulator::{CmjWaveform, Simulator, SimulatorConfig};
use saltometro::types::QualityFlag;
use saltometro::{Coordinator, PipelineConfig, PipelineEvent};

struct Options {
    config: Option<PathBuf>,
    calibration: Option<PathBuf>,
    export: Option<PathBuf>,
    duration_secs: f64,
}

fn parse_args() -> Result<Options> {
    let mut options = Options {
        config: None,
        calibration: None,
        export: None,
        duration_secs: 20.0,
    };

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        let mut value = || {
            args.next()
                .ok_or_else(|| anyhow!("Falta el valor de {}", arg))
        };
        match arg.as_str() {
            "--config" => options.config = Some(PathBuf::from(value()?)),
            "--calibration" => options.calibration = Some(PathBuf::from(value()?)),
            "--export" => options.export = Some(PathBuf::from(value()?)),
            "--duration" => {
                options.duration_secs = value()?
                    .parse::<f64>()
                    .context("--duration espera segundos")?;
            }
            _ => bail!(
                "Uso: saltometro [--config archivo.json] [--calibration calibracion.json] \
                 [--export sesion.csv] [--duration segundos]"
            ),
        }
    }
    Ok(options)
}

fn print_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::CalibrationStateChanged(snapshot) => match snapshot.phase {
            CalibrationPhase::Countdown => {
                println!("⏳ Súbete y quédate quieto... {}", snapshot.countdown_remaining)
            }
            CalibrationPhase::Complete => {
                if let Some(bw) = &snapshot.bodyweight {
                    println!(
                        "⚖️  Peso corporal: {:.1} N ({:.1} kg), SD {:.2} N",
                        bw.bodyweight_n,
                        bw.mass_kg(),
                        bw.std_n
                    );
                }
            }
            _ => {}
        },
        PipelineEvent::PhaseChanged(transition) => {
            if let Some(reason) = transition.abort {
                println!("↩️  Movimiento descartado: {:?}", reason);
            }
        }
        PipelineEvent::JumpAnalyzed(m) => {
            println!(
                "\n🏁 Salto #{}: vuelo {:.3} s | altura (vuelo) {:.1} cm | altura (impulso) {:.1} cm",
                m.jump_number,
                m.flight_time_seconds,
                m.height_flight_method * 100.0,
                m.height_impulse_method * 100.0
            );
            println!(
                "   impulso neto {:.1} N·s | v despegue {:.2} m/s | pico propulsivo {:.0} N | pico aterrizaje {:.0} N",
                m.net_impulse_ns, m.takeoff_velocity, m.peak_propulsive_force, m.peak_landing_force
            );
            for flag in &m.quality_flags {
                let text = match flag {
                    QualityFlag::FlightTimeOutOfRange => "tiempo de vuelo fuera de rango",
                    QualityFlag::HeightMethodsDisagree => "los dos métodos de altura discrepan",
                    QualityFlag::LandingWindowTruncated => "ventana de aterrizaje incompleta",
                    QualityFlag::LowBodyweight => "peso corporal bajo",
                };
                println!("   ⚠️  {}", text);
            }
        }
        PipelineEvent::PipelineError { kind, message } => {
            println!("❌ {:?}: {}", kind, message);
        }
        PipelineEvent::ChunkProcessed { .. } => {}
    }
}

fn main() -> Result<()> {
    init_logging(DEFAULT_FILTER);
    let options = parse_args()?;

    let config = match &options.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };

    let mut coordinator = Coordinator::new(config.clone())?;
    if let Some(path) = &options.calibration {
        let record = CalibrationRecord::load(path)
            .with_context(|| format!("No se pudo cargar la calibración {:?}", path))?;
        coordinator.load_calibration_record(&record)?;
        info!(n_per_volt = coordinator.n_per_volt(), "Calibración cargada");
    }

    // Antes de lanzar el hilo: así ningún bloque llega antes que estas órdenes
    coordinator.set_zero_offset(config.zero_offset_volts.clone())?;
    coordinator.start_ingestion(0.0);
    coordinator.start_calibration(CalibrationTarget::Bodyweight)?;

    let handle = PipelineHandle::spawn(coordinator)?;

    let stop = Arc::new(AtomicBool::new(false));
    let simulator = Simulator::new(
        SimulatorConfig {
            sample_rate_hz: config.sample_rate_hz,
            channel_count: config.channel_count,
            ..Default::default()
        },
        CmjWaveform::default(),
    )
    .spawn(handle.chunk_sender(), Arc::clone(&stop))?;

    println!("🎯 Recibiendo datos durante {:.0} s...\n", options.duration_secs);
    let deadline = after(Duration::from_secs_f64(options.duration_secs.max(0.0)));
    loop {
        select! {
            recv(handle.events()) -> msg => match msg {
                Ok(event) => print_event(&event),
                Err(_) => break,
            },
            recv(deadline) -> _ => break,
        }
    }

    stop.store(true, Ordering::Relaxed);
    let samples = simulator
        .join()
        .map_err(|_| anyhow!("El hilo de simulación terminó con pánico"))?;
    handle.send_command(Command::StopIngestion)?;
    let coordinator = handle.shutdown()?;
    info!(samples, "Sesión terminada");

    if let Some(path) = &options.export {
        let written = export_force_history(coordinator.buffer(), path)?;
        println!("💾 {} muestras guardadas en {:?}", written, path);
    }

    Ok(())
}
