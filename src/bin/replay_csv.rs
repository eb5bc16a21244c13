use std::env;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use saltometro::calibration::CalibrationTarget;
use saltometro::csv_loader::load_session_csv;
use saltometro::logging::init_logging;
use saltometro::persistence::CalibrationRecord;
use saltometro::types::DAQ_READ_CHUNK_SIZE;
use saltometro::{Coordinator, PipelineConfig, PipelineEvent};

struct ReplayOptions {
    config: Option<PathBuf>,
    calibration: Option<PathBuf>,
    force_columns: bool,
    dump_json: bool,
}

const USAGE: &str = "Uso: replay_csv [--config archivo.json] [--calibration calibracion.json] \
                     [--force] [--json] <sesion.csv>";

fn parse_args() -> Result<(PathBuf, ReplayOptions)> {
    let mut options = ReplayOptions {
        config: None,
        calibration: None,
        force_columns: false,
        dump_json: false,
    };
    let mut csv_path: Option<PathBuf> = None;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--force" => options.force_columns = true,
            "--json" => options.dump_json = true,
            "--config" | "--calibration" => {
                let value = args
                    .next()
                    .map(PathBuf::from)
                    .ok_or_else(|| anyhow!("Falta el archivo de {}", arg))?;
                if arg == "--config" {
                    options.config = Some(value);
                } else {
                    options.calibration = Some(value);
                }
            }
            _ => {
                if csv_path.is_some() {
                    bail!(USAGE);
                }
                csv_path = Some(PathBuf::from(arg));
            }
        }
    }

    let csv_path = csv_path.ok_or_else(|| anyhow!("Debes especificar un archivo CSV"))?;
    Ok((csv_path, options))
}

fn main() -> Result<()> {
    init_logging("warn");
    let (csv_path, opts) = parse_args()?;
    println!("🎞️  Reproduciendo sesión desde {:?}", csv_path);

    let session = load_session_csv(&csv_path)?;

    let mut config = match &opts.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };
    // La grabación manda sobre la configuración en canales y frecuencia
    if config.channel_count != session.channel_count {
        config.channel_count = session.channel_count;
        config.zero_offset_volts = vec![0.0; session.channel_count];
    }
    if let Some(rate) = session.sample_rate_hz {
        config.sample_rate_hz = rate.round();
    }
    if opts.force_columns {
        // Columnas ya en newtons: conversión identidad
        config.n_per_volt = 1.0;
        config.zero_offset_volts = vec![0.0; session.channel_count];
    }

    let mut coordinator =
        Coordinator::new(config.clone()).context("Configuración incompatible con la grabación")?;
    if let Some(path) = &opts.calibration {
        let record = CalibrationRecord::load(path)
            .with_context(|| format!("No se pudo cargar la calibración {:?}", path))?;
        coordinator.load_calibration_record(&record)?;
    }
    let events = coordinator.subscribe();

    coordinator.set_zero_offset(config.zero_offset_volts.clone())?;
    coordinator.start_ingestion(0.0);
    coordinator.start_calibration(CalibrationTarget::Bodyweight)?;

    for chunk in session.chunks(DAQ_READ_CHUNK_SIZE) {
        // Los errores también llegan como eventos
        let _ = coordinator.process_chunk(&chunk);
    }
    coordinator.stop_ingestion();

    println!(
        "ℹ️  {} muestras, {} canales, {:.0} Hz",
        session.sample_count(),
        session.channel_count,
        config.sample_rate_hz
    );

    let mut jumps = Vec::new();
    for event in events.try_iter() {
        match event {
            PipelineEvent::JumpAnalyzed(metrics) => jumps.push(metrics),
            PipelineEvent::PipelineError { kind, message } => {
                println!("❌ {:?}: {}", kind, message)
            }
            _ => {}
        }
    }

    match coordinator.calibration_snapshot().bodyweight {
        Some(bw) => println!("⚖️  Peso corporal: {:.1} N", bw.bodyweight_n),
        None => println!("⚠️  No se pudo medir el peso corporal al inicio de la grabación"),
    }

    if opts.dump_json {
        println!("{}", serde_json::to_string_pretty(&jumps)?);
        return Ok(());
    }

    if jumps.is_empty() {
        println!("\nNo se detectaron saltos");
    }
    for m in &jumps {
        println!(
            "\n🏁 Salto #{}: vuelo {:.3} s, altura {:.3} m (vuelo) / {:.3} m (impulso)",
            m.jump_number, m.flight_time_seconds, m.height_flight_method, m.height_impulse_method
        );
        println!(
            "   despegue {:.4} s, aterrizaje {:.4} s, contracción {:.0} ms, flags {:?}",
            m.takeoff_timestamp, m.landing_timestamp, m.contraction_time_ms, m.quality_flags
        );
    }

    Ok(())
}
