use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Nivel usado cuando `RUST_LOG` no está definida
pub const DEFAULT_FILTER: &str = "info";

/// Instala el suscriptor global de `tracing`.
///
/// `RUST_LOG` tiene prioridad sobre `default_filter`. Llamadas posteriores
/// no tienen efecto.
pub fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_thread_names(true))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init_logging("debug");
        init_logging("nonsense=[");
        tracing::info!(samples = 500, "logging listo");
    }
}
