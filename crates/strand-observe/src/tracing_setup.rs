//! Tracing subscriber wiring for processes that embed the workflow engine.
//!
//! The engine crates emit structured events (`run_id`, `step_id`, durations)
//! but never install a subscriber themselves; the embedding binary calls
//! [`init_tracing`] once at startup.
//!
//! # Usage
//!
//! ```no_run
//! // Structured logging only.
//! strand_observe::init_tracing(false).unwrap();
//!
//! // Additionally bridge spans to OpenTelemetry (stdout exporter, for
//! // local development).
//! strand_observe::init_tracing(true).unwrap();
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use std::sync::OnceLock;

/// Filter applied when `RUST_LOG` is unset: engine crates at `info`,
/// everything else (sqlx, runtime internals) at `warn`.
const DEFAULT_DIRECTIVES: &str = "warn,strand_core=info,strand_infra=info,strand_types=info";

/// Stores the OTel tracer provider so it can be shut down cleanly on exit.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Install the global tracing subscriber.
///
/// The `fmt` layer reports targets and span close timing, so scheduler
/// spans carry run durations. `RUST_LOG` overrides the default filter.
/// With `enable_otel`, spans are additionally exported through an
/// OpenTelemetry stdout exporter; swap in an OTLP exporter for anything
/// beyond local development.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing(enable_otel: bool) -> Result<(), Box<dyn std::error::Error>> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    if enable_otel {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer("strand-engine");
        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);

        registry.with(otel_layer).try_init()?;
    } else {
        registry.try_init()?;
    }

    Ok(())
}

/// Flush pending traces and shut down the OpenTelemetry tracer provider.
///
/// Call before process exit so buffered spans are exported. A no-op when
/// OTel was never enabled.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Warning: OTel tracer provider shutdown error: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // One process-global subscriber slot, so both halves live in one test.
    #[test]
    fn init_installs_once_then_rejects_reinit() {
        init_tracing(false).unwrap();
        tracing::info!(component = "observe", "subscriber installed");

        let err = init_tracing(false);
        assert!(err.is_err());

        // No-op without OTel enabled.
        shutdown_tracing();
    }
}
