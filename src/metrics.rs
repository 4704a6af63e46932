//! Observability hooks
//!
//! With the `metrics` feature, [`METRICS`] records migration and lock
//! activity through OpenTelemetry into a Prometheus registry. With the
//! `tracing` feature, [`tracing_helpers`] provides the spans used around
//! connections, lock acquisition and migration steps.

#[cfg(feature = "metrics")]
pub use prometheus_metrics::{LockstepMetrics, METRICS};

#[cfg(feature = "metrics")]
mod prometheus_metrics {
    use once_cell::sync::Lazy;
    use opentelemetry::{
        global,
        metrics::{Counter, Histogram, MeterProvider},
    };
    use opentelemetry_sdk::metrics::SdkMeterProvider;
    use prometheus::{Registry, TextEncoder};
    use std::time::Duration;

    pub static METRICS: Lazy<LockstepMetrics> = Lazy::new(LockstepMetrics::init);

    pub struct LockstepMetrics {
        pub registry: Registry,
        pub migrations_applied: Counter<u64>,
        pub migrations_reverted: Counter<u64>,
        pub migration_duration: Histogram<f64>,
        pub lock_wait: Histogram<f64>,
        _provider: Option<SdkMeterProvider>,
    }

    impl LockstepMetrics {
        pub fn init() -> Self {
            let registry = Registry::new();
            let provider = match opentelemetry_prometheus::exporter()
                .with_registry(registry.clone())
                .build()
            {
                Ok(exporter) => Some(SdkMeterProvider::builder().with_reader(exporter).build()),
                Err(e) => {
                    log::warn!(
                        "Prometheus exporter unavailable, metrics will not be exported: {}",
                        e
                    );
                    None
                }
            };
            let meter = match &provider {
                Some(provider) => provider.meter("lockstep"),
                None => global::meter("lockstep"),
            };

            let migrations_applied = meter
                .u64_counter("lockstep_migrations_applied_total")
                .with_description("Migrations applied")
                .build();

            let migrations_reverted = meter
                .u64_counter("lockstep_migrations_reverted_total")
                .with_description("Migrations reverted")
                .build();

            let migration_duration = meter
                .f64_histogram("lockstep_migration_duration_seconds")
                .with_description("Duration of a migration step including its ledger write")
                .build();

            let lock_wait = meter
                .f64_histogram("lockstep_lock_wait_seconds")
                .with_description("Time spent waiting for the migration lock")
                .build();

            Self {
                registry,
                migrations_applied,
                migrations_reverted,
                migration_duration,
                lock_wait,
                _provider: provider,
            }
        }

        pub fn record_applied(&self, elapsed: Duration) {
            self.migrations_applied.add(1, &[]);
            self.migration_duration.record(elapsed.as_secs_f64(), &[]);
        }

        pub fn record_reverted(&self, elapsed: Duration) {
            self.migrations_reverted.add(1, &[]);
            self.migration_duration.record(elapsed.as_secs_f64(), &[]);
        }

        pub fn observe_lock_wait(&self, waited: Duration) {
            self.lock_wait.record(waited.as_secs_f64(), &[]);
        }

        /// Prometheus text exposition of everything recorded so far
        pub fn render(&self) -> String {
            TextEncoder::new()
                .encode_to_string(&self.registry.gather())
                .unwrap_or_default()
        }
    }
}

#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::{info_span, Span};

    pub fn connect_span() -> Span {
        info_span!("lockstep.connect")
    }

    pub fn acquire_lock_span(name: &str) -> Span {
        info_span!("lockstep.acquire_lock", lock = name)
    }

    pub fn migration_step_span(identifier: &str, direction: &'static str) -> Span {
        info_span!("lockstep.migration_step", migration = identifier, direction)
    }
}
