//! A thin daemon wiring `dashprint-registry` and `dashprint-core` together:
//! loads configuration, starts every non-stopped printer, logs state
//! transitions, and runs until interrupted. There is no REST layer or web
//! UI here — those are external collaborators that would sit on top of the
//! `Registry` this binary constructs, the way `print3rs-console`'s `main.rs`
//! proves `print3rs-core` + `print3rs-commands` compose around a shell
//! instead of a REST API.

use std::sync::Arc;

use dashprint_core::{PrinterState, StateListener};
use dashprint_registry::{ConfigStore, Registry};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

struct LoggingListener {
    unique_name: String,
}

impl StateListener for LoggingListener {
    fn on_printer_state_changed(&self, old: PrinterState, new: PrinterState) {
        tracing::info!(printer = %self.unique_name, ?old, ?new, "printer state changed");
    }
}

fn setup_logging() {
    if let Ok(env_log) = tracing_subscriber::EnvFilter::builder()
        .with_env_var("DASHPRINT_LOG")
        .try_from_env()
    {
        let format_layer = tracing_subscriber::fmt::layer().compact();
        tracing_subscriber::registry()
            .with(env_log)
            .with(format_layer)
            .init();
    }
}

#[tokio::main]
async fn main() {
    setup_logging();

    let registry = Registry::new();
    let store = match ConfigStore::discover() {
        Ok(store) => Some(store),
        Err(e) => {
            tracing::warn!(error = %e, "could not resolve a configuration path; starting empty");
            None
        }
    };

    if let Some(store) = &store {
        match store.load().await {
            Ok(Some(config)) => {
                tracing::info!(path = %store.path().display(), "loaded configuration");
                registry.load_printers(config).await;
            }
            Ok(None) => {
                tracing::info!(
                    path = %store.path().display(),
                    "no configuration file yet; starting empty"
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not load configuration; starting empty");
            }
        }
    }

    attach_logging_listeners(&registry).await;

    tracing::info!("dashprintd running; press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl-c");
    tracing::info!("shutting down");

    stop_all(&registry).await;

    if let Some(store) = &store {
        let snapshot = registry.snapshot().await;
        if let Err(e) = store.save(&snapshot).await {
            tracing::warn!(error = %e, "could not persist configuration on shutdown");
        }
    }
}

/// Attaches a listener that logs every state transition for every printer
/// currently in the registry — this binary has no UI of its own to update,
/// so a structured log line stands in for the status indicators
/// `print3rs-console`/`print3rs-gui` draw from the same kind of event.
async fn attach_logging_listeners(registry: &Registry) {
    let snapshot = registry.snapshot().await;
    for settings in snapshot.printers {
        if let Some(engine) = registry.get(&settings.unique_name).await {
            engine.add_listener(Arc::new(LoggingListener {
                unique_name: settings.unique_name,
            }));
        }
    }
}

async fn stop_all(registry: &Registry) {
    let snapshot = registry.snapshot().await;
    for settings in snapshot.printers {
        if let Some(engine) = registry.get(&settings.unique_name).await {
            engine.stop();
        }
    }
}
