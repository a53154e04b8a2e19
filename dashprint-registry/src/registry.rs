//! The printer registry: a keyed collection of engines, owned explicitly by
//! whoever constructs it (a REST layer, a CLI, a test) rather than kept as
//! process-wide state.

use std::{collections::HashMap, sync::Arc};

use dashprint_core::{settings::is_valid_slug, Engine, PrinterSettings};
use tokio::sync::RwLock;

use crate::{config::Configuration, slug::slugify};

#[derive(Default)]
struct Inner {
    engines: HashMap<String, Arc<Engine>>,
    /// Insertion order, so `snapshot()` is deterministic even though
    /// `HashMap` iteration isn't.
    order: Vec<String>,
    default_printer: Option<String>,
}

/// Keyed collection of printer engines, plus the current default printer.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns `settings.uniqueName` if it's empty (slugifying `name`,
    /// disambiguating collisions by appending the smallest integer >= 2
    /// that's free), inserts the engine under the registry's write lock,
    /// then — outside the lock — starts it unless `stopped` is set.
    /// Returns the assigned unique name.
    pub async fn add_printer(&self, mut settings: PrinterSettings) -> String {
        let mut inner = self.inner.write().await;
        assign_unique_name(&mut settings, |candidate| {
            inner.engines.contains_key(candidate)
        });
        let unique_name = settings.unique_name.clone();
        let should_start = !settings.stopped;

        let engine = Arc::new(Engine::load(settings));
        inner.order.push(unique_name.clone());
        inner.engines.insert(unique_name.clone(), engine.clone());
        if inner.default_printer.is_none() {
            inner.default_printer = Some(unique_name.clone());
        }
        drop(inner);

        if should_start {
            engine.start();
        }
        unique_name
    }

    /// Constructs an engine for every record in `config`, in order, routing
    /// each through [`Registry::add_printer`] so a record with an empty
    /// `uniqueName` gets one auto-slugified from `name`, exactly as a direct
    /// `add_printer` call would. A record with a non-empty `uniqueName` that
    /// still doesn't match the slug grammar is skipped and logged, matching
    /// the "configuration errors are logged, registry starts empty" policy
    /// applied per-record rather than to the whole file. `defaultPrinter` is
    /// kept if it names a loaded printer, otherwise falls back to the first
    /// one inserted.
    pub async fn load_printers(&self, config: Configuration) {
        for settings in config.printers {
            if !settings.unique_name.is_empty() && !is_valid_slug(&settings.unique_name) {
                tracing::warn!(
                    name = %settings.name,
                    unique_name = %settings.unique_name,
                    "skipping printer with invalid uniqueName"
                );
                continue;
            }
            self.add_printer(settings).await;
        }

        let mut inner = self.inner.write().await;
        inner.default_printer = match config.default_printer {
            Some(name) if inner.engines.contains_key(&name) => Some(name),
            _ => inner.order.first().cloned(),
        };
    }

    /// A deterministic, persistence-ready snapshot: settings in insertion
    /// order, plus the current default printer.
    pub async fn snapshot(&self) -> Configuration {
        let inner = self.inner.read().await;
        let printers = inner
            .order
            .iter()
            .filter_map(|name| inner.engines.get(name))
            .map(|engine| engine.settings().clone())
            .collect();
        Configuration {
            printers,
            default_printer: inner.default_printer.clone(),
        }
    }

    /// Looks up an engine by its unique name.
    pub async fn get(&self, unique_name: &str) -> Option<Arc<Engine>> {
        self.inner.read().await.engines.get(unique_name).cloned()
    }

    pub async fn default_printer(&self) -> Option<String> {
        self.inner.read().await.default_printer.clone()
    }

    /// Stops and removes `unique_name`'s engine. Returns `false` if no such
    /// printer is registered.
    pub async fn remove_printer(&self, unique_name: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some(engine) = inner.engines.remove(unique_name) else {
            return false;
        };
        engine.stop();
        inner.order.retain(|n| n != unique_name);
        if inner.default_printer.as_deref() == Some(unique_name) {
            inner.default_printer = inner.order.first().cloned();
        }
        true
    }
}

fn assign_unique_name(settings: &mut PrinterSettings, taken: impl Fn(&str) -> bool) {
    if !settings.unique_name.is_empty() {
        return;
    }
    let base = slugify(&settings.name);
    if !taken(&base) {
        settings.unique_name = base;
        return;
    }
    let mut n = 2u32;
    loop {
        let candidate = format!("{base}{n}");
        if !taken(&candidate) {
            settings.unique_name = candidate;
            return;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashprint_core::PrintArea;

    fn settings(name: &str) -> PrinterSettings {
        PrinterSettings {
            name: name.to_string(),
            unique_name: String::new(),
            device_path: "/dev/null".into(),
            baud_rate: 115_200,
            stopped: true,
            print_area: PrintArea {
                width: 200,
                height: 200,
                depth: 200,
            },
        }
    }

    #[tokio::test]
    async fn slug_collisions_are_disambiguated_with_an_incrementing_suffix() {
        let registry = Registry::new();
        let a = registry.add_printer(settings("Prusa")).await;
        let b = registry.add_printer(settings("Prusa")).await;
        let c = registry.add_printer(settings("Prusa")).await;
        assert_eq!((a.as_str(), b.as_str(), c.as_str()), ("prusa", "prusa2", "prusa3"));
    }

    #[tokio::test]
    async fn a_removed_slug_is_not_reused_oddly_by_the_next_collision() {
        let registry = Registry::new();
        let a = registry.add_printer(settings("Prusa")).await;
        let b = registry.add_printer(settings("Prusa")).await;
        assert_eq!((a.as_str(), b.as_str()), ("prusa", "prusa2"));
        registry.remove_printer(&a).await;
        let c = registry.add_printer(settings("Prusa")).await;
        assert_eq!(c, "prusa3");
    }

    #[tokio::test]
    async fn explicit_unique_name_is_kept_as_is() {
        let mut s = settings("Anything");
        s.unique_name = "custom-slug".into();
        let registry = Registry::new();
        let name = registry.add_printer(s).await;
        assert_eq!(name, "custom-slug");
    }

    #[tokio::test]
    async fn snapshot_preserves_insertion_order_and_default() {
        let registry = Registry::new();
        registry.add_printer(settings("Ender")).await;
        registry.add_printer(settings("Prusa")).await;
        let snap = registry.snapshot().await;
        let names: Vec<_> = snap.printers.iter().map(|p| p.name.clone()).collect();
        assert_eq!(names, vec!["Ender", "Prusa"]);
        assert_eq!(snap.default_printer.as_deref(), Some("ender"));
    }

    #[tokio::test]
    async fn load_printers_skips_records_with_an_invalid_slug() {
        let registry = Registry::new();
        let mut bad = settings("Bad Slug");
        bad.unique_name = "Not Valid!".into();
        let mut good = settings("Good");
        good.unique_name = "good".into();
        registry
            .load_printers(Configuration {
                printers: vec![bad, good],
                default_printer: None,
            })
            .await;
        let snap = registry.snapshot().await;
        assert_eq!(snap.printers.len(), 1);
        assert_eq!(snap.printers[0].unique_name, "good");
    }

    #[tokio::test]
    async fn load_printers_auto_slugifies_a_record_with_no_unique_name() {
        let registry = Registry::new();
        let unnamed = settings("Voron 2.4");
        registry
            .load_printers(Configuration {
                printers: vec![unnamed],
                default_printer: None,
            })
            .await;
        let snap = registry.snapshot().await;
        assert_eq!(snap.printers.len(), 1);
        assert_eq!(snap.printers[0].unique_name, "voron-2-4");
    }

    #[tokio::test]
    async fn load_printers_falls_back_to_first_inserted_as_default() {
        let registry = Registry::new();
        let mut a = settings("Ender");
        a.unique_name = "ender".into();
        let mut b = settings("Prusa");
        b.unique_name = "prusa".into();
        registry
            .load_printers(Configuration {
                printers: vec![a, b],
                default_printer: Some("does-not-exist".into()),
            })
            .await;
        assert_eq!(registry.default_printer().await.as_deref(), Some("ender"));
    }
}
