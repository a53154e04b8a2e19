//! Owns the printer engines as an explicit, keyed collection, assigns
//! slugs on insertion, and persists/restores the registry's configuration
//! as a JSON document. The HTTP surface, static assets, and device
//! discovery that would sit on top of this are out of scope here.

mod config;
mod registry;
mod slug;

pub use config::{ConfigError, ConfigStore, Configuration};
pub use registry::Registry;
pub use slug::slugify;
