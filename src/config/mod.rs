//! Tiered configuration.
//!
//! Configuration is merged field-by-field from four tiers:
//! 1. **Defaults** - compiled into the binary
//! 2. **Project** - `$CWD/doc-spawner/config.yaml`
//! 3. **User** - `~/.doc-spawner/config.yaml`
//! 4. **Environment** - `DOC_SPAWNER_*` variables
//!
//! ## Environment Variables
//! - `DOC_SPAWNER_CONFIG_PATH` - Explicit config file (replaces the file tiers)
//! - `DOC_SPAWNER_DB_PATH` - Database path
//! - `DOC_SPAWNER_NUM_WORKERS` - Worker pool size
//! - `DOC_SPAWNER_MAX_DEPTH` - Maximum spawn depth
//! - `DOC_SPAWNER_USER_DIR` - User config dir (default: `~/.doc-spawner`)
//! - `DOC_SPAWNER_PROJECT_DIR` - Project config dir (default: `./doc-spawner`)

mod loader;
mod merge;
mod types;

pub use loader::{ConfigLoader, ConfigPaths};
pub use merge::merge_tier;
pub use types::*;
