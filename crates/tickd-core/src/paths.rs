use crate::config::Backend;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const TICKD_DIR: &str = ".tickd";
pub const CONFIG_FILE: &str = ".tickd/config.yaml";
pub const SQLITE_DB_FILE: &str = ".tickd/tickd.db";
pub const REDB_DB_FILE: &str = ".tickd/tickd.redb";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn tickd_dir(root: &Path) -> PathBuf {
    root.join(TICKD_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn default_db_path(root: &Path, backend: Backend) -> PathBuf {
    match backend {
        Backend::Sqlite => root.join(SQLITE_DB_FILE),
        Backend::Redb => root.join(REDB_DB_FILE),
    }
}
