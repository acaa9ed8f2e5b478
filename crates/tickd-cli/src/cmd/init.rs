use anyhow::Context;
use std::path::Path;
use tickd_core::config::{Backend, Config, StoreConfig};
use tickd_core::{io, paths, store};

use crate::output::print_json;

pub fn run(root: &Path, backend: &str, json: bool) -> anyhow::Result<()> {
    let backend = match backend.to_ascii_lowercase().as_str() {
        "sqlite" => Backend::Sqlite,
        "redb" => Backend::Redb,
        other => anyhow::bail!("unknown backend '{other}': must be sqlite or redb"),
    };

    let dir = paths::tickd_dir(root);
    io::ensure_dir(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let config_path = paths::config_path(root);
    let created_config = !config_path.exists();
    if created_config {
        let config = Config {
            store: StoreConfig {
                backend,
                path: None,
            },
            ..Config::default()
        };
        config.save(root).context("failed to write config.yaml")?;
    }

    // Opening the store applies the schema and the bootstrap control row.
    let config = Config::load(root).context("failed to load config.yaml")?;
    let db_path = config.store.resolve_path(root);
    let store = store::open_store(root, &config.store)
        .with_context(|| format!("failed to initialize store at {}", db_path.display()))?;
    let flags = store.read_control()?;

    if json {
        return print_json(&serde_json::json!({
            "root": root,
            "config_created": created_config,
            "backend": config.store.backend,
            "store": db_path,
            "mode": flags.mode,
        }));
    }

    println!("Initializing tickd in: {}", root.display());
    if created_config {
        println!("  created: {}", paths::CONFIG_FILE);
    } else {
        println!("  exists:  {}", paths::CONFIG_FILE);
    }
    println!("  store:   {}", db_path.display());
    println!("  mode:    {}", flags.mode);
    Ok(())
}
