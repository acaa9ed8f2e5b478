use std::path::{Path, PathBuf};

/// Resolve the tickd project root.
///
/// Priority:
/// 1. `--root` flag / `TICKD_ROOT` env var (passed in as `explicit`)
/// 2. Walk upward from `cwd` looking for `.tickd/`
/// 3. Fall back to `cwd`
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_tickd_root(&cwd).unwrap_or(cwd)
}

fn find_tickd_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(tickd_core::paths::TICKD_DIR).is_dir())
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn explicit_root_wins() {
        let dir = TempDir::new().unwrap();
        let result = resolve_root(Some(dir.path()));
        assert_eq!(result, dir.path());
    }

    #[test]
    fn finds_tickd_dir_from_nested_path() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".tickd")).unwrap();
        let nested = dir.path().join("services/worker/src");
        std::fs::create_dir_all(&nested).unwrap();
        assert_eq!(find_tickd_root(&nested).as_deref(), Some(dir.path()));
    }
}
