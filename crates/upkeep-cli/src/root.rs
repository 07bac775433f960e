use std::path::{Path, PathBuf};

use upkeep_core::paths::UPKEEP_DIR;

/// Resolve the project root.
///
/// Priority:
/// 1. `--root` flag / `UPKEEP_ROOT` env var (passed in as `explicit`)
/// 2. Nearest ancestor of `cwd` containing `.upkeep/`
/// 3. Nearest ancestor of `cwd` containing `.git/`
/// 4. `cwd`
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    resolve_from(&cwd)
}

fn resolve_from(start: &Path) -> PathBuf {
    [UPKEEP_DIR, ".git"]
        .iter()
        .find_map(|marker| {
            start
                .ancestors()
                .find(|dir| dir.join(marker).is_dir())
                .map(Path::to_path_buf)
        })
        .unwrap_or_else(|| start.to_path_buf())
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
    fn upkeep_dir_beats_git_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".upkeep")).unwrap();
        let app = dir.path().join("app");
        std::fs::create_dir_all(app.join(".git")).unwrap();
        let deep = app.join("src/deep");
        std::fs::create_dir_all(&deep).unwrap();

        assert_eq!(resolve_from(&deep), dir.path());
    }

    #[test]
    fn falls_back_to_git_then_start() {
        let dir = TempDir::new().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(repo.join(".git")).unwrap();
        std::fs::create_dir_all(repo.join("lib")).unwrap();
        assert_eq!(resolve_from(&repo.join("lib")), repo);

        let plain = dir.path().join("plain");
        std::fs::create_dir_all(&plain).unwrap();
        // TempDir lives under a tree with neither marker.
        if !plain.ancestors().any(|d| d.join(".upkeep").is_dir() || d.join(".git").is_dir()) {
            assert_eq!(resolve_from(&plain), plain);
        }
    }
}
