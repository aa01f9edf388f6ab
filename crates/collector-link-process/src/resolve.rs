//! Executable lookup.

use std::path::{Path, PathBuf};

/// Resolve an executable to a full path.
///
/// Absolute and relative paths containing a separator are used as-is when
/// they point at a file; bare names are looked up on `PATH`.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.components().count() > 1 || path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf());
    }

    which_async(executable).await
}

async fn which_async(executable: &str) -> Option<PathBuf> {
    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bare_name_found_on_path() {
        let found = resolve_executable_path("sh").await.unwrap();
        assert!(found.is_absolute());
    }

    #[tokio::test]
    async fn test_absolute_path_used_as_is() {
        assert_eq!(
            resolve_executable_path("/bin/sh").await,
            Some(PathBuf::from("/bin/sh"))
        );
        assert_eq!(resolve_executable_path("/no/such/collector").await, None);
    }

    #[tokio::test]
    async fn test_blank_is_none() {
        assert_eq!(resolve_executable_path("  ").await, None);
    }
}
