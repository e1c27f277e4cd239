use std::path::PathBuf;

use directories::ProjectDirs;

/// Directory for runtime artifacts (log files, a default SQLite database).
///
/// Respects `BROKER_ASSET_DIR`. Otherwise uses the platform data directory,
/// falling back to `./.broker` when the OS gives us no home directory.
pub fn asset_dir() -> PathBuf {
    let path = match std::env::var("BROKER_ASSET_DIR") {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ => ProjectDirs::from("org", "edbroker", "broker")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".broker")),
    };

    if !path.exists()
        && let Err(e) = std::fs::create_dir_all(&path)
    {
        tracing::warn!(path = %path.display(), error = %e, "Failed to create asset directory");
    }

    path
}

/// Default log directory: `{asset_dir}/logs`.
pub fn log_dir() -> PathBuf {
    asset_dir().join("logs")
}
