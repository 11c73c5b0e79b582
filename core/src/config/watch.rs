// Configuration file watcher
//
// Watches the parent directories of every contributing config file (editors
// usually replace files rather than modify them in place) and nudges the
// reload coordinator over a channel whenever one of the watched files
// changes.

use super::ConfigError;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::warn;

/// Start watching `paths`. The returned watcher must be kept alive for as
/// long as change notifications are wanted.
pub fn watch_files(
    paths: &[PathBuf],
    tx: mpsc::Sender<()>,
) -> Result<RecommendedWatcher, ConfigError> {
    let watched: HashSet<PathBuf> = paths.iter().cloned().collect();
    let mut directories = HashSet::new();
    for path in paths {
        if let Some(parent) = path.parent() {
            directories.insert(parent.to_path_buf());
        }
    }

    let mut watcher = notify::recommended_watcher(
        move |result: Result<notify::Event, notify::Error>| match result {
            Ok(event) => {
                if !matches!(
                    event.kind,
                    EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                ) {
                    return;
                }
                let relevant = event
                    .paths
                    .iter()
                    .any(|p| watched.contains(p) || p.canonicalize().map_or(false, |c| watched.contains(&c)));
                if relevant {
                    // Full channel means a reload is already pending.
                    let _ = tx.try_send(());
                }
            }
            Err(e) => {
                warn!(target: "config", error = %e, "config watcher error");
            }
        },
    )
    .map_err(|e| ConfigError::Watch(e.to_string()))?;

    for directory in &directories {
        watcher
            .watch(directory, RecursiveMode::NonRecursive)
            .map_err(|e| {
                ConfigError::Watch(format!("cannot watch {}: {e}", directory.display()))
            })?;
    }

    Ok(watcher)
}
