use crate::config::AppConfig;
use crate::config_loader::ConfigLoader;
use anyhow::Result;
use notify::{Event, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::watch;

/// Broadcasts a freshly loaded `AppConfig` whenever `Config.toml` changes.
///
/// Invalid edits are logged and ignored; subscribers keep the last good config.
pub struct ConfigWatcher {
    tx: watch::Sender<AppConfig>,
    dir: PathBuf,
    profile: Option<String>,
}

impl ConfigWatcher {
    /// Creates a new configuration watcher with an initial configuration.
    ///
    /// Returns a tuple of the watcher and a receiver for configuration updates.
    #[must_use]
    pub fn new(
        initial_config: AppConfig,
        dir: impl Into<PathBuf>,
        profile: Option<String>,
    ) -> (Self, watch::Receiver<AppConfig>) {
        let (tx, rx) = watch::channel(initial_config);
        (
            Self {
                tx,
                dir: dir.into(),
                profile,
            },
            rx,
        )
    }

    /// Reloads the configuration and publishes it if it is valid.
    ///
    /// Returns true if subscribers were notified.
    pub fn reload(&self) -> bool {
        reload_into(&self.tx, &self.dir, self.profile.as_deref())
    }

    /// Watches the configuration directory for changes and broadcasts updates.
    ///
    /// # Errors
    ///
    /// Returns an error if file watching cannot be initiated or if the watcher task fails.
    pub async fn watch(&self) -> Result<()> {
        let tx = self.tx.clone();
        let dir = self.dir.clone();
        let profile = self.profile.clone();

        tokio::task::spawn_blocking(move || {
            let (notify_tx, notify_rx) = std::sync::mpsc::channel();

            let mut watcher = notify::recommended_watcher(move |res: Result<Event, _>| {
                if let Ok(event) = res {
                    let _ = notify_tx.send(event);
                }
            })?;

            watcher.watch(&dir, RecursiveMode::NonRecursive)?;

            for event in notify_rx {
                if event.kind.is_modify() || event.kind.is_create() {
                    tracing::info!("Config file changed, reloading...");
                    reload_into(&tx, &dir, profile.as_deref());
                }
            }

            Ok::<_, anyhow::Error>(())
        })
        .await??;

        Ok(())
    }
}

fn reload_into(tx: &watch::Sender<AppConfig>, dir: &Path, profile: Option<&str>) -> bool {
    match ConfigLoader::load_from(dir, profile) {
        Ok(new_config) => {
            tx.send_replace(new_config);
            tracing::info!("Config reloaded successfully");
            true
        }
        Err(e) => {
            tracing::error!("Failed to reload config: {:#}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_reload_publishes_new_config() {
        Jail::expect_with(|jail| {
            jail.create_dir("config")?;
            jail.create_file("config/Config.toml", "[server]\nhost = \"127.0.0.1\"\nport = 9000\n")?;

            let (watcher, rx) = ConfigWatcher::new(AppConfig::default(), "config", None);
            assert_eq!(rx.borrow().server.port, 8080);

            assert!(watcher.reload());
            assert_eq!(rx.borrow().server.port, 9000);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_reload_keeps_previous_config() {
        Jail::expect_with(|jail| {
            jail.create_dir("config")?;
            jail.create_file(
                "config/Config.toml",
                "[[series]]\ntable = \"Bad-Name\"\nsource = \"x\"\ncadence_secs = 60\n",
            )?;

            let (watcher, rx) = ConfigWatcher::new(AppConfig::default(), "config", None);
            assert!(!watcher.reload());
            assert!(rx.borrow().series.is_empty());
            Ok(())
        });
    }
}
