use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use async_trait::async_trait;
use eyre::{Context, Result, eyre};
use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::{
    config::{loader::load_config, models::GatewayConfig},
    ports::config_provider::ConfigProvider,
};

/// Configuration provider that loads from a local file and watches its
/// directory, so editors that replace the file on save are noticed too.
pub struct FileConfigProvider {
    path: PathBuf,
    _watcher: notify::RecommendedWatcher,
    update_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl FileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (tx, rx) = mpsc::channel(1);
        let config_filename = path
            .file_name()
            .ok_or_else(|| eyre!("Invalid config path: {}", path.display()))?
            .to_owned();

        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        if (event.kind.is_modify()
                            || event.kind.is_create()
                            || event.kind.is_remove())
                            && event
                                .paths
                                .iter()
                                .any(|p| p.file_name() == Some(&config_filename))
                        {
                            tracing::debug!("Config file changed: {:?}", event.kind);
                            // A pending signal already covers this change.
                            let _ = tx.try_send(());
                        }
                    }
                    Err(e) => tracing::error!("File watch error: {:?}", e),
                }
            })
            .wrap_err("Failed to create config file watcher")?;

        let watch_dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        watcher
            .watch(watch_dir, RecursiveMode::NonRecursive)
            .wrap_err("Failed to watch config directory")?;

        Ok(Self {
            path,
            _watcher: watcher,
            update_rx: Mutex::new(Some(rx)),
        })
    }
}

#[async_trait]
impl ConfigProvider for FileConfigProvider {
    async fn load_config(&self) -> Result<GatewayConfig> {
        let path_str = self
            .path
            .to_str()
            .ok_or_else(|| eyre!("Invalid UTF-8 path: {}", self.path.display()))?;
        load_config(path_str).await
    }

    fn watch(&self) -> Result<mpsc::Receiver<()>> {
        self.update_rx
            .lock()
            .map_err(|_| eyre!("Config watch lock poisoned"))?
            .take()
            .ok_or_else(|| eyre!("Config watch can only be taken once"))
    }
}
