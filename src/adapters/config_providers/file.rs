use std::{
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::{
    config::{loader::load_config, models::GatewayConfig},
    ports::config_provider::ConfigProvider,
};

/// Configuration provider backed by a local file, watched with `notify`.
///
/// The parent directory is watched rather than the file itself so that editors
/// which replace the file on save still trigger a reload.
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
            .ok_or_else(|| eyre::eyre!("Invalid config path: {}", path.display()))?
            .to_owned();

        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    let relevant = event.kind.is_modify()
                        || event.kind.is_create()
                        || event.kind.is_remove();
                    if relevant
                        && event
                            .paths
                            .iter()
                            .any(|p| p.file_name() == Some(&config_filename))
                    {
                        tracing::debug!(kind = ?event.kind, "Config file changed");
                        // a pending signal already covers this change
                        let _ = tx.try_send(());
                    }
                }
                Err(e) => tracing::error!(error = %e, "Config file watch error"),
            })
            .wrap_err("Failed to create config file watcher")?;

        let watch_dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        watcher
            .watch(watch_dir, RecursiveMode::NonRecursive)
            .wrap_err_with(|| format!("Failed to watch {}", watch_dir.display()))?;

        Ok(Self {
            path,
            _watcher: watcher,
            update_rx: Mutex::new(Some(rx)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConfigProvider for FileConfigProvider {
    async fn load_config(&self) -> Result<GatewayConfig> {
        let path = self
            .path
            .to_str()
            .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", self.path.display()))?;
        load_config(path).await
    }

    fn watch(&self) -> Option<mpsc::Receiver<()>> {
        self.update_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::Write};

    use tempfile::tempdir;
    use tokio::time::{Duration, sleep};

    use super::*;

    const INITIAL: &str = r#"
listen_addr = "127.0.0.1:8080"

[[routes]]
path = "/api/orders"
target = "orders"
"#;

    const UPDATED: &str = r#"
listen_addr = "127.0.0.1:8080"

[[routes]]
path = "/api/orders"
target = "orders"

[[routes]]
path = "/api/users"
target = "users"
"#;

    #[tokio::test]
    async fn reload_signal_on_file_change() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("keel.toml");
        File::create(&file_path)?.write_all(INITIAL.as_bytes())?;

        let provider = FileConfigProvider::new(&file_path)?;
        let config = provider.load_config().await?;
        assert_eq!(config.routes.len(), 1);

        let mut rx = provider.watch().expect("first watch yields a receiver");
        assert!(provider.watch().is_none());

        sleep(Duration::from_millis(100)).await;
        File::create(&file_path)?.write_all(UPDATED.as_bytes())?;

        let notification = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(matches!(notification, Ok(Some(()))), "no reload signal");

        let config = provider.load_config().await?;
        assert_eq!(config.routes.len(), 2);
        assert_eq!(config.routes[1].target, "users");
        Ok(())
    }

    #[tokio::test]
    async fn invalid_file_fails_to_load() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("keel.toml");
        File::create(&file_path)?.write_all(b"[[routes]]\npath = \"no-slash\"\ntarget = \"\"\n")?;

        let provider = FileConfigProvider::new(&file_path)?;
        assert!(provider.load_config().await.is_err());
        Ok(())
    }
}
