use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use eyre::{Context, Result, eyre};
use reqwest::Client;
use tokio::sync::mpsc;

use crate::{config::models::GatewayConfig, ports::config_provider::ConfigProvider};

/// Configuration provider that fetches JSON from an HTTP URL and polls for
/// changes. A change is signalled when the response body differs from the
/// previous poll.
pub struct HttpConfigProvider {
    url: String,
    client: Client,
    update_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl HttpConfigProvider {
    /// Must be called inside a tokio runtime; the polling task starts here.
    pub fn new(url: String, poll_interval: Duration) -> Result<Self> {
        let (tx, rx) = mpsc::channel(1);
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .wrap_err("Failed to build config HTTP client")?;

        let poll_client = client.clone();
        let poll_url = url.clone();
        tokio::spawn(async move {
            let mut last_hash: Option<u64> = None;
            let mut interval = tokio::time::interval(poll_interval);

            loop {
                interval.tick().await;
                if tx.is_closed() {
                    return;
                }
                match Self::fetch_body(&poll_client, &poll_url).await {
                    Ok(body) => {
                        let mut hasher = DefaultHasher::new();
                        body.hash(&mut hasher);
                        let new_hash = hasher.finish();
                        match last_hash {
                            Some(last) if last != new_hash => {
                                tracing::info!("Remote configuration changed");
                                let _ = tx.try_send(());
                            }
                            _ => {}
                        }
                        last_hash = Some(new_hash);
                    }
                    Err(e) => tracing::warn!("Failed to poll remote config: {}", e),
                }
            }
        });

        Ok(Self {
            url,
            client,
            update_rx: Mutex::new(Some(rx)),
        })
    }

    async fn fetch_body(client: &Client, url: &str) -> Result<bytes::Bytes> {
        client
            .get(url)
            .send()
            .await
            .wrap_err("Failed to send request")?
            .error_for_status()
            .wrap_err("Config endpoint returned an error status")?
            .bytes()
            .await
            .wrap_err("Failed to read config body")
    }
}

#[async_trait]
impl ConfigProvider for HttpConfigProvider {
    async fn load_config(&self) -> Result<GatewayConfig> {
        let body = Self::fetch_body(&self.client, &self.url).await?;
        serde_json::from_slice(&body).wrap_err("Failed to parse JSON config")
    }

    fn watch(&self) -> Result<mpsc::Receiver<()>> {
        self.update_rx
            .lock()
            .map_err(|_| eyre!("Config watch lock poisoned"))?
            .take()
            .ok_or_else(|| eyre!("Config watch can only be taken once"))
    }
}
