//! HTTP backend client — component persistence and realtime config.
//!
//! The relay carries live updates; durable component storage lives
//! behind the host's REST API. [`HttpPersistence`] implements
//! [`ComponentPersistence`] over that API so the draft manager never
//! knows it is talking HTTP.
//!
//! The realtime connection config (relay URL plus anon key) is fetched
//! once and cached for the life of the process. A fetch failure
//! resets the cache so the next caller retries instead of reusing a
//! half-initialized value.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use lattice_core::{Component, Layer};

use crate::draft::{ComponentPersistence, PersistError};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct SaveComponentBody<'a> {
    layers: &'a [Layer],
}

#[derive(Deserialize)]
struct SaveComponentResponse {
    layers: Vec<Layer>,
}

/// Component persistence over the host REST API.
pub struct HttpPersistence {
    base_url: String,
    http: reqwest::Client,
}

impl HttpPersistence {
    pub fn new(base_url: impl Into<String>) -> Result<Self, PersistError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| PersistError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    fn component_url(&self, id: Uuid) -> String {
        format!("{}/api/components/{id}", self.base_url)
    }

    async fn put_component(&self, id: Uuid, layers: Vec<Layer>) -> Result<Vec<Layer>, PersistError> {
        let response = self
            .http
            .put(self.component_url(id))
            .json(&SaveComponentBody { layers: &layers })
            .send()
            .await
            .map_err(|e| PersistError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(PersistError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let body: SaveComponentResponse = response
            .json()
            .await
            .map_err(|e| PersistError::Transport(e.to_string()))?;
        Ok(body.layers)
    }

    /// Create a component on the backend, returning it as stored.
    pub async fn create_component(
        &self,
        name: &str,
        layers: Vec<Layer>,
    ) -> Result<Component, PersistError> {
        let response = self
            .http
            .post(format!("{}/api/components", self.base_url))
            .json(&serde_json::json!({ "name": name, "layers": layers }))
            .send()
            .await
            .map_err(|e| PersistError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(PersistError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json()
            .await
            .map_err(|e| PersistError::Transport(e.to_string()))
    }

    /// Delete a component on the backend.
    pub async fn delete_component(&self, id: Uuid) -> Result<(), PersistError> {
        let response = self
            .http
            .delete(self.component_url(id))
            .send()
            .await
            .map_err(|e| PersistError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(PersistError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }

    /// Fetch a component's canonical layers.
    pub async fn fetch_component(&self, id: Uuid) -> Result<Vec<Layer>, PersistError> {
        let response = self
            .http
            .get(self.component_url(id))
            .send()
            .await
            .map_err(|e| PersistError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(PersistError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        let body: SaveComponentResponse = response
            .json()
            .await
            .map_err(|e| PersistError::Transport(e.to_string()))?;
        Ok(body.layers)
    }
}

impl ComponentPersistence for HttpPersistence {
    fn save_component<'a>(
        &'a self,
        id: Uuid,
        layers: Vec<Layer>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Layer>, PersistError>> + Send + 'a>> {
        Box::pin(self.put_component(id, layers))
    }
}

/// Connection parameters for the realtime relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeConfig {
    pub url: String,
    #[serde(rename = "anonKey")]
    pub anon_key: String,
}

/// Once-per-process cache of the realtime config.
pub struct ConfigCache {
    endpoint: String,
    http: reqwest::Client,
    cached: Mutex<Option<RealtimeConfig>>,
}

impl ConfigCache {
    pub fn new(base_url: impl Into<String>) -> Result<Self, PersistError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| PersistError::Transport(e.to_string()))?;
        Ok(Self {
            endpoint: format!(
                "{}/api/supabase/config",
                base_url.into().trim_end_matches('/')
            ),
            http,
            cached: Mutex::new(None),
        })
    }

    /// The realtime config, fetched on first use.
    ///
    /// Holds the cache lock across the fetch so concurrent callers
    /// produce one request, not a stampede. On failure the cache stays
    /// empty and the error propagates.
    pub async fn get(&self) -> Result<RealtimeConfig, PersistError> {
        let mut cached = self.cached.lock().await;
        if let Some(config) = cached.as_ref() {
            return Ok(config.clone());
        }

        let response = self
            .http
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|e| PersistError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(PersistError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let config: RealtimeConfig = response
            .json()
            .await
            .map_err(|e| PersistError::Transport(e.to_string()))?;
        *cached = Some(config.clone());
        Ok(config)
    }

    /// Drop the cached value (sign-out, environment switch).
    pub async fn reset(&self) {
        *self.cached.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_realtime_config_field_names() {
        let json = r#"{"url":"wss://relay.example.com","anonKey":"abc123"}"#;
        let config: RealtimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.url, "wss://relay.example.com");
        assert_eq!(config.anon_key, "abc123");

        let back = serde_json::to_string(&config).unwrap();
        assert!(back.contains("\"anonKey\""));
    }

    #[test]
    fn test_base_url_trailing_slash_normalized() {
        let persistence = HttpPersistence::new("http://localhost:3000/").unwrap();
        let id = Uuid::new_v4();
        assert_eq!(
            persistence.component_url(id),
            format!("http://localhost:3000/api/components/{id}")
        );
    }
}
