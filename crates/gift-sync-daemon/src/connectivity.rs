//! Network reachability probe feeding the connectivity gate.

use anyhow::Context;
use gift_sync_core::SharedGate;
use gift_sync_core::gate::ConnectivityGate;
use reqwest::{Client, Url};
use std::time::Duration;
use tracing::{debug, info};

/// Probe timeout; kept short so an unreachable server does not stall a cycle
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Checks `{base}/health` to decide whether the remote store is reachable.
pub struct NetworkProbe {
    client: Client,
    health_url: Url,
}

impl NetworkProbe {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let mut health_url =
            Url::parse(base_url).with_context(|| format!("Invalid base URL: {}", base_url))?;
        health_url
            .path_segments_mut()
            .map_err(|_| anyhow::anyhow!("Base URL cannot carry a path: {}", base_url))?
            .pop_if_empty()
            .push("health");

        let client = Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { client, health_url })
    }

    /// Any successful response counts as online.
    pub async fn check(&self) -> bool {
        match self.client.get(self.health_url.clone()).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Health check failed: {}", e);
                false
            }
        }
    }

    /// Probe and publish the result to `gate`, logging transitions.
    pub async fn refresh(&self, gate: &SharedGate) -> bool {
        let online = self.check().await;
        if online != gate.is_online() {
            if online {
                info!("Remote store reachable");
            } else {
                info!("Remote store unreachable, working offline");
            }
        }
        gate.set_online(online);
        online
    }
}
