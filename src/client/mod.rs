//! Registration client
//!
//! Library side of the registration protocol, run by every backend instance:
//! register on startup, renew the lease on an interval, register again if
//! the gateway dropped the instance, and deregister on shutdown.

use reqwest::{Response, StatusCode};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::registry::{InstanceStatus, Lease, Registration};
use crate::types::{GatewayError, Result};

/// HTTP client for one instance's registration
#[derive(Debug, Clone)]
pub struct RegistrationClient {
    http: reqwest::Client,
    registry_url: String,
    registration: Registration,
    service: String,
    instance_id: String,
}

impl RegistrationClient {
    /// `registry_url` is the base URL of the gateway's registry listener
    pub fn new(registry_url: impl Into<String>, registration: Registration) -> Result<Self> {
        registration.validate()?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            registry_url: registry_url.into().trim_end_matches('/').to_string(),
            service: registration.service_key(),
            instance_id: registration.resolved_instance_id(),
            registration,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn instance_url(&self) -> String {
        format!(
            "{}/registry/instances/{}/{}",
            self.registry_url,
            urlencoding::encode(&self.service),
            urlencoding::encode(&self.instance_id)
        )
    }

    pub async fn register(&self) -> Result<Lease> {
        let mut registration = self.registration.clone();
        registration.instance_id = Some(self.instance_id.clone());

        let response = self
            .http
            .post(format!("{}/registry/instances", self.registry_url))
            .json(&registration)
            .send()
            .await?;
        let lease: Lease = check(response).await?.json().await?;

        info!(
            service = %self.service,
            instance = %self.instance_id,
            expires_at = %lease.expires_at,
            "Registered with gateway"
        );
        Ok(lease)
    }

    /// Renew the lease; `NotFound` means the gateway no longer holds the instance
    pub async fn renew(&self) -> Result<Lease> {
        let response = self
            .http
            .put(format!("{}/heartbeat", self.instance_url()))
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    pub async fn set_status(&self, status: InstanceStatus) -> Result<()> {
        let response = self
            .http
            .put(format!("{}/status", self.instance_url()))
            .query(&[("value", status.as_str())])
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    pub async fn deregister(&self) -> Result<()> {
        let response = self.http.delete(self.instance_url()).send().await?;
        check(response).await?;
        info!(service = %self.service, instance = %self.instance_id, "Deregistered from gateway");
        Ok(())
    }

    /// Register, then renew every `every` until `shutdown` flips to true,
    /// then deregister
    pub fn spawn_heartbeat(&self, every: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let client = self.clone();

        tokio::spawn(async move {
            if let Err(e) = client.register().await {
                warn!(error = %e, "Initial registration failed, will retry on next heartbeat");
            }

            let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = tick.tick() => match client.renew().await {
                        Ok(lease) => debug!(instance = %lease.instance_id, "Heartbeat sent"),
                        Err(GatewayError::NotFound(_)) => {
                            info!(instance = %client.instance_id, "Lease lost, registering again");
                            if let Err(e) = client.register().await {
                                warn!(error = %e, "Re-registration failed");
                            }
                        }
                        Err(e) => warn!(error = %e, "Heartbeat failed"),
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            if let Err(e) = client.deregister().await {
                warn!(error = %e, "Deregistration on shutdown failed");
            }
        })
    }
}

/// Map gateway error statuses onto `GatewayError`
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body: serde_json::Value = response.json().await.unwrap_or_default();
    let message = body
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or("no message")
        .to_string();

    Err(match status {
        StatusCode::NOT_FOUND => GatewayError::NotFound(message),
        StatusCode::BAD_REQUEST => GatewayError::BadRequest(message),
        _ => GatewayError::Http(format!("registry returned {}: {}", status, message)),
    })
}
