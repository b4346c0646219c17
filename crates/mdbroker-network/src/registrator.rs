//! Service discovery registration for the broker

use mdbroker_core::{BrokerError, BrokerResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Announces the broker to a discovery service
///
/// `register` is called on every loop iteration and must return
/// immediately; implementations decide how often to actually announce.
pub trait Registrator: Send {
    /// Fire-and-forget announcement
    fn register(&mut self);

    /// Get the registrator name
    fn name(&self) -> &'static str;
}

impl<R: Registrator + ?Sized> Registrator for Box<R> {
    fn register(&mut self) {
        (**self).register()
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Registrator that never announces
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRegistrator;

impl Registrator for NoopRegistrator {
    fn register(&mut self) {}

    fn name(&self) -> &'static str {
        "noop"
    }
}

/// Body posted to the discovery service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    /// Broker identity token
    pub identity: String,
    /// Endpoint peers should connect to
    pub endpoint: String,
}

/// Registrator posting JSON announcements over HTTP
pub struct HttpRegistrator {
    /// HTTP client for announcements
    client: reqwest::Client,
    /// Discovery URL
    url: String,
    /// Announcement body
    announcement: Announcement,
    /// Minimum time between announcements
    interval: Duration,
    /// When the last announcement was started
    last_sent: Option<Instant>,
}

impl HttpRegistrator {
    /// Create a new HTTP registrator
    pub fn new(url: String, announcement: Announcement, interval: Duration) -> BrokerResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(interval.max(Duration::from_secs(1)))
            .build()
            .map_err(|e| BrokerError::Registrator(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url,
            announcement,
            interval,
            last_sent: None,
        })
    }

    /// Whether an announcement should be sent at `now`
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_sent {
            None => true,
            Some(last) => now.duration_since(last) >= self.interval,
        }
    }

    /// Discovery URL
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Registrator for HttpRegistrator {
    fn register(&mut self) {
        let now = Instant::now();
        if !self.is_due(now) {
            return;
        }
        self.last_sent = Some(now);

        let request = self.client.post(&self.url).json(&self.announcement);
        let url = self.url.clone();
        tokio::spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(url = %url, "Broker announced");
                }
                Ok(response) => {
                    warn!(
                        url = %url,
                        status = %response.status(),
                        "Discovery service rejected announcement"
                    );
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "Failed to announce broker");
                }
            }
        });
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
