//! Fix output: feed clients and webhook notification.
//!
//! Every accepted fix becomes one JSON line with a stable field order.
//! Feed clients connect over TCP and receive the stream; a webhook URL,
//! when configured, gets a fire-and-forget POST per fix.

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info};

use mlat_core::solver::Fix;
use mlat_core::types::icao_to_string;

// ---------------------------------------------------------------------------
// Output record
// ---------------------------------------------------------------------------

/// One fix on the wire. Field order is part of the contract.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FixRecord {
    pub icao: String,
    /// Transmission time, canonical timebase [s].
    pub t0: f64,
    pub lat: f64,
    pub lon: f64,
    /// Geometric altitude [m].
    pub alt: f64,
    /// 3x3 ECEF covariance [m^2].
    pub cov: [[f64; 3]; 3],
    pub n_receivers: usize,
    pub receivers: Vec<ReceiverEntry>,
    pub chi2_dof: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ReceiverEntry {
    pub id: u32,
    pub tick: u64,
    pub residual_s: f64,
}

impl FixRecord {
    pub fn from_fix(fix: &Fix) -> Self {
        FixRecord {
            icao: icao_to_string(&fix.icao),
            t0: fix.t0,
            lat: fix.geodetic.lat_deg,
            lon: fix.geodetic.lon_deg,
            alt: fix.geodetic.alt_m,
            cov: fix.covariance,
            n_receivers: fix.receivers.len(),
            receivers: fix
                .receivers
                .iter()
                .map(|r| ReceiverEntry {
                    id: r.receiver.0,
                    tick: r.tick,
                    residual_s: r.residual_s,
                })
                .collect(),
            chi2_dof: fix.chi2_dof,
        }
    }
}

// ---------------------------------------------------------------------------
// Feed dispatcher
// ---------------------------------------------------------------------------

/// Broadcasts fix lines to every connected feed client.
#[derive(Clone)]
pub struct FeedDispatcher {
    tx: broadcast::Sender<String>,
}

impl FeedDispatcher {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        FeedDispatcher { tx }
    }

    /// Publish one fix. With no clients connected this is a no-op.
    pub fn publish(&self, fix: &Fix) {
        let record = FixRecord::from_fix(fix);
        if let Ok(line) = serde_json::to_string(&record) {
            let _ = self.tx.send(line);
        }
    }

    /// Accept feed clients and stream them fix lines until they go away.
    pub async fn serve(&self, listener: TcpListener) {
        loop {
            let Ok((mut stream, addr)) = listener.accept().await else {
                continue;
            };
            info!(%addr, "feed client connected");
            let mut rx = self.tx.subscribe();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(line) => {
                            if stream.write_all(line.as_bytes()).await.is_err()
                                || stream.write_all(b"\n").await.is_err()
                            {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(%addr, skipped = n, "slow feed client lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                info!(%addr, "feed client disconnected");
            });
        }
    }
}

impl Default for FeedDispatcher {
    fn default() -> Self {
        FeedDispatcher::new()
    }
}

// ---------------------------------------------------------------------------
// Webhook
// ---------------------------------------------------------------------------

/// Fire-and-forget HTTP POST of accepted fixes as JSON.
#[derive(Clone)]
pub struct WebhookDispatcher {
    url: String,
    client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(url: &str) -> Self {
        WebhookDispatcher {
            url: url.to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn notify(&self, fix: &Fix) {
        let record = FixRecord::from_fix(fix);
        let client = self.client.clone();
        let url = self.url.clone();

        tokio::spawn(async move {
            if let Err(e) = client.post(&url).json(&record).send().await {
                debug!(error = %e, "webhook POST failed");
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
