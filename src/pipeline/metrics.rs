//! Metrics hub: running totals with broadcast to WebSocket clients.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{RwLock, broadcast};
use tracing::debug;
use uuid::Uuid;

use crate::campaigns::{CampaignStatus, Outcome, OutcomeCounts};

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Process-wide counters since start-up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub sent: u64,
    pub failed: u64,
    pub suppressed: u64,
    pub simulated: u64,
    pub aborted: u64,
    pub opened: u64,
    pub clicked: u64,
    pub campaigns_running: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingKind {
    Open,
    Click,
}

/// Events pushed to dashboard clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricsEvent {
    /// Full totals; sent on connect and after a client lags.
    Snapshot { totals: MetricsSnapshot },
    CampaignStarted {
        campaign_id: Uuid,
        name: String,
        recipients: usize,
        dry_run: bool,
    },
    Recipient {
        campaign_id: Uuid,
        lead_id: Uuid,
        email: String,
        outcome: Outcome,
        attempts: u32,
    },
    CampaignFinished {
        campaign_id: Uuid,
        status: CampaignStatus,
        counts: OutcomeCounts,
    },
    Tracking {
        campaign_id: Uuid,
        kind: TrackingKind,
    },
}

/// Running totals plus a broadcast channel for fan-out.
pub struct MetricsHub {
    totals: RwLock<MetricsSnapshot>,
    tx: broadcast::Sender<MetricsEvent>,
}

impl MetricsHub {
    pub fn new() -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Arc::new(Self {
            totals: RwLock::new(MetricsSnapshot::default()),
            tx,
        })
    }

    /// Subscribe to live events. Each WS client calls this.
    pub fn subscribe(&self) -> broadcast::Receiver<MetricsEvent> {
        self.tx.subscribe()
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        *self.totals.read().await
    }

    pub async fn campaign_started(&self, campaign_id: Uuid, name: &str, recipients: usize, dry_run: bool) {
        self.totals.write().await.campaigns_running += 1;
        // Ok if no receivers are listening
        let _ = self.tx.send(MetricsEvent::CampaignStarted {
            campaign_id,
            name: name.to_string(),
            recipients,
            dry_run,
        });
    }

    pub async fn recipient(&self, campaign_id: Uuid, lead_id: Uuid, email: &str, outcome: Outcome, attempts: u32) {
        {
            let mut totals = self.totals.write().await;
            match outcome {
                Outcome::Sent => totals.sent += 1,
                Outcome::Failed => totals.failed += 1,
                Outcome::Suppressed => totals.suppressed += 1,
                Outcome::Simulated => totals.simulated += 1,
                Outcome::Aborted => totals.aborted += 1,
            }
        }
        let _ = self.tx.send(MetricsEvent::Recipient {
            campaign_id,
            lead_id,
            email: email.to_string(),
            outcome,
            attempts,
        });
    }

    pub async fn campaign_finished(&self, campaign_id: Uuid, status: CampaignStatus, counts: OutcomeCounts) {
        {
            let mut totals = self.totals.write().await;
            totals.campaigns_running = totals.campaigns_running.saturating_sub(1);
        }
        debug!(campaign_id = %campaign_id, status = %status, "Broadcasting campaign finish");
        let _ = self.tx.send(MetricsEvent::CampaignFinished {
            campaign_id,
            status,
            counts,
        });
    }

    pub async fn tracking(&self, campaign_id: Uuid, kind: TrackingKind) {
        {
            let mut totals = self.totals.write().await;
            match kind {
                TrackingKind::Open => totals.opened += 1,
                TrackingKind::Click => totals.clicked += 1,
            }
        }
        let _ = self.tx.send(MetricsEvent::Tracking { campaign_id, kind });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recipient_updates_totals_and_broadcasts() {
        let hub = MetricsHub::new();
        let mut rx = hub.subscribe();
        let c = Uuid::new_v4();

        hub.campaign_started(c, "Launch", 2, false).await;
        hub.recipient(c, Uuid::new_v4(), "a@x.com", Outcome::Sent, 1).await;
        hub.recipient(c, Uuid::new_v4(), "b@x.com", Outcome::Suppressed, 0).await;

        let totals = hub.snapshot().await;
        assert_eq!(totals.sent, 1);
        assert_eq!(totals.suppressed, 1);
        assert_eq!(totals.campaigns_running, 1);

        assert!(matches!(rx.recv().await.unwrap(), MetricsEvent::CampaignStarted { recipients: 2, .. }));
        assert!(matches!(
            rx.recv().await.unwrap(),
            MetricsEvent::Recipient { outcome: Outcome::Sent, .. }
        ));
    }

    #[tokio::test]
    async fn finish_decrements_running() {
        let hub = MetricsHub::new();
        let c = Uuid::new_v4();
        hub.campaign_started(c, "x", 0, true).await;
        hub.campaign_finished(c, CampaignStatus::Completed, OutcomeCounts::default()).await;
        hub.campaign_finished(c, CampaignStatus::Completed, OutcomeCounts::default()).await;
        assert_eq!(hub.snapshot().await.campaigns_running, 0);
    }

    #[test]
    fn events_are_tagged_by_type() {
        let json = serde_json::to_value(MetricsEvent::Tracking {
            campaign_id: Uuid::nil(),
            kind: TrackingKind::Click,
        })
        .unwrap();
        assert_eq!(json["type"], "tracking");
        assert_eq!(json["kind"], "click");

        let snap = serde_json::to_value(MetricsEvent::Snapshot {
            totals: MetricsSnapshot::default(),
        })
        .unwrap();
        assert_eq!(snap["type"], "snapshot");
        assert_eq!(snap["totals"]["sent"], 0);
    }
}
