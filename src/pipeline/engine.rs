//! Campaign engine.
//!
//! Owns the lifecycle around the orchestrator: creating campaigns, starting
//! send-now runs, a ticker for scheduled campaigns, cancellation, resumption
//! of aborted runs and status persistence. A campaign never runs twice at
//! the same time.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::campaigns::{Campaign, CampaignReport, CampaignStatus, Outcome, OutcomeCounts};
use crate::error::{CampaignError, ErrorClass, Result};
use crate::pipeline::orchestrator::{CampaignRunner, CancelHandle, Route, resolve_recipients};
use crate::transport::DEFAULT_PROFILE_ID;

/// A started campaign run.
pub struct RunHandle {
    pub campaign_id: Uuid,
    handle: JoinHandle<Result<CampaignReport>>,
}

impl RunHandle {
    /// Wait for the run to finish.
    pub async fn wait(self) -> Result<CampaignReport> {
        self.handle
            .await
            .map_err(|e| CampaignError::RunFailed(e.to_string()))?
    }
}

pub struct CampaignEngine {
    runner: Arc<CampaignRunner>,
    routes: HashMap<String, Route>,
    default_profile: Option<String>,
    running: Mutex<HashMap<Uuid, CancelHandle>>,
}

impl CampaignEngine {
    /// `routes` are the configured transport profiles. With none, every
    /// campaign runs dry.
    pub fn new(runner: CampaignRunner, routes: Vec<Route>) -> Self {
        let default_profile = routes
            .iter()
            .find(|r| r.profile_id == DEFAULT_PROFILE_ID)
            .or_else(|| routes.first())
            .map(|r| r.profile_id.clone());
        let routes = routes
            .into_iter()
            .map(|r| (r.profile_id.clone(), r))
            .collect();
        Self {
            runner: Arc::new(runner),
            routes,
            default_profile,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn runner(&self) -> &Arc<CampaignRunner> {
        &self.runner
    }

    /// Profile ids, sorted.
    pub fn profiles(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.routes.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether any transport is configured; without one campaigns are simulated.
    pub fn can_send(&self) -> bool {
        !self.routes.is_empty()
    }

    pub fn is_running(&self, id: Uuid) -> bool {
        self.lock_running().contains_key(&id)
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, CancelHandle>> {
        match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Validate and store a new campaign. Campaigns with `send_at` are
    /// stored `scheduled`, the rest `draft`.
    pub async fn create_campaign(&self, mut campaign: Campaign) -> Result<Campaign> {
        campaign.validate().map_err(CampaignError::Invalid)?;
        if let Some(profile) = &campaign.profile_id
            && self.can_send()
            && !self.routes.contains_key(profile)
        {
            return Err(CampaignError::UnknownProfile {
                profile: profile.clone(),
            }
            .into());
        }

        let now = Utc::now();
        campaign.status = if campaign.send_at.is_some() {
            CampaignStatus::Scheduled
        } else {
            CampaignStatus::Draft
        };
        campaign.created_at = now;
        campaign.updated_at = now;
        campaign.started_at = None;
        campaign.finished_at = None;

        self.runner.db().insert_campaign(&campaign).await?;
        info!(
            campaign_id = %campaign.id,
            tenant = %campaign.tenant_id,
            status = %campaign.status,
            "Campaign created"
        );
        Ok(campaign)
    }

    /// Start (or resume) a campaign in the background.
    pub async fn start(self: &Arc<Self>, id: Uuid) -> Result<RunHandle> {
        let campaign = self
            .runner
            .db()
            .get_campaign(id)
            .await?
            .ok_or(CampaignError::NotFound { id })?;

        let route = self.route_for(&campaign)?;

        let cancel = CancelHandle::new();
        {
            let mut running = self.lock_running();
            if running.contains_key(&id) {
                return Err(CampaignError::AlreadyRunning { id }.into());
            }
            running.insert(id, cancel.clone());
        }

        if let Err(e) = self.enter_sending(&campaign).await {
            self.lock_running().remove(&id);
            return Err(e);
        }

        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let result = engine.execute(campaign, route, cancel).await;
            if let Err(e) = &result {
                error!(campaign_id = %id, error = %e, "Campaign run failed");
                engine.settle_failed(id).await;
            }
            engine.lock_running().remove(&id);
            result
        });

        Ok(RunHandle {
            campaign_id: id,
            handle,
        })
    }

    async fn enter_sending(&self, campaign: &Campaign) -> Result<()> {
        let invalid = |status: CampaignStatus| CampaignError::InvalidTransition {
            id: campaign.id,
            status: status.to_string(),
            target: CampaignStatus::Sending.to_string(),
        };
        if !campaign.status.can_transition_to(CampaignStatus::Sending) {
            return Err(invalid(campaign.status).into());
        }
        let moved = self
            .runner
            .db()
            .transition_campaign(campaign.id, campaign.status, CampaignStatus::Sending, Utc::now())
            .await?;
        if !moved {
            // Someone else changed it since we read it.
            let current = self
                .runner
                .db()
                .get_campaign(campaign.id)
                .await?
                .map(|c| c.status)
                .unwrap_or(campaign.status);
            return Err(invalid(current).into());
        }
        Ok(())
    }

    fn route_for(&self, campaign: &Campaign) -> Result<Option<Route>> {
        if !self.can_send() {
            return Ok(None);
        }
        let profile = campaign
            .profile_id
            .as_ref()
            .or(self.default_profile.as_ref());
        match profile.and_then(|p| self.routes.get(p)) {
            Some(route) => Ok(Some(route.clone())),
            None => Err(CampaignError::UnknownProfile {
                profile: profile.cloned().unwrap_or_default(),
            }
            .into()),
        }
    }

    async fn execute(
        &self,
        campaign: Campaign,
        route: Option<Route>,
        cancel: CancelHandle,
    ) -> Result<CampaignReport> {
        let db = self.runner.db();

        let leads = db.list_leads(&campaign.tenant_id, &campaign.selector).await?;
        let leads = resolve_recipients(leads, campaign.settings.max_recipients);

        // Resumption: only recipients without a final outcome run again.
        let done: HashSet<Uuid> = db
            .list_recipient_outcomes(campaign.id)
            .await?
            .into_iter()
            .filter(|o| o.outcome != Outcome::Aborted)
            .map(|o| o.lead_id)
            .collect();
        let pending: Vec<_> = leads.into_iter().filter(|l| !done.contains(&l.id)).collect();
        if !done.is_empty() {
            info!(
                campaign_id = %campaign.id,
                done = done.len(),
                pending = pending.len(),
                "Resuming campaign"
            );
        }

        let report = self.runner.run(&campaign, pending, route, cancel).await;
        self.finish_status(campaign.id, report.status).await?;
        Ok(report)
    }

    /// Leave no campaign `sending` after a run that errored out.
    async fn settle_failed(&self, id: Uuid) {
        let db = self.runner.db();
        let now = Utc::now();
        for (from, target) in [
            (CampaignStatus::Sending, CampaignStatus::Aborted),
            (CampaignStatus::Cancelling, CampaignStatus::Cancelled),
        ] {
            match db.transition_campaign(id, from, target, now).await {
                Ok(true) => {
                    warn!(campaign_id = %id, status = %target, "Failed run settled");
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    error!(campaign_id = %id, error = %e, "Failed to settle campaign status");
                    return;
                }
            }
        }
    }

    /// Persist the final status. A cancel that raced the end of the run
    /// still wins.
    async fn finish_status(&self, id: Uuid, target: CampaignStatus) -> Result<()> {
        let db = self.runner.db();
        let now = Utc::now();
        if db
            .transition_campaign(id, CampaignStatus::Sending, target, now)
            .await?
        {
            return Ok(());
        }
        let from_cancelling = match target {
            CampaignStatus::Aborted => CampaignStatus::Aborted,
            _ => CampaignStatus::Cancelled,
        };
        if !db
            .transition_campaign(id, CampaignStatus::Cancelling, from_cancelling, now)
            .await?
        {
            warn!(campaign_id = %id, target = %target, "Campaign status changed during run");
        }
        Ok(())
    }

    /// Request cancellation. Running campaigns move to `cancelling` and stop
    /// after in-flight attempts; drafts and scheduled campaigns are
    /// cancelled immediately.
    pub async fn cancel(&self, id: Uuid) -> Result<CampaignStatus> {
        let db = self.runner.db();
        let handle = self.lock_running().get(&id).cloned();

        if let Some(handle) = handle {
            db.transition_campaign(id, CampaignStatus::Sending, CampaignStatus::Cancelling, Utc::now())
                .await?;
            handle.cancel();
            info!(campaign_id = %id, "Cancel requested");
            return Ok(CampaignStatus::Cancelling);
        }

        let campaign = db.get_campaign(id).await?.ok_or(CampaignError::NotFound { id })?;
        if matches!(campaign.status, CampaignStatus::Draft | CampaignStatus::Scheduled)
            && db
                .transition_campaign(id, campaign.status, CampaignStatus::Cancelled, Utc::now())
                .await?
        {
            info!(campaign_id = %id, "Campaign cancelled before sending");
            return Ok(CampaignStatus::Cancelled);
        }
        Err(CampaignError::InvalidTransition {
            id,
            status: campaign.status.to_string(),
            target: CampaignStatus::Cancelled.to_string(),
        }
        .into())
    }

    /// Start every scheduled campaign that is due. Returns how many started.
    pub async fn tick(self: &Arc<Self>, now: DateTime<Utc>) -> usize {
        let due = match self.runner.db().list_due_campaigns(now).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "Failed to load due campaigns");
                return 0;
            }
        };

        let mut started = 0;
        for campaign in due {
            match self.start(campaign.id).await {
                Ok(_) => {
                    info!(campaign_id = %campaign.id, "Scheduled campaign started");
                    started += 1;
                }
                Err(e) => warn!(campaign_id = %campaign.id, error = %e, "Scheduled campaign not started"),
            }
        }
        if started > 0 {
            debug!(started, "Scheduler tick");
        }
        started
    }

    /// Report built from stored outcomes.
    pub async fn report(&self, id: Uuid) -> Result<CampaignReport> {
        let db = self.runner.db();
        let campaign = db.get_campaign(id).await?.ok_or(CampaignError::NotFound { id })?;
        let outcomes = db.list_recipient_outcomes(id).await?;

        let fatal_error = if campaign.status == CampaignStatus::Aborted {
            db.list_send_attempts(id)
                .await?
                .into_iter()
                .rev()
                .find(|a| a.error_class == Some(ErrorClass::Auth))
                .and_then(|a| a.error_message)
        } else {
            None
        };

        Ok(CampaignReport {
            campaign_id: id,
            status: campaign.status,
            recipients: outcomes.len(),
            counts: OutcomeCounts::from_outcomes(&outcomes),
            outcomes,
            fatal_error,
            started_at: campaign.started_at.unwrap_or(campaign.created_at),
            finished_at: campaign.finished_at.unwrap_or_else(Utc::now),
        })
    }

    /// Load the suppression patterns of every tenant (start-up).
    pub async fn load_suppressions(&self) -> Result<usize> {
        let entries = self.runner.db().list_all_suppressions().await?;
        self.runner.suppressions().load_all(&entries).await;
        Ok(entries.len())
    }

    /// Settle campaigns a previous process left mid-run, across all tenants,
    /// so they can be resumed.
    pub async fn recover(&self) -> Result<usize> {
        let db = self.runner.db();
        let mut recovered = 0;
        for (from, target) in [
            (CampaignStatus::Sending, CampaignStatus::Aborted),
            (CampaignStatus::Cancelling, CampaignStatus::Cancelled),
        ] {
            for campaign in db.list_campaigns_in_status(from).await? {
                if self.is_running(campaign.id) {
                    continue;
                }
                if db
                    .transition_campaign(campaign.id, from, target, Utc::now())
                    .await?
                {
                    warn!(
                        campaign_id = %campaign.id,
                        tenant = %campaign.tenant_id,
                        status = %target,
                        "Recovered interrupted campaign"
                    );
                    recovered += 1;
                }
            }
        }
        Ok(recovered)
    }
}

/// Spawn the scheduler ticker background task.
pub fn spawn_ticker(engine: Arc<CampaignEngine>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            engine.tick(Utc::now()).await;
        }
    })
}
