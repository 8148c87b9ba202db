//! Campaign orchestrator.
//!
//! Runs one campaign to completion:
//! - resolves and deduplicates recipients
//! - filters them through the suppression list and the campaign's excluded domains
//! - asks the governor for clearance, deferring recipients that must wait
//! - hands rendered messages to the retry controller on a bounded worker pool
//!
//! Retries and governor deferrals wait in a min-heap keyed by ready time, so
//! no worker slot is held while waiting. Cancellation, the `stop_after`
//! deadline and campaign-fatal errors let in-flight attempts finish and mark
//! everything else `aborted`.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::campaigns::{
    Campaign, CampaignReport, CampaignStatus, Outcome, OutcomeCounts, RateLimit, RecipientOutcome,
};
use crate::error::{ErrorClass, TransportError};
use crate::leads::{Lead, LeadStatus};
use crate::pipeline::dispatcher::{Dispatcher, OutboundMessage};
use crate::pipeline::governor::{Clearance, Governor, GovernorRules};
use crate::pipeline::metrics::MetricsHub;
use crate::pipeline::render::{RenderOptions, render};
use crate::pipeline::retry::{DeliveryJob, RetryController, RetryPolicy, Step};
use crate::pipeline::suppression::{SuppressionDecision, SuppressionList, SuppressionSet};
use crate::store::Database;
use crate::transport::TransportProfile;

/// Default number of concurrent dispatch tasks per campaign.
pub const DEFAULT_WORKERS: usize = 4;

/// Where a campaign's messages go: one transport profile and its dispatcher.
#[derive(Clone)]
pub struct Route {
    /// Governor key; campaigns on the same profile share one budget.
    pub profile_id: String,
    pub dispatcher: Arc<Dispatcher>,
    pub rate_limit: Option<RateLimit>,
    pub daily_cap: Option<u32>,
    pub unsubscribe_footer: Option<String>,
    pub track_opens: bool,
    pub track_clicks: bool,
    /// Right-hand side of generated Message-IDs.
    pub sender_domain: String,
}

impl Route {
    pub fn new(profile_id: impl Into<String>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            profile_id: profile_id.into(),
            dispatcher,
            rate_limit: None,
            daily_cap: None,
            unsubscribe_footer: None,
            track_opens: false,
            track_clicks: false,
            sender_domain: "leadai.local".to_string(),
        }
    }

    pub fn from_profile(profile: &TransportProfile, dispatcher: Arc<Dispatcher>) -> Self {
        let sender_domain = profile
            .from_address
            .rsplit_once('@')
            .map(|(_, d)| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| "leadai.local".to_string());
        Self {
            profile_id: profile.id.clone(),
            dispatcher,
            rate_limit: profile.rate_limit,
            daily_cap: profile.daily_cap,
            unsubscribe_footer: profile.unsubscribe_footer.clone(),
            track_opens: profile.track_opens,
            track_clicks: profile.track_clicks,
            sender_domain,
        }
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimit) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    pub fn with_daily_cap(mut self, cap: u32) -> Self {
        self.daily_cap = Some(cap);
        self
    }
}

/// Cancellation signal shared between the engine and a running campaign.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake the run if it is sleeping.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn notified(&self) {
        self.notify.notified().await
    }
}

/// Deduplicate by trimmed, lower-cased address (first occurrence wins),
/// then apply the recipient cap.
pub fn resolve_recipients(leads: Vec<Lead>, max_recipients: Option<usize>) -> Vec<Lead> {
    let mut seen = HashSet::new();
    let mut resolved: Vec<Lead> = leads
        .into_iter()
        .filter(|lead| seen.insert(lead.address_key()))
        .collect();
    if let Some(max) = max_recipients {
        resolved.truncate(max);
    }
    resolved
}

/// Why a run stopped starting new work.
#[derive(Debug, Clone)]
enum Halt {
    Cancelled,
    Deadline,
    Fatal(TransportError),
}

impl Halt {
    fn final_status(&self) -> CampaignStatus {
        match self {
            Self::Cancelled => CampaignStatus::Cancelled,
            Self::Deadline => CampaignStatus::Completed,
            Self::Fatal(_) => CampaignStatus::Aborted,
        }
    }

    fn detail(&self) -> String {
        match self {
            Self::Cancelled => "campaign cancelled".into(),
            Self::Deadline => "stop-after deadline reached".into(),
            Self::Fatal(e) => format!("campaign halted: {e}"),
        }
    }
}

/// A recipient waiting for its ready time.
struct Deferred {
    ready_at: Instant,
    seq: u64,
    index: usize,
    job: DeliveryJob,
}

impl PartialEq for Deferred {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl Eq for Deferred {}

impl PartialOrd for Deferred {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deferred {
    // Reversed: BinaryHeap is a max-heap, the earliest entry must be on top.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// `None` step: the attempt panicked.
type WorkerResult = (usize, DeliveryJob, Option<Step>);

/// Mutable state of one run.
struct RunState {
    campaign_id: Uuid,
    leads: Vec<Lead>,
    tracking_tokens: Vec<Option<String>>,
    outcomes: Vec<Option<RecipientOutcome>>,
    counts: OutcomeCounts,
}

/// Executes campaigns. Shared by every run in the process.
pub struct CampaignRunner {
    db: Arc<dyn Database>,
    suppressions: Arc<SuppressionList>,
    governor: Arc<Governor>,
    metrics: Arc<MetricsHub>,
    workers: usize,
    retry_policy: RetryPolicy,
    tracking_base_url: Option<String>,
}

impl CampaignRunner {
    pub fn new(
        db: Arc<dyn Database>,
        suppressions: Arc<SuppressionList>,
        governor: Arc<Governor>,
        metrics: Arc<MetricsHub>,
    ) -> Self {
        Self {
            db,
            suppressions,
            governor,
            metrics,
            workers: DEFAULT_WORKERS,
            retry_policy: RetryPolicy::default(),
            tracking_base_url: None,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_tracking_base_url(mut self, url: Option<String>) -> Self {
        self.tracking_base_url = url.filter(|u| !u.trim().is_empty());
        self
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn suppressions(&self) -> &Arc<SuppressionList> {
        &self.suppressions
    }

    pub fn metrics(&self) -> &Arc<MetricsHub> {
        &self.metrics
    }

    /// Run `campaign` over `leads` until every recipient has a terminal outcome.
    ///
    /// Without a route the campaign runs dry. Status transitions are left to
    /// the caller; the returned report carries the final status.
    pub async fn run(
        &self,
        campaign: &Campaign,
        leads: Vec<Lead>,
        route: Option<Route>,
        cancel: CancelHandle,
    ) -> CampaignReport {
        let started_at = Utc::now();
        let leads = resolve_recipients(leads, campaign.settings.max_recipients);
        let recipients = leads.len();
        let dry_run = campaign.dry_run || route.is_none();

        info!(
            campaign_id = %campaign.id,
            recipients,
            dry_run,
            profile = route.as_ref().map(|r| r.profile_id.as_str()).unwrap_or("none"),
            "Campaign run starting"
        );
        self.metrics
            .campaign_started(campaign.id, &campaign.name, recipients, dry_run)
            .await;

        let mut state = RunState {
            campaign_id: campaign.id,
            tracking_tokens: vec![None; leads.len()],
            outcomes: vec![None; leads.len()],
            leads,
            counts: OutcomeCounts::default(),
        };

        let excluded = SuppressionSet::from_domains(&campaign.settings.exclude_domains);
        let deadline = campaign
            .settings
            .stop_after_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs));

        let halt = match (&route, dry_run) {
            (Some(route), false) => {
                self.send_all(campaign, route, &excluded, deadline, &cancel, &mut state)
                    .await
            }
            _ => {
                self.simulate_all(campaign, &excluded, deadline, &cancel, &mut state)
                    .await
            }
        };

        let status = halt
            .as_ref()
            .map(Halt::final_status)
            .unwrap_or(CampaignStatus::Completed);
        let fatal_error = match &halt {
            Some(Halt::Fatal(e)) => Some(e.to_string()),
            _ => None,
        };

        let finished_at = Utc::now();
        let outcomes: Vec<RecipientOutcome> = state.outcomes.into_iter().flatten().collect();
        debug_assert_eq!(outcomes.len(), recipients);

        info!(
            campaign_id = %campaign.id,
            status = %status,
            sent = state.counts.sent,
            failed = state.counts.failed,
            suppressed = state.counts.suppressed,
            simulated = state.counts.simulated,
            aborted = state.counts.aborted,
            "Campaign run finished"
        );
        self.metrics
            .campaign_finished(campaign.id, status, state.counts)
            .await;

        CampaignReport {
            campaign_id: campaign.id,
            status,
            recipients,
            counts: state.counts,
            outcomes,
            fatal_error,
            started_at,
            finished_at,
        }
    }

    /// Dry run: suppression still applies, everything else is rendered only.
    /// Cancel and the deadline stop it like a real run.
    async fn simulate_all(
        &self,
        campaign: &Campaign,
        excluded: &SuppressionSet,
        deadline: Option<Instant>,
        cancel: &CancelHandle,
        state: &mut RunState,
    ) -> Option<Halt> {
        for index in 0..state.leads.len() {
            let halt = if cancel.is_cancelled() {
                Some(Halt::Cancelled)
            } else if deadline.is_some_and(|d| Instant::now() >= d) {
                Some(Halt::Deadline)
            } else {
                None
            };
            if let Some(halt) = halt {
                let detail = halt.detail();
                for rest in index..state.leads.len() {
                    let lead = &state.leads[rest];
                    let mut outcome =
                        RecipientOutcome::new(campaign.id, lead.id, &lead.email, Outcome::Aborted);
                    outcome.detail = Some(detail.clone());
                    self.finish(state, rest, outcome).await;
                }
                return Some(halt);
            }

            if let Some(outcome) = self.suppressed(campaign, excluded, state, index).await {
                self.finish(state, index, outcome).await;
                continue;
            }
            let lead = &state.leads[index];
            let outcome = match render(
                &campaign.subject,
                &campaign.body,
                lead,
                &RenderOptions {
                    utm: campaign.settings.utm.clone(),
                    ..Default::default()
                },
            ) {
                Ok(_) => RecipientOutcome::new(campaign.id, lead.id, &lead.email, Outcome::Simulated),
                Err(e) => failed_outcome(campaign.id, lead, 0, &e),
            };
            self.finish(state, index, outcome).await;
        }
        None
    }

    async fn send_all(
        &self,
        campaign: &Campaign,
        route: &Route,
        excluded: &SuppressionSet,
        deadline: Option<Instant>,
        cancel: &CancelHandle,
        state: &mut RunState,
    ) -> Option<Halt> {
        let controller = RetryController::new(
            route.dispatcher.clone(),
            self.db.clone(),
            self.retry_policy,
        );
        let rules = GovernorRules {
            rate_limit: campaign.settings.rate_limit.or(route.rate_limit),
            window: campaign.settings.send_window.clone(),
            daily_cap: route.daily_cap,
        };

        let mut fresh: VecDeque<usize> = (0..state.leads.len()).collect();
        let mut deferred: BinaryHeap<Deferred> = BinaryHeap::new();
        let mut workers: JoinSet<WorkerResult> = JoinSet::new();
        let mut seq: u64 = 0;
        let mut halt: Option<Halt> = None;

        loop {
            if halt.is_none() {
                if cancel.is_cancelled() {
                    halt = Some(Halt::Cancelled);
                } else if deadline.is_some_and(|d| Instant::now() >= d) {
                    halt = Some(Halt::Deadline);
                }
            }
            if let Some(reason) = &halt {
                info!(campaign_id = %campaign.id, reason = %reason.detail(), "Campaign halting");
                break;
            }

            // Start as much work as capacity allows.
            while workers.len() < self.workers {
                let next = match deferred.peek() {
                    Some(d) if d.ready_at <= Instant::now() => deferred.pop().map(|d| (d.index, Some(d.job))),
                    _ => fresh.pop_front().map(|i| (i, None)),
                };
                let Some((index, job)) = next else {
                    break;
                };

                let job = match job {
                    Some(job) => job,
                    None => {
                        if let Some(outcome) = self.suppressed(campaign, excluded, state, index).await {
                            self.finish(state, index, outcome).await;
                            continue;
                        }
                        match self.prepare(campaign, route, state, index) {
                            Ok(job) => job,
                            Err(e) => {
                                let outcome = failed_outcome(campaign.id, &state.leads[index], 0, &e);
                                self.finish(state, index, outcome).await;
                                continue;
                            }
                        }
                    }
                };

                match self.governor.request(&route.profile_id, &rules, Utc::now()) {
                    Clearance::Clear => {
                        let controller = controller.clone();
                        let mut job = job;
                        workers.spawn(async move {
                            let step = AssertUnwindSafe(controller.attempt(&mut job))
                                .catch_unwind()
                                .await
                                .ok();
                            (index, job, step)
                        });
                    }
                    Clearance::NotBefore(at) => {
                        debug!(
                            campaign_id = %campaign.id,
                            recipient = %state.leads[index].email,
                            not_before = %at,
                            "Send deferred by governor"
                        );
                        seq += 1;
                        deferred.push(Deferred {
                            ready_at: instant_at(at),
                            seq,
                            index,
                            job,
                        });
                    }
                }
            }

            if fresh.is_empty() && deferred.is_empty() && workers.is_empty() {
                break;
            }

            let has_capacity = workers.len() < self.workers;
            let next_ready = deferred.peek().map(|d| d.ready_at);
            tokio::select! {
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Some(fatal) = self
                        .completed(campaign, state, &mut deferred, &mut seq, joined, false)
                        .await
                    {
                        halt = Some(Halt::Fatal(fatal));
                    }
                }
                _ = sleep_until_opt(next_ready), if has_capacity && next_ready.is_some() => {}
                _ = sleep_until_opt(deadline), if deadline.is_some() => {}
                _ = cancel.notified() => {}
            }
        }

        // Drain: in-flight attempts finish, their retries are not rescheduled.
        while let Some(joined) = workers.join_next().await {
            if let Some(fatal) = self
                .completed(campaign, state, &mut deferred, &mut seq, joined, true)
                .await
                && halt.is_none()
            {
                halt = Some(Halt::Fatal(fatal));
            }
        }

        let detail = halt.as_ref().map(Halt::detail).unwrap_or_default();
        let waiting: Vec<(usize, u32)> = deferred
            .into_iter()
            .map(|d| (d.index, d.job.attempts))
            .chain(fresh.into_iter().map(|i| (i, 0)))
            .collect();
        for (index, attempts) in waiting {
            let lead = &state.leads[index];
            let mut outcome = RecipientOutcome::new(campaign.id, lead.id, &lead.email, Outcome::Aborted);
            outcome.attempts = attempts;
            outcome.detail = Some(detail.clone());
            self.finish(state, index, outcome).await;
        }

        halt
    }

    /// Handle one finished worker. Returns the error when it was campaign-fatal.
    async fn completed(
        &self,
        campaign: &Campaign,
        state: &mut RunState,
        deferred: &mut BinaryHeap<Deferred>,
        seq: &mut u64,
        joined: Result<WorkerResult, tokio::task::JoinError>,
        draining: bool,
    ) -> Option<TransportError> {
        // Workers are never aborted, so a join error cannot be tied to a recipient.
        let (index, job, step) = match joined {
            Ok(result) => result,
            Err(e) => {
                error!(campaign_id = %campaign.id, error = %e, "Dispatch task failed to join");
                return None;
            }
        };

        let lead = &state.leads[index];
        let Some(step) = step else {
            error!(campaign_id = %campaign.id, recipient = %lead.email, "Dispatch attempt panicked");
            let mut outcome = RecipientOutcome::new(campaign.id, lead.id, &lead.email, Outcome::Failed);
            outcome.attempts = job.attempts;
            outcome.detail = Some("dispatch attempt panicked".into());
            self.finish(state, index, outcome).await;
            return None;
        };

        match step {
            Step::Sent(receipt) => {
                let mut outcome = RecipientOutcome::new(campaign.id, lead.id, &lead.email, Outcome::Sent);
                outcome.attempts = job.attempts;
                outcome.provider_message_id = Some(receipt.provider_message_id);
                outcome.tracking_token = state.tracking_tokens[index].clone();
                outcome.completed_at = receipt.accepted_at;
                self.finish(state, index, outcome).await;
                None
            }
            Step::Failed(e) => {
                let outcome = failed_outcome(campaign.id, lead, job.attempts, &e);
                self.finish(state, index, outcome).await;
                None
            }
            Step::Fatal(e) => {
                warn!(
                    campaign_id = %campaign.id,
                    recipient = %lead.email,
                    error = %e,
                    "Campaign-fatal transport error"
                );
                let outcome = failed_outcome(campaign.id, lead, job.attempts, &e);
                self.finish(state, index, outcome).await;
                Some(e)
            }
            Step::RetryAfter(delay) if !draining => {
                *seq += 1;
                deferred.push(Deferred {
                    ready_at: Instant::now() + delay,
                    seq: *seq,
                    index,
                    job,
                });
                None
            }
            Step::RetryAfter(_) => {
                let mut outcome = RecipientOutcome::new(campaign.id, lead.id, &lead.email, Outcome::Aborted);
                outcome.attempts = job.attempts;
                outcome.error_class = job.last_error.as_ref().map(|e| e.class);
                outcome.detail = Some("retry pending when campaign stopped".into());
                self.finish(state, index, outcome).await;
                None
            }
        }
    }

    /// Suppression check against the tenant list, the lead's own status and
    /// the campaign's excluded domains.
    async fn suppressed(
        &self,
        campaign: &Campaign,
        excluded: &SuppressionSet,
        state: &RunState,
        index: usize,
    ) -> Option<RecipientOutcome> {
        let lead = &state.leads[index];

        let detail = if lead.status == LeadStatus::Unsubscribed {
            "lead unsubscribed".to_string()
        } else {
            let decision = match self.suppressions.check(&campaign.tenant_id, &lead.email).await {
                SuppressionDecision::Allow => excluded.check(&lead.email),
                deny => deny,
            };
            match decision {
                SuppressionDecision::Deny { pattern, reason } => format!("{reason} ({pattern})"),
                SuppressionDecision::Allow => return None,
            }
        };

        debug!(campaign_id = %campaign.id, recipient = %lead.email, %detail, "Recipient suppressed");
        let mut outcome = RecipientOutcome::new(campaign.id, lead.id, &lead.email, Outcome::Suppressed);
        outcome.detail = Some(detail);
        Some(outcome)
    }

    /// Render the message for one recipient.
    fn prepare(
        &self,
        campaign: &Campaign,
        route: &Route,
        state: &mut RunState,
        index: usize,
    ) -> Result<DeliveryJob, TransportError> {
        let lead = &state.leads[index];
        let tracking = self.tracking_base_url.is_some() && (route.track_opens || route.track_clicks);
        let token = tracking.then(|| Uuid::new_v4().simple().to_string());

        let options = RenderOptions {
            utm: campaign.settings.utm.clone(),
            unsubscribe_footer: route.unsubscribe_footer.clone(),
            tracking_base_url: self.tracking_base_url.clone(),
            tracking_token: token.clone(),
            track_opens: route.track_opens,
            track_clicks: route.track_clicks,
        };
        let rendered = render(&campaign.subject, &campaign.body, lead, &options)?;

        let mut headers = campaign.settings.headers.clone();
        headers.insert("X-Campaign-ID".to_string(), campaign.id.to_string());

        let message = OutboundMessage {
            campaign_id: campaign.id,
            lead_id: lead.id,
            message_id: format!("{}@{}", Uuid::new_v4().simple(), route.sender_domain),
            to: lead.email.clone(),
            to_name: Some(lead.name.clone()).filter(|n| !n.is_empty()),
            subject: rendered.subject,
            html_body: rendered.html_body,
            text_body: rendered.text_body,
            headers,
            attachments: campaign.settings.attachments.clone(),
        };
        state.tracking_tokens[index] = token;
        Ok(DeliveryJob::new(message))
    }

    /// Record a terminal outcome: database, lead status, counters, metrics.
    async fn finish(&self, state: &mut RunState, index: usize, outcome: RecipientOutcome) {
        if state.outcomes[index].is_some() {
            warn!(campaign_id = %state.campaign_id, index, "Recipient already has an outcome");
            return;
        }

        if let Err(e) = self.db.upsert_recipient_outcome(&outcome).await {
            error!(
                campaign_id = %outcome.campaign_id,
                lead_id = %outcome.lead_id,
                error = %e,
                "Failed to store recipient outcome"
            );
        }

        let lead = &state.leads[index];
        let new_status = match (outcome.outcome, outcome.error_class) {
            (Outcome::Sent, _) if lead.status == LeadStatus::New => Some(LeadStatus::Contacted),
            (Outcome::Failed, Some(ErrorClass::PermanentRejection)) => Some(LeadStatus::Bounced),
            _ => None,
        };
        if let Some(status) = new_status
            && let Err(e) = self.db.update_lead_status(lead.id, status).await
        {
            error!(lead_id = %lead.id, error = %e, "Failed to update lead status");
        }

        self.metrics
            .recipient(
                outcome.campaign_id,
                outcome.lead_id,
                &outcome.email,
                outcome.outcome,
                outcome.attempts,
            )
            .await;
        state.counts.record(outcome.outcome);
        state.outcomes[index] = Some(outcome);
    }
}

fn failed_outcome(campaign_id: Uuid, lead: &Lead, attempts: u32, err: &TransportError) -> RecipientOutcome {
    let mut outcome = RecipientOutcome::new(campaign_id, lead.id, &lead.email, Outcome::Failed);
    outcome.attempts = attempts;
    outcome.error_class = Some(err.class);
    outcome.detail = Some(err.message.clone());
    outcome
}

fn instant_at(at: DateTime<Utc>) -> Instant {
    let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    Instant::now() + wait
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
