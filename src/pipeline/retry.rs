//! Retry/backoff controller.
//!
//! Each call to [`RetryController::attempt`] performs one dispatch, appends
//! one `SendAttempt` and tells the caller what to do next. Waiting between
//! attempts is the caller's job, so no worker is held while backing off.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error};
use uuid::Uuid;

use crate::campaigns::{AttemptOutcome, SendAttempt};
use crate::error::TransportError;
use crate::pipeline::dispatcher::{DeliveryReceipt, Dispatcher, OutboundMessage};
use crate::store::Database;

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(600),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `n + 1`, after `n` failed attempts (`n >= 1`).
    ///
    /// `min(base * multiplier^(n-1), max)`: non-decreasing and capped.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let secs = self.base_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// What the caller should do after an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Sent(DeliveryReceipt),
    /// Re-submit after this delay.
    RetryAfter(Duration),
    /// Terminal failure for this recipient.
    Failed(TransportError),
    /// Terminal failure that halts the whole campaign.
    Fatal(TransportError),
}

/// Per-recipient delivery state carried between attempts.
#[derive(Debug, Clone)]
pub struct DeliveryJob {
    pub message: OutboundMessage,
    /// Attempts made so far.
    pub attempts: u32,
    pub last_error: Option<TransportError>,
}

impl DeliveryJob {
    pub fn new(message: OutboundMessage) -> Self {
        Self {
            message,
            attempts: 0,
            last_error: None,
        }
    }
}

/// Drives single attempts and records them.
#[derive(Clone)]
pub struct RetryController {
    dispatcher: Arc<Dispatcher>,
    db: Arc<dyn Database>,
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(dispatcher: Arc<Dispatcher>, db: Arc<dyn Database>, policy: RetryPolicy) -> Self {
        Self {
            dispatcher,
            db,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run one attempt for `job`.
    pub async fn attempt(&self, job: &mut DeliveryJob) -> Step {
        let max_attempts = self.policy.max_attempts.max(1);
        if job.attempts >= max_attempts {
            let err = job
                .last_error
                .clone()
                .unwrap_or_else(|| TransportError::validation("attempt limit reached"));
            return Step::Failed(err);
        }

        job.attempts += 1;
        let attempted_at = Utc::now();
        let result = self.dispatcher.dispatch(&job.message).await;

        let (step, record) = match result {
            Ok(receipt) => {
                job.last_error = None;
                let record = self.record(job, attempted_at, AttemptOutcome::Sent, None);
                let record = SendAttempt {
                    provider_message_id: Some(receipt.provider_message_id.clone()),
                    ..record
                };
                (Step::Sent(receipt), record)
            }
            Err(err) => {
                job.last_error = Some(err.clone());
                if err.class.is_campaign_fatal() {
                    let record = self.record(job, attempted_at, AttemptOutcome::Failed, Some(&err));
                    (Step::Fatal(err), record)
                } else if err.is_retryable() && job.attempts < max_attempts {
                    let delay = self.policy.delay_after(job.attempts);
                    debug!(
                        recipient = %job.message.to,
                        attempt = job.attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Scheduling retry"
                    );
                    let record = self.record(job, attempted_at, AttemptOutcome::Retrying, Some(&err));
                    (Step::RetryAfter(delay), record)
                } else {
                    let record = self.record(job, attempted_at, AttemptOutcome::Failed, Some(&err));
                    (Step::Failed(err), record)
                }
            }
        };

        if let Err(e) = self.db.append_send_attempt(&record).await {
            error!(
                campaign_id = %record.campaign_id,
                lead_id = %record.lead_id,
                error = %e,
                "Failed to record send attempt"
            );
        }
        step
    }

    fn record(
        &self,
        job: &DeliveryJob,
        attempted_at: chrono::DateTime<Utc>,
        outcome: AttemptOutcome,
        err: Option<&TransportError>,
    ) -> SendAttempt {
        SendAttempt {
            id: Uuid::new_v4(),
            campaign_id: job.message.campaign_id,
            lead_id: job.message.lead_id,
            attempt: job.attempts,
            attempted_at,
            outcome,
            error_class: err.map(|e| e.class),
            error_message: err.map(|e| e.message.clone()),
            provider_message_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaigns::Campaign;
    use crate::error::ErrorClass;
    use crate::pipeline::dispatcher::{StubTransport, test_message};
    use crate::store::LibSqlBackend;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    async fn setup(
        stub: StubTransport,
        policy: RetryPolicy,
    ) -> (RetryController, Arc<StubTransport>, Arc<LibSqlBackend>, DeliveryJob) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let campaign = Campaign::new("t", "c", "s", "b");
        db.insert_campaign(&campaign).await.unwrap();

        let stub = Arc::new(stub);
        let controller =
            RetryController::new(Arc::new(Dispatcher::new(stub.clone())), db.clone(), policy);
        let mut message = test_message("a@x.com");
        message.campaign_id = campaign.id;
        (controller, stub, db, DeliveryJob::new(message))
    }

    #[test]
    fn default_policy() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_attempts, 5);
        assert_eq!(p.delay_after(1), Duration::from_secs(10));
        assert_eq!(p.delay_after(2), Duration::from_secs(20));
        assert_eq!(p.delay_after(3), Duration::from_secs(40));
    }

    #[test]
    fn backoff_is_monotone_and_capped() {
        let p = RetryPolicy::default();
        let mut previous = Duration::ZERO;
        for n in 1..=64 {
            let d = p.delay_after(n);
            assert!(d >= previous, "delay decreased at attempt {n}");
            assert!(d <= p.max_delay);
            previous = d;
        }
        assert_eq!(p.delay_after(64), p.max_delay);
        assert_eq!(p.delay_after(u32::MAX), p.max_delay);
    }

    #[tokio::test]
    async fn always_transient_stops_at_cap() {
        let (controller, stub, db, mut job) = setup(
            StubTransport::failing(TransportError::transient("451 busy")),
            fast_policy(3),
        )
        .await;

        let mut steps = Vec::new();
        loop {
            let step = controller.attempt(&mut job).await;
            let done = !matches!(step, Step::RetryAfter(_));
            steps.push(step);
            if done {
                break;
            }
        }

        assert_eq!(steps.len(), 3);
        assert!(matches!(steps.last(), Some(Step::Failed(e)) if e.class == ErrorClass::TransientRejection));
        assert_eq!(stub.calls(), 3);

        let attempts = db.list_send_attempts(job.message.campaign_id).await.unwrap();
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[0].outcome, AttemptOutcome::Retrying);
        assert_eq!(attempts[2].outcome, AttemptOutcome::Failed);
        assert_eq!(attempts[2].attempt, 3);

        // Past the cap nothing is dispatched.
        assert!(matches!(controller.attempt(&mut job).await, Step::Failed(_)));
        assert_eq!(stub.calls(), 3);
    }

    #[tokio::test]
    async fn success_after_retry_records_both_attempts() {
        let stub = StubTransport::accepting()
            .script("a@x.com", vec![Err(TransportError::network("reset"))]);
        let (controller, _stub, db, mut job) = setup(stub, fast_policy(5)).await;

        assert!(matches!(controller.attempt(&mut job).await, Step::RetryAfter(_)));
        assert!(matches!(controller.attempt(&mut job).await, Step::Sent(_)));

        let attempts = db.list_send_attempts(job.message.campaign_id).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1].outcome, AttemptOutcome::Sent);
        assert_eq!(
            attempts[1].provider_message_id.as_deref(),
            Some(job.message.message_id.as_str())
        );
    }

    #[tokio::test]
    async fn permanent_rejection_is_not_retried() {
        let (controller, stub, _db, mut job) = setup(
            StubTransport::failing(TransportError::permanent("550 no such user")),
            fast_policy(5),
        )
        .await;
        assert!(matches!(controller.attempt(&mut job).await, Step::Failed(_)));
        assert_eq!(stub.calls(), 1);
    }

    #[tokio::test]
    async fn auth_error_is_fatal() {
        let (controller, _stub, db, mut job) = setup(
            StubTransport::failing(TransportError::auth("535 bad credentials")),
            fast_policy(5),
        )
        .await;
        assert!(matches!(controller.attempt(&mut job).await, Step::Fatal(_)));
        let attempts = db.list_send_attempts(job.message.campaign_id).await.unwrap();
        assert_eq!(attempts[0].error_class, Some(ErrorClass::Auth));
    }
}
