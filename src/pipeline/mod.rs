//! Outbound send pipeline.
//!
//! Every recipient of a campaign flows through:
//! 1. `SuppressionList::check()`: tenant list plus campaign exclusions
//! 2. `Governor::request()`: send window, warm-up cap, rate limit
//! 3. `RetryController::attempt()`: one `Dispatcher::dispatch()` per call,
//!    with backoff between attempts
//!
//! `CampaignRunner` drives one campaign through these stages;
//! `CampaignEngine` owns lifecycle, scheduling and cancellation.

pub mod dispatcher;
pub mod engine;
pub mod governor;
pub mod metrics;
pub mod orchestrator;
pub mod render;
pub mod retry;
pub mod suppression;

pub use dispatcher::{DeliveryReceipt, Dispatcher, OutboundMessage, StubTransport, Transport};
pub use engine::{CampaignEngine, RunHandle, spawn_ticker};
pub use governor::{Clearance, Governor, GovernorRules};
pub use metrics::{MetricsEvent, MetricsHub, MetricsSnapshot, TrackingKind};
pub use orchestrator::{CampaignRunner, CancelHandle, Route};
pub use retry::{RetryController, RetryPolicy, Step};
pub use suppression::{SuppressionDecision, SuppressionEntry, SuppressionList};
