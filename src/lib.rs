//! LeadAI — outbound email campaign service.

pub mod api;
pub mod campaigns;
pub mod compose;
pub mod config;
pub mod error;
pub mod leads;
pub mod pipeline;
pub mod store;
pub mod transport;
