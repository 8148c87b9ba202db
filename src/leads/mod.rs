//! Leads — the contacts campaigns are sent to.

pub mod export;
pub mod import;
pub mod model;

pub use export::write_leads_csv;
pub use import::{ImportReport, import_leads, parse_leads};
pub use model::{Lead, LeadSelector, LeadStatus};
