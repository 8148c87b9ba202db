//! Mail transports: profile configuration and the SMTP implementation.

pub mod oauth;
pub mod profile;
pub mod smtp;

pub use oauth::TokenSource;
pub use profile::{DEFAULT_PROFILE_ID, Security, SmtpAuth, TransportProfile, load_profiles, parse_profiles};
pub use smtp::SmtpMailer;
