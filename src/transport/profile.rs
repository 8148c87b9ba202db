//! Transport profiles: where and as whom campaign mail is sent.
//!
//! Profiles come from a JSON file (`LEADAI_PROFILES_PATH`) or, for a single
//! sender, from `SMTP_*` environment variables.

use std::path::Path;
use std::str::FromStr;

use secrecy::SecretString;
use serde::Deserialize;

use crate::campaigns::RateLimit;
use crate::error::ConfigError;

/// Default profile id when configured from the environment.
pub const DEFAULT_PROFILE_ID: &str = "default";

/// Google's OAuth2 token endpoint, used when a profile names none.
pub const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Connection security.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    /// Implicit TLS (SMTPS).
    Tls,
    #[default]
    Starttls,
    /// No encryption. Local relays and tests only.
    Plain,
}

impl Security {
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Tls => 465,
            Self::Starttls => 587,
            Self::Plain => 25,
        }
    }
}

impl FromStr for Security {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "tls" | "ssl" | "smtps" => Ok(Self::Tls),
            "starttls" => Ok(Self::Starttls),
            "plain" | "none" => Ok(Self::Plain),
            other => Err(format!("unknown SMTP security mode: {other}")),
        }
    }
}

/// How the profile authenticates.
#[derive(Debug, Clone)]
pub enum SmtpAuth {
    None,
    Password {
        username: String,
        password: SecretString,
    },
    /// XOAUTH2 with an access token obtained from a refresh token.
    OAuth2 {
        username: String,
        client_id: String,
        client_secret: SecretString,
        refresh_token: SecretString,
        token_url: String,
    },
}

/// A configured sender.
#[derive(Debug, Clone)]
pub struct TransportProfile {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub security: Security,
    pub auth: SmtpAuth,
    pub from_address: String,
    pub from_name: Option<String>,
    pub reply_to: Option<String>,
    /// Profile-wide rate limit; a campaign's own limit takes precedence.
    pub rate_limit: Option<RateLimit>,
    /// Warm-up cap: sends per day.
    pub daily_cap: Option<u32>,
    /// HTML appended to every message body.
    pub unsubscribe_footer: Option<String>,
    pub track_opens: bool,
    pub track_clicks: bool,
    pub timeout_secs: u64,
}

impl TransportProfile {
    /// Reject profiles that could never send.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::InvalidValue {
            key: format!("profile {}", self.id),
            message,
        };

        if self.id.trim().is_empty() {
            return Err(invalid("profile id is empty".into()));
        }
        if self.host.trim().is_empty() {
            return Err(invalid("SMTP host is empty".into()));
        }
        if self.from_address.parse::<lettre::Address>().is_err() {
            return Err(invalid(format!(
                "invalid from address: {}",
                self.from_address
            )));
        }
        if let Some(reply_to) = &self.reply_to
            && reply_to.parse::<lettre::Address>().is_err()
        {
            return Err(invalid(format!("invalid reply-to address: {reply_to}")));
        }
        if let Some(rate) = &self.rate_limit
            && rate.max_messages == 0
        {
            return Err(invalid("rate limit must allow at least one message".into()));
        }
        Ok(())
    }

    /// Single profile from `SMTP_*` variables. `None` if `SMTP_HOST` is unset.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Ok(host) = std::env::var("SMTP_HOST") else {
            return Ok(None);
        };

        let security: Security = match std::env::var("SMTP_SECURITY") {
            Ok(s) => s.parse().map_err(|message| ConfigError::InvalidValue {
                key: "SMTP_SECURITY".into(),
                message,
            })?,
            Err(_) => Security::default(),
        };

        let port: u16 = match std::env::var("SMTP_PORT") {
            Ok(s) => s.parse().map_err(|_| ConfigError::InvalidValue {
                key: "SMTP_PORT".into(),
                message: format!("not a port number: {s}"),
            })?,
            Err(_) => security.default_port(),
        };

        let username = std::env::var("SMTP_USERNAME").unwrap_or_default();
        let from_address =
            std::env::var("SMTP_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        let auth = match (
            std::env::var("SMTP_OAUTH_CLIENT_ID"),
            std::env::var("SMTP_OAUTH_REFRESH_TOKEN"),
        ) {
            (Ok(client_id), Ok(refresh_token)) => SmtpAuth::OAuth2 {
                username: username.clone(),
                client_id,
                client_secret: SecretString::from(
                    std::env::var("SMTP_OAUTH_CLIENT_SECRET").unwrap_or_default(),
                ),
                refresh_token: SecretString::from(refresh_token),
                token_url: std::env::var("SMTP_OAUTH_TOKEN_URL")
                    .unwrap_or_else(|_| DEFAULT_TOKEN_URL.to_string()),
            },
            _ => match std::env::var("SMTP_PASSWORD") {
                Ok(password) if !username.is_empty() => SmtpAuth::Password {
                    username: username.clone(),
                    password: SecretString::from(password),
                },
                _ => SmtpAuth::None,
            },
        };

        let profile = Self {
            id: DEFAULT_PROFILE_ID.to_string(),
            name: std::env::var("SMTP_FROM_NAME").unwrap_or_else(|_| "Default".to_string()),
            host,
            port,
            security,
            auth,
            from_address,
            from_name: std::env::var("SMTP_FROM_NAME").ok(),
            reply_to: std::env::var("SMTP_REPLY_TO").ok(),
            rate_limit: None,
            daily_cap: std::env::var("SMTP_DAILY_CAP")
                .ok()
                .and_then(|s| s.parse().ok()),
            unsubscribe_footer: std::env::var("SMTP_UNSUBSCRIBE_FOOTER").ok(),
            track_opens: true,
            track_clicks: true,
            timeout_secs: 30,
        };
        profile.validate()?;
        Ok(Some(profile))
    }
}

// ── Profiles file ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawAuth {
    None,
    Password {
        username: String,
        password: String,
    },
    Oauth2 {
        username: String,
        client_id: String,
        #[serde(default)]
        client_secret: String,
        refresh_token: String,
        #[serde(default)]
        token_url: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct RawProfile {
    id: String,
    #[serde(default)]
    name: Option<String>,
    host: String,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    security: Security,
    #[serde(default)]
    auth: Option<RawAuth>,
    from_address: String,
    #[serde(default)]
    from_name: Option<String>,
    #[serde(default)]
    reply_to: Option<String>,
    #[serde(default)]
    rate_limit_per_min: Option<u32>,
    #[serde(default)]
    daily_cap: Option<u32>,
    #[serde(default)]
    unsubscribe_footer: Option<String>,
    #[serde(default = "default_true")]
    track_opens: bool,
    #[serde(default = "default_true")]
    track_clicks: bool,
    #[serde(default = "default_timeout")]
    timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    30
}

impl From<RawProfile> for TransportProfile {
    fn from(raw: RawProfile) -> Self {
        let auth = match raw.auth {
            None | Some(RawAuth::None) => SmtpAuth::None,
            Some(RawAuth::Password { username, password }) => SmtpAuth::Password {
                username,
                password: SecretString::from(password),
            },
            Some(RawAuth::Oauth2 {
                username,
                client_id,
                client_secret,
                refresh_token,
                token_url,
            }) => SmtpAuth::OAuth2 {
                username,
                client_id,
                client_secret: SecretString::from(client_secret),
                refresh_token: SecretString::from(refresh_token),
                token_url: token_url.unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string()),
            },
        };

        Self {
            name: raw.name.unwrap_or_else(|| raw.id.clone()),
            id: raw.id,
            host: raw.host,
            port: raw.port.unwrap_or_else(|| raw.security.default_port()),
            security: raw.security,
            auth,
            from_address: raw.from_address,
            from_name: raw.from_name,
            reply_to: raw.reply_to,
            rate_limit: raw
                .rate_limit_per_min
                .filter(|n| *n > 0)
                .map(RateLimit::per_minute),
            daily_cap: raw.daily_cap,
            unsubscribe_footer: raw.unsubscribe_footer,
            track_opens: raw.track_opens,
            track_clicks: raw.track_clicks,
            timeout_secs: raw.timeout_secs,
        }
    }
}

/// Parse a JSON array of profiles.
pub fn parse_profiles(json: &str) -> Result<Vec<TransportProfile>, ConfigError> {
    let raw: Vec<RawProfile> = serde_json::from_str(json)
        .map_err(|e| ConfigError::ParseError(format!("profiles file: {e}")))?;

    let profiles: Vec<TransportProfile> = raw.into_iter().map(TransportProfile::from).collect();
    for (i, profile) in profiles.iter().enumerate() {
        profile.validate()?;
        if profiles[..i].iter().any(|p| p.id == profile.id) {
            return Err(ConfigError::InvalidValue {
                key: format!("profile {}", profile.id),
                message: "duplicate profile id".into(),
            });
        }
    }
    Ok(profiles)
}

/// Read and parse a profiles file.
pub fn load_profiles(path: &Path) -> Result<Vec<TransportProfile>, ConfigError> {
    let json = std::fs::read_to_string(path)?;
    parse_profiles(&json)
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::*;

    #[test]
    fn parses_password_and_oauth_profiles() {
        let json = r#"[
            {
                "id": "primary",
                "host": "smtp.example.com",
                "security": "tls",
                "auth": {"type": "password", "username": "u", "password": "p"},
                "from_address": "sales@example.com",
                "from_name": "Sales",
                "rate_limit_per_min": 30,
                "daily_cap": 200
            },
            {
                "id": "gmail",
                "host": "smtp.gmail.com",
                "auth": {"type": "oauth2", "username": "me@gmail.com", "client_id": "cid", "refresh_token": "rt"},
                "from_address": "me@gmail.com",
                "track_opens": false
            }
        ]"#;

        let profiles = parse_profiles(json).unwrap();
        assert_eq!(profiles.len(), 2);

        let primary = &profiles[0];
        assert_eq!(primary.port, 465);
        assert_eq!(primary.rate_limit, Some(RateLimit::per_minute(30)));
        assert_eq!(primary.daily_cap, Some(200));
        match &primary.auth {
            SmtpAuth::Password { password, .. } => assert_eq!(password.expose_secret(), "p"),
            other => panic!("Expected password auth, got {other:?}"),
        }

        let gmail = &profiles[1];
        assert_eq!(gmail.security, Security::Starttls);
        assert_eq!(gmail.port, 587);
        assert!(!gmail.track_opens);
        assert!(gmail.track_clicks);
        match &gmail.auth {
            SmtpAuth::OAuth2 { token_url, .. } => assert_eq!(token_url, DEFAULT_TOKEN_URL),
            other => panic!("Expected oauth2 auth, got {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_from_address() {
        let json = r#"[{"id": "x", "host": "h", "from_address": "nope"}]"#;
        assert!(matches!(
            parse_profiles(json),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let json = r#"[
            {"id": "x", "host": "h", "from_address": "a@x.com"},
            {"id": "x", "host": "h", "from_address": "b@x.com"}
        ]"#;
        assert!(parse_profiles(json).is_err());
    }

    #[test]
    fn security_parse_aliases() {
        assert_eq!("SSL".parse::<Security>().unwrap(), Security::Tls);
        assert_eq!("starttls".parse::<Security>().unwrap(), Security::Starttls);
        assert_eq!("none".parse::<Security>().unwrap(), Security::Plain);
        assert!("carrier-pigeon".parse::<Security>().is_err());
    }
}
