//! Outreach copy composition.
//!
//! `TextGenerator` is the seam a hosted model would plug into. The shipped
//! `TemplateComposer` assembles emails from tone-specific phrase banks.

use std::collections::HashSet;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::ComposeError;

/// Upper bound on subject options per request.
pub const MAX_SUBJECT_OPTIONS: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    #[default]
    Professional,
    Casual,
    Urgent,
}

impl Tone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Professional => "professional",
            Self::Casual => "casual",
            Self::Urgent => "urgent",
        }
    }

    fn bank(&self) -> &'static PhraseBank {
        match self {
            Self::Professional => &PROFESSIONAL,
            Self::Casual => &CASUAL,
            Self::Urgent => &URGENT,
        }
    }
}

impl FromStr for Tone {
    type Err = ComposeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "professional" => Ok(Self::Professional),
            "casual" => Ok(Self::Casual),
            "urgent" => Ok(Self::Urgent),
            other => Err(ComposeError::UnknownTone(other.to_string())),
        }
    }
}

/// What to write and for whom.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeRequest {
    #[serde(default)]
    pub tone: Tone,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub sender_name: Option<String>,
    /// Used verbatim as the body (after personalisation) when set.
    #[serde(default)]
    pub custom_message: Option<String>,
    /// Number of subject lines to suggest.
    #[serde(default = "default_subject_options")]
    pub subject_options: usize,
}

fn default_subject_options() -> usize {
    3
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComposedEmail {
    pub subject: String,
    pub body: String,
    /// Distinct alternatives, `subject` first.
    pub subject_options: Vec<String>,
    pub tone: Tone,
    pub generated_at: DateTime<Utc>,
}

/// Produces outreach copy.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, request: &ComposeRequest) -> Result<ComposedEmail, ComposeError>;
}

struct PhraseBank {
    subjects: &'static [&'static str],
    greetings: &'static [&'static str],
    intros: &'static [&'static str],
    bodies: &'static [&'static str],
    value_props: &'static [&'static str],
    ctas: &'static [&'static str],
    closings: &'static [&'static str],
}

static PROFESSIONAL: PhraseBank = PhraseBank {
    subjects: &[
        "A growth idea for {company}",
        "Partnership opportunity for {company}",
        "{company} and a faster pipeline",
        "Helping {company} scale outreach",
        "Quick introduction for {name}",
    ],
    greetings: &["Dear {name}", "Hello {name}", "Good day {name}"],
    intros: &[
        "I hope this note finds you well.",
        "I hope things are going well at {company}.",
        "Thank you for taking a moment to read this.",
    ],
    bodies: &[
        "I am reaching out because teams like {company} in {industry} often spend more time finding prospects than talking to them. We built a platform that turns that around.",
        "As {title} at {company}, you likely see how much effort goes into qualifying leads. Our platform automates most of that work.",
        "I have been following {company} and believe our approach to lead generation could support your next stage of growth.",
    ],
    value_props: &[
        "Customers typically double their qualified meetings within a quarter.",
        "Most teams recover several hours per rep every week.",
        "Our clients report a clear return on investment within the first few months.",
    ],
    ctas: &[
        "Would you be open to a 15-minute call next week?",
        "Could we find a short slot to walk through how this would work for {company}?",
        "If it is useful, I can send over a brief case study.",
    ],
    closings: &["Best regards", "Kind regards", "Sincerely"],
};

static CASUAL: PhraseBank = PhraseBank {
    subjects: &[
        "Quick question, {name}",
        "Idea for {company}",
        "Worth a look?",
        "Saw what {company} is building",
        "Coffee chat?",
    ],
    greetings: &["Hi {name}", "Hey {name}", "Hi there {name}"],
    intros: &[
        "Hope your week is going well!",
        "Hope all is good over at {company}!",
        "Hope you're having a good one!",
    ],
    bodies: &[
        "I came across {company} and really liked what you're doing. I think we have something that could save your team a lot of busywork.",
        "Been keeping an eye on {company} for a while. We help teams in {industry} find and reach the right people without the spreadsheet juggling.",
        "Figured I'd reach out since we've been helping folks in roles like {title} get way more out of their outreach.",
    ],
    value_props: &[
        "People tell us it pays for itself pretty quickly.",
        "Most teams see results in the first couple of weeks.",
        "It's honestly made prospecting fun again for a lot of our users.",
    ],
    ctas: &[
        "Up for a quick 10-minute chat?",
        "Want me to send over a short demo video?",
        "Got time for a virtual coffee this week?",
    ],
    closings: &["Cheers", "Talk soon", "Thanks!"],
};

static URGENT: PhraseBank = PhraseBank {
    subjects: &[
        "Time-sensitive: {company} opportunity",
        "Closing soon: offer for {company}",
        "Action needed this week, {name}",
        "Last chance for {company}",
        "Deadline approaching for {company}",
    ],
    greetings: &["Dear {name}", "Hello {name}", "Hi {name}"],
    intros: &[
        "I wanted to reach you before this window closes.",
        "This is time-sensitive, so I am writing directly.",
        "I have something that needs a quick decision from {company}.",
    ],
    bodies: &[
        "We are opening a limited number of onboarding slots this month for companies in {industry}, and {company} is a strong fit.",
        "Our launch pricing ends at the end of this week, and I wanted {company} to have the chance to lock it in.",
        "We can only take on a few more teams this quarter, and I think {company} would benefit the most.",
    ],
    value_props: &[
        "The current terms will not be offered again.",
        "Only a handful of slots remain.",
        "Teams that joined last quarter are already seeing results.",
    ],
    ctas: &[
        "Please reply today if you would like to reserve a slot.",
        "Can we speak before Friday?",
        "Let me know by end of week and I will hold a place for {company}.",
    ],
    closings: &["Best regards", "Regards", "Thank you"],
};

/// Phrase-bank composer.
#[derive(Debug, Clone)]
pub struct TemplateComposer {
    default_sender: String,
}

impl Default for TemplateComposer {
    fn default() -> Self {
        Self::new("The LeadAI Team")
    }
}

impl TemplateComposer {
    pub fn new(default_sender: impl Into<String>) -> Self {
        Self {
            default_sender: default_sender.into(),
        }
    }

    /// Compose with a caller-supplied RNG.
    pub fn compose_with<R: Rng + ?Sized>(&self, request: &ComposeRequest, rng: &mut R) -> ComposedEmail {
        let bank = request.tone.bank();
        let fill = |template: &str| personalize(template, request);

        let body = match request.custom_message.as_deref().filter(|m| !m.trim().is_empty()) {
            Some(custom) => fill(custom),
            None => {
                let sender = request
                    .sender_name
                    .as_deref()
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or(&self.default_sender);
                format!(
                    "{},\n\n{}\n\n{}\n\n{}\n\n{}\n\n{},\n{}",
                    fill(pick(bank.greetings, rng)),
                    fill(pick(bank.intros, rng)),
                    fill(pick(bank.bodies, rng)),
                    fill(pick(bank.value_props, rng)),
                    fill(pick(bank.ctas, rng)),
                    pick(bank.closings, rng),
                    sender
                )
            }
        };

        let subject_options = self.subjects_with(request, request.subject_options.max(1), rng);
        let subject = subject_options
            .first()
            .cloned()
            .unwrap_or_else(|| fill(pick(bank.subjects, rng)));

        ComposedEmail {
            subject,
            body,
            subject_options,
            tone: request.tone,
            generated_at: Utc::now(),
        }
    }

    /// Up to `count` distinct subject lines in random order.
    pub fn subjects_with<R: Rng + ?Sized>(&self, request: &ComposeRequest, count: usize, rng: &mut R) -> Vec<String> {
        let count = count.min(MAX_SUBJECT_OPTIONS);
        let mut seen = HashSet::new();
        let mut templates: Vec<&str> = request.tone.bank().subjects.to_vec();
        templates.shuffle(rng);
        templates
            .into_iter()
            .map(|t| personalize(t, request))
            .filter(|s| seen.insert(s.clone()))
            .take(count)
            .collect()
    }

    /// Several independent drafts for the same lead.
    pub fn variations(&self, request: &ComposeRequest, count: usize) -> Vec<ComposedEmail> {
        let mut rng = rand::thread_rng();
        (0..count.min(MAX_SUBJECT_OPTIONS))
            .map(|_| self.compose_with(request, &mut rng))
            .collect()
    }
}

#[async_trait]
impl TextGenerator for TemplateComposer {
    fn name(&self) -> &str {
        "template"
    }

    async fn generate(&self, request: &ComposeRequest) -> Result<ComposedEmail, ComposeError> {
        let mut rng = rand::thread_rng();
        Ok(self.compose_with(request, &mut rng))
    }
}

fn pick<'a, R: Rng + ?Sized>(options: &'a [&'a str], rng: &mut R) -> &'a str {
    options.choose(rng).copied().unwrap_or_default()
}

fn personalize(template: &str, request: &ComposeRequest) -> String {
    let value = |v: &Option<String>, fallback: &'static str| -> String {
        v.as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(fallback)
            .to_string()
    };
    template
        .replace("{name}", &value(&request.name, "there"))
        .replace("{company}", &value(&request.company, "your company"))
        .replace("{title}", &value(&request.title, "a leader"))
        .replace("{industry}", &value(&request.industry, "your industry"))
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    fn request(tone: Tone) -> ComposeRequest {
        ComposeRequest {
            tone,
            name: Some("Dana".into()),
            company: Some("Globex".into()),
            title: Some("VP Sales".into()),
            industry: Some("logistics".into()),
            sender_name: Some("Sam".into()),
            custom_message: None,
            subject_options: 3,
        }
    }

    #[test]
    fn tone_parses_case_insensitively() {
        assert_eq!("Casual".parse::<Tone>().unwrap(), Tone::Casual);
        assert!(matches!("shouty".parse::<Tone>(), Err(ComposeError::UnknownTone(_))));
    }

    #[test]
    fn body_is_personalised_and_signed() {
        let composer = TemplateComposer::default();
        let mut rng = StdRng::seed_from_u64(7);
        for tone in [Tone::Professional, Tone::Casual, Tone::Urgent] {
            let email = composer.compose_with(&request(tone), &mut rng);
            assert!(email.body.contains("Dana"));
            assert!(email.body.ends_with("Sam"));
            assert!(!email.body.contains('{'));
            assert!(!email.subject.contains('{'));
            assert_eq!(email.tone, tone);
        }
    }

    #[test]
    fn subject_options_are_distinct_and_bounded() {
        let composer = TemplateComposer::default();
        let mut rng = StdRng::seed_from_u64(1);
        let subjects = composer.subjects_with(&request(Tone::Urgent), 50, &mut rng);
        assert_eq!(subjects.len(), 5);
        let unique: HashSet<_> = subjects.iter().collect();
        assert_eq!(unique.len(), subjects.len());
    }

    #[test]
    fn custom_message_wins() {
        let composer = TemplateComposer::default();
        let mut req = request(Tone::Casual);
        req.custom_message = Some("Hi {name}, saw {company} at the expo.".into());
        let email = composer.compose_with(&req, &mut StdRng::seed_from_u64(3));
        assert_eq!(email.body, "Hi Dana, saw Globex at the expo.");
    }

    #[test]
    fn missing_fields_use_fallbacks() {
        let composer = TemplateComposer::default();
        let req = ComposeRequest::default();
        let email = composer.compose_with(&req, &mut StdRng::seed_from_u64(9));
        assert!(email.body.ends_with("The LeadAI Team"));
        assert!(!email.body.contains('{'));
    }

    #[tokio::test]
    async fn generator_trait() {
        let composer = TemplateComposer::default();
        let email = composer.generate(&request(Tone::Professional)).await.unwrap();
        assert_eq!(email.subject_options.len(), 3);
        assert_eq!(email.subject, email.subject_options[0]);
        assert_eq!(composer.variations(&request(Tone::Casual), 2).len(), 2);
    }
}
