//! Per-recipient message rendering.
//!
//! Substitutes lead fields into the campaign templates, sanitises the
//! subject and body, tags links with UTM parameters, and adds the
//! unsubscribe footer and tracking pixel when enabled.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use reqwest::Url;

use crate::error::TransportError;
use crate::leads::Lead;

/// Longest subject we hand to the transport.
pub const MAX_SUBJECT_CHARS: usize = 200;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());
static SCRIPT_OR_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>|<style\b[^>]*>.*?</style\s*>").unwrap()
});
static HREF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)href\s*=\s*"(https?://[^"]+)""#).unwrap());
static BODY_END: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)</body\s*>").unwrap());
static BLOCK_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>|</p\s*>|</div\s*>|</li\s*>|</h[1-6]\s*>").unwrap());

/// Per-send rendering switches.
#[derive(Debug, Clone, Default)]
pub struct RenderOptions {
    pub utm: BTreeMap<String, String>,
    pub unsubscribe_footer: Option<String>,
    /// Public base URL of the tracking endpoints; tracking is off without it.
    pub tracking_base_url: Option<String>,
    pub tracking_token: Option<String>,
    pub track_opens: bool,
    pub track_clicks: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
}

/// Render a campaign's templates for one lead.
pub fn render(
    subject_template: &str,
    body_template: &str,
    lead: &Lead,
    options: &RenderOptions,
) -> Result<RenderedMessage, TransportError> {
    let subject = sanitize_subject(&substitute(subject_template, lead, false));
    if subject.is_empty() {
        return Err(TransportError::validation("subject renders empty"));
    }

    let body = substitute(&sanitize_html(body_template), lead, true);
    if body.trim().is_empty() {
        return Err(TransportError::validation("body renders empty"));
    }

    let tracking = match (&options.tracking_base_url, &options.tracking_token) {
        (Some(base), Some(token)) => Some((base.trim_end_matches('/'), token.as_str())),
        _ => None,
    };

    let click_base = tracking.filter(|_| options.track_clicks);
    let mut html = rewrite_links(&body, &options.utm, click_base);

    if let Some(footer) = &options.unsubscribe_footer {
        let footer = substitute(footer, lead, true);
        html = insert_before_body_end(&html, &format!("\n<div class=\"unsubscribe\">{footer}</div>"));
    }

    let text_body = html_to_text(&html);

    if let Some((base, token)) = tracking.filter(|_| options.track_opens) {
        let pixel = format!(
            "<img src=\"{base}/t/open/{token}\" width=\"1\" height=\"1\" alt=\"\" style=\"display:none\" />"
        );
        html = insert_before_body_end(&html, &pixel);
    }

    Ok(RenderedMessage {
        subject,
        html_body: html,
        text_body,
    })
}

/// Replace `{field}` placeholders; unknown names are left as written.
pub fn substitute(template: &str, lead: &Lead, escape: bool) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            let key = &caps[1];
            let value = match key {
                "name" => Some(lead.name.clone()),
                "first_name" => lead.name.split_whitespace().next().map(str::to_string),
                "company" => Some(lead.company.clone()),
                "email" => Some(lead.email.clone()),
                "category" => Some(lead.category.clone()),
                other => lead.attribute(other).map(str::to_string),
            };
            match value {
                Some(v) if escape => escape_html(&v),
                Some(v) => v,
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// CR/LF become spaces, other control characters are dropped, length capped.
pub fn sanitize_subject(subject: &str) -> String {
    let cleaned: String = subject
        .chars()
        .filter_map(|c| match c {
            '\r' | '\n' => Some(' '),
            c if c.is_control() => None,
            c => Some(c),
        })
        .collect();
    cleaned.trim().chars().take(MAX_SUBJECT_CHARS).collect::<String>().trim_end().to_string()
}

/// Remove `<script>` and `<style>` elements with their content.
pub fn sanitize_html(html: &str) -> String {
    SCRIPT_OR_STYLE.replace_all(html, "").into_owned()
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

/// Add UTM parameters to absolute links, then route them through the click
/// tracker when `click_base` is set.
fn rewrite_links(
    html: &str,
    utm: &BTreeMap<String, String>,
    click_base: Option<(&str, &str)>,
) -> String {
    if utm.is_empty() && click_base.is_none() {
        return html.to_string();
    }
    HREF.replace_all(html, |caps: &Captures| {
        let original = caps[1].replace("&amp;", "&");
        let tagged = tag_utm(&original, utm);
        let target = match click_base {
            Some((base, token)) => {
                match Url::parse_with_params(&format!("{base}/t/click/{token}"), &[("url", &tagged)]) {
                    Ok(url) => url.to_string(),
                    Err(_) => tagged,
                }
            }
            None => tagged,
        };
        format!("href=\"{}\"", target.replace('&', "&amp;"))
    })
    .into_owned()
}

/// Append UTM parameters the link does not already carry.
pub fn tag_utm(link: &str, utm: &BTreeMap<String, String>) -> String {
    if utm.is_empty() {
        return link.to_string();
    }
    let Ok(mut url) = Url::parse(link) else {
        return link.to_string();
    };
    if !matches!(url.scheme(), "http" | "https") {
        return link.to_string();
    }
    let existing: Vec<String> = url.query_pairs().map(|(k, _)| k.into_owned()).collect();
    let missing: Vec<(&String, &String)> = utm
        .iter()
        .filter(|(k, _)| !existing.iter().any(|e| e == *k))
        .collect();
    if missing.is_empty() {
        return link.to_string();
    }
    {
        let mut pairs = url.query_pairs_mut();
        for (k, v) in missing {
            pairs.append_pair(k, v);
        }
    }
    url.to_string()
}

fn insert_before_body_end(html: &str, snippet: &str) -> String {
    match BODY_END.find_iter(html).last() {
        Some(m) => format!("{}{}{}", &html[..m.start()], snippet, &html[m.start()..]),
        None => format!("{html}{snippet}"),
    }
}

/// Plain-text alternative: block breaks become newlines, tags are dropped.
pub fn html_to_text(html: &str) -> String {
    let sanitized = sanitize_html(html);
    let with_breaks = BLOCK_BREAK.replace_all(&sanitized, "\n");
    let mut text = String::new();
    let mut in_tag = false;
    for ch in with_breaks.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => text.push(ch),
            _ => {}
        }
    }
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&");

    text.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lead() -> Lead {
        Lead::new("t", "alice@acme.com", "Alice Smith", "Acme & Co")
            .with_category("SaaS")
            .with_attribute("title", "CTO")
    }

    #[test]
    fn substitutes_fields_and_attributes() {
        let out = substitute("Hi {first_name} ({title}) at {company}, {unknown}", &lead(), false);
        assert_eq!(out, "Hi Alice (CTO) at Acme & Co, {unknown}");
    }

    #[test]
    fn body_values_are_escaped() {
        let out = substitute("<p>{company}</p>", &lead(), true);
        assert_eq!(out, "<p>Acme &amp; Co</p>");
    }

    #[test]
    fn subject_sanitized() {
        assert_eq!(sanitize_subject("Hello\r\nBcc: x@y.com"), "Hello  Bcc: x@y.com");
        assert_eq!(sanitize_subject("a\u{0007}b"), "ab");
        let long = "x".repeat(500);
        assert_eq!(sanitize_subject(&long).chars().count(), MAX_SUBJECT_CHARS);
    }

    #[test]
    fn scripts_and_styles_removed() {
        let html = "<p>Hi</p><SCRIPT type=\"x\">alert(1)</script><style>\np{}\n</style><p>Bye</p>";
        assert_eq!(sanitize_html(html), "<p>Hi</p><p>Bye</p>");
    }

    #[test]
    fn utm_added_without_overwriting() {
        let utm = BTreeMap::from([
            ("utm_source".to_string(), "leadai".to_string()),
            ("utm_campaign".to_string(), "spring".to_string()),
        ]);
        let tagged = tag_utm("https://acme.com/pricing?utm_source=own", &utm);
        assert_eq!(tagged, "https://acme.com/pricing?utm_source=own&utm_campaign=spring");
        assert_eq!(tag_utm("mailto:x@y.com", &utm), "mailto:x@y.com");
    }

    #[test]
    fn render_with_tracking_and_footer() {
        let options = RenderOptions {
            utm: BTreeMap::from([("utm_source".to_string(), "leadai".to_string())]),
            unsubscribe_footer: Some("Reply STOP, {name}".into()),
            tracking_base_url: Some("https://t.leadai.test/".into()),
            tracking_token: Some("tok123".into()),
            track_opens: true,
            track_clicks: true,
        };
        let out = render(
            "Hi {name}",
            r#"<html><body><p>See <a href="https://acme.com/x">this</a></p></body></html>"#,
            &lead(),
            &options,
        )
        .unwrap();

        assert_eq!(out.subject, "Hi Alice Smith");
        assert!(out.html_body.contains("https://t.leadai.test/t/click/tok123?url=https%3A%2F%2Facme.com%2Fx%3Futm_source%3Dleadai"));
        assert!(out.html_body.contains("<img src=\"https://t.leadai.test/t/open/tok123\""));
        assert!(out.html_body.contains("Reply STOP, Alice Smith"));
        assert!(out.html_body.ends_with("</body></html>"));
        assert!(out.text_body.contains("See this"));
        assert!(!out.text_body.contains("<"));
    }

    #[test]
    fn render_without_tracking_leaves_links() {
        let out = render(
            "Hi",
            r#"<p><a href="https://acme.com">x</a></p>"#,
            &lead(),
            &RenderOptions::default(),
        )
        .unwrap();
        assert!(out.html_body.contains(r#"href="https://acme.com""#));
        assert!(!out.html_body.contains("<img"));
    }

    #[test]
    fn empty_subject_is_validation_error() {
        let err = render("\r\n", "<p>x</p>", &lead(), &RenderOptions::default()).unwrap_err();
        assert_eq!(err.class, crate::error::ErrorClass::Validation);
    }

    #[test]
    fn text_alternative_keeps_paragraphs() {
        assert_eq!(
            html_to_text("<p>Hello   <b>Bob</b></p><p>Bye&nbsp;now</p>"),
            "Hello Bob\nBye now"
        );
    }
}
