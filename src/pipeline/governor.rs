//! Rate/window governor.
//!
//! Decides whether a send may happen now. Counters are keyed by transport
//! profile so campaigns sharing a sender share one budget.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, Utc,
};
use tracing::debug;

use crate::campaigns::{RateLimit, SendWindow};

/// Limits applied to one send request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GovernorRules {
    pub rate_limit: Option<RateLimit>,
    pub window: Option<SendWindow>,
    /// Warm-up cap: sends per local day.
    pub daily_cap: Option<u32>,
}

/// Governor verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clearance {
    Clear,
    NotBefore(DateTime<Utc>),
}

impl Clearance {
    pub fn is_clear(&self) -> bool {
        matches!(self, Self::Clear)
    }
}

#[derive(Debug, Default)]
struct Counter {
    interval_start: Option<DateTime<Utc>>,
    in_interval: u32,
    day: Option<NaiveDate>,
    today: u32,
    /// Offset the daily budget was first counted in; later requests under
    /// the same key keep using it.
    day_offset: Option<FixedOffset>,
}

/// Shared rate/window state.
#[derive(Debug, Default)]
pub struct Governor {
    counters: Mutex<HashMap<String, Counter>>,
}

impl Governor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for permission to send one message under `key`.
    ///
    /// `Clear` consumes one unit of the rate and daily budgets.
    pub fn request(&self, key: &str, rules: &GovernorRules, now: DateTime<Utc>) -> Clearance {
        if let Some(window) = &rules.window
            && !window_open(window, now)
        {
            let opens = next_opening(window, now);
            debug!(key, %opens, "Outside send window");
            return Clearance::NotBefore(opens);
        }

        let rules_offset = rules
            .window
            .as_ref()
            .map(|w| fixed_offset(w.utc_offset_minutes))
            .unwrap_or_else(|| Utc.fix());

        let mut counters = match self.counters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let counter = counters.entry(key.to_string()).or_default();
        let offset = *counter.day_offset.get_or_insert(rules_offset);
        let local_day = now.with_timezone(&offset).date_naive();

        if counter.day != Some(local_day) {
            counter.day = Some(local_day);
            counter.today = 0;
        }
        if let Some(cap) = rules.daily_cap
            && counter.today >= cap
        {
            let midnight = local_midnight_after(local_day, offset);
            debug!(key, cap, %midnight, "Daily cap reached");
            return Clearance::NotBefore(midnight);
        }

        if let Some(rate) = &rules.rate_limit {
            let interval = Duration::from_std(rate.interval()).unwrap_or(Duration::seconds(60));
            match counter.interval_start {
                Some(start) if now < start + interval => {
                    if counter.in_interval >= rate.max_messages {
                        return Clearance::NotBefore(start + interval);
                    }
                }
                _ => {
                    counter.interval_start = Some(now);
                    counter.in_interval = 0;
                }
            }
            counter.in_interval += 1;
        }

        counter.today += 1;
        Clearance::Clear
    }

    /// Sends counted today for `key` (local day of the last request).
    pub fn sent_today(&self, key: &str) -> u32 {
        let counters = match self.counters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        counters.get(key).map(|c| c.today).unwrap_or(0)
    }
}

fn fixed_offset(minutes: i32) -> FixedOffset {
    FixedOffset::east_opt(minutes * 60).unwrap_or_else(|| Utc.fix())
}

fn to_utc(local: NaiveDateTime, offset: FixedOffset) -> DateTime<Utc> {
    (local - Duration::seconds(offset.local_minus_utc() as i64)).and_utc()
}

fn local_midnight_after(day: NaiveDate, offset: FixedOffset) -> DateTime<Utc> {
    let next = day.succ_opt().unwrap_or(day);
    to_utc(next.and_time(NaiveTime::from_hms_opt(0, 0, 0).unwrap_or_default()), offset)
}

/// Whether `now` falls inside the window.
pub fn window_open(window: &SendWindow, now: DateTime<Utc>) -> bool {
    let local = now.with_timezone(&fixed_offset(window.utc_offset_minutes));
    let t = local.time();
    let today = local.weekday();

    if window.start < window.end {
        t >= window.start && t < window.end && window.weekdays.contains(&today)
    } else if t >= window.start {
        window.weekdays.contains(&today)
    } else if t < window.end {
        // Early-morning tail of the previous day's window.
        window.weekdays.contains(&today.pred())
    } else {
        false
    }
}

/// Next instant strictly after `now` at which the window opens.
pub fn next_opening(window: &SendWindow, now: DateTime<Utc>) -> DateTime<Utc> {
    let offset = fixed_offset(window.utc_offset_minutes);
    let today = now.with_timezone(&offset).date_naive();

    for days_ahead in 0..=7 {
        let Some(date) = today.checked_add_signed(Duration::days(days_ahead)) else {
            break;
        };
        if !window.weekdays.contains(&date.weekday()) {
            continue;
        }
        let opens = to_utc(date.and_time(window.start), offset);
        if opens > now {
            return opens;
        }
    }
    now + Duration::days(1)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Weekday};

    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    // 2026-03-02 is a Monday.

    #[test]
    fn rate_limit_fixed_interval() {
        let g = Governor::new();
        let rules = GovernorRules {
            rate_limit: Some(RateLimit::per_minute(2)),
            ..Default::default()
        };
        let t0 = at(2026, 3, 2, 10, 0);

        assert!(g.request("p", &rules, t0).is_clear());
        assert!(g.request("p", &rules, t0 + Duration::seconds(10)).is_clear());
        assert_eq!(
            g.request("p", &rules, t0 + Duration::seconds(20)),
            Clearance::NotBefore(t0 + Duration::seconds(60))
        );
        // Interval elapsed: counter resets.
        assert!(g.request("p", &rules, t0 + Duration::seconds(60)).is_clear());
    }

    #[test]
    fn counters_are_per_key() {
        let g = Governor::new();
        let rules = GovernorRules {
            rate_limit: Some(RateLimit::per_minute(1)),
            ..Default::default()
        };
        let t0 = at(2026, 3, 2, 10, 0);
        assert!(g.request("a", &rules, t0).is_clear());
        assert!(g.request("b", &rules, t0).is_clear());
        assert!(!g.request("a", &rules, t0).is_clear());
    }

    #[test]
    fn window_start_inclusive_end_exclusive() {
        let w = SendWindow::weekdays(hm(9, 0), hm(17, 0));
        assert!(window_open(&w, at(2026, 3, 2, 9, 0)));
        assert!(window_open(&w, at(2026, 3, 2, 16, 59)));
        assert!(!window_open(&w, at(2026, 3, 2, 17, 0)));
        // Saturday
        assert!(!window_open(&w, at(2026, 3, 7, 10, 0)));
    }

    #[test]
    fn outside_window_defers_to_next_opening() {
        let g = Governor::new();
        let rules = GovernorRules {
            window: Some(SendWindow::weekdays(hm(9, 0), hm(17, 0))),
            ..Default::default()
        };
        // Friday evening → Monday 09:00.
        assert_eq!(
            g.request("p", &rules, at(2026, 3, 6, 18, 0)),
            Clearance::NotBefore(at(2026, 3, 9, 9, 0))
        );
        // Monday early → same day.
        assert_eq!(
            g.request("p", &rules, at(2026, 3, 2, 7, 30)),
            Clearance::NotBefore(at(2026, 3, 2, 9, 0))
        );
    }

    #[test]
    fn overnight_window_tail_belongs_to_previous_day() {
        let w = SendWindow {
            start: hm(22, 0),
            end: hm(2, 0),
            weekdays: vec![Weekday::Fri],
            utc_offset_minutes: 0,
        };
        assert!(window_open(&w, at(2026, 3, 6, 23, 0))); // Fri night
        assert!(window_open(&w, at(2026, 3, 7, 1, 0))); // Sat 01:00, Friday's window
        assert!(!window_open(&w, at(2026, 3, 7, 23, 0))); // Sat night
        assert!(!window_open(&w, at(2026, 3, 6, 1, 0))); // Fri 01:00, Thursday's window
    }

    #[test]
    fn window_uses_fixed_offset() {
        // 09:00-17:00 at UTC+02:00 is 07:00-15:00 UTC.
        let w = SendWindow::daily(hm(9, 0), hm(17, 0)).with_offset_minutes(120);
        assert!(window_open(&w, at(2026, 3, 2, 7, 0)));
        assert!(!window_open(&w, at(2026, 3, 2, 15, 0)));
        assert_eq!(next_opening(&w, at(2026, 3, 2, 16, 0)), at(2026, 3, 3, 7, 0));
    }

    #[test]
    fn daily_cap_defers_to_local_midnight() {
        let g = Governor::new();
        let rules = GovernorRules {
            daily_cap: Some(2),
            ..Default::default()
        };
        let t0 = at(2026, 3, 2, 10, 0);
        assert!(g.request("p", &rules, t0).is_clear());
        assert!(g.request("p", &rules, t0).is_clear());
        assert_eq!(
            g.request("p", &rules, t0),
            Clearance::NotBefore(at(2026, 3, 3, 0, 0))
        );
        assert_eq!(g.sent_today("p"), 2);
        assert!(g.request("p", &rules, at(2026, 3, 3, 0, 0)).is_clear());
    }

    #[test]
    fn daily_cap_holds_across_rules_with_different_offsets() {
        let g = Governor::new();
        let utc = GovernorRules {
            daily_cap: Some(2),
            ..Default::default()
        };
        let sydney = GovernorRules {
            window: Some(SendWindow::daily(hm(0, 0), hm(23, 59)).with_offset_minutes(600)),
            daily_cap: Some(2),
            ..Default::default()
        };
        // 20:00 UTC Monday is already Tuesday 06:00 at +10:00.
        let t0 = at(2026, 3, 2, 20, 0);

        let cleared = (0..6)
            .filter(|i| {
                let rules = if i % 2 == 0 { &utc } else { &sydney };
                g.request("p", rules, t0 + Duration::seconds(*i)).is_clear()
            })
            .count();
        assert_eq!(cleared, 2);
        assert_eq!(g.sent_today("p"), 2);
    }

    #[test]
    fn refused_requests_do_not_consume_budget() {
        let g = Governor::new();
        let rules = GovernorRules {
            rate_limit: Some(RateLimit::per_minute(1)),
            daily_cap: Some(10),
            ..Default::default()
        };
        let t0 = at(2026, 3, 2, 10, 0);
        assert!(g.request("p", &rules, t0).is_clear());
        for _ in 0..5 {
            assert!(!g.request("p", &rules, t0).is_clear());
        }
        assert_eq!(g.sent_today("p"), 1);
    }

    #[test]
    fn concurrent_requests_never_exceed_budget() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicU32, Ordering};

        let g = Arc::new(Governor::new());
        let cleared = Arc::new(AtomicU32::new(0));
        let rules = GovernorRules {
            rate_limit: Some(RateLimit::per_minute(25)),
            ..Default::default()
        };
        let t0 = at(2026, 3, 2, 10, 0);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let g = Arc::clone(&g);
                let cleared = Arc::clone(&cleared);
                let rules = rules.clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        if g.request("shared", &rules, t0).is_clear() {
                            cleared.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cleared.load(Ordering::SeqCst), 25);
    }
}
