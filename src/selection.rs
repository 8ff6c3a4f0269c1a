//! Message selection: delivery windows and the weighted pick.

use chrono::NaiveTime;
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// Window tag that applies at any time of day.
pub const ALL_WINDOWS: &str = "ALL";

/// A named time-of-day range. `end` before `start` wraps past midnight;
/// `start == end` covers the whole day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryWindow {
    pub name: String,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl DeliveryWindow {
    pub fn new(name: impl Into<String>, start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            name: name.into(),
            start,
            end,
        }
    }

    /// Whether `time` falls in `[start, end)`.
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start == self.end {
            true
        } else if self.start < self.end {
            self.start <= time && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

/// Names of the windows that contain `time`, in input order.
pub fn matching_periods(windows: &[DeliveryWindow], time: NaiveTime) -> Vec<String> {
    windows
        .iter()
        .filter(|w| w.contains(time))
        .map(|w| w.name.clone())
        .collect()
}

/// A message text plus the windows it is written for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCandidate {
    pub text: String,
    #[serde(default)]
    pub windows: Vec<String>,
}

impl MessageCandidate {
    pub fn new<I, S>(text: impl Into<String>, windows: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            text: text.into(),
            windows: windows.into_iter().map(Into::into).collect(),
        }
    }

    fn is_usable(&self) -> bool {
        !self.text.trim().is_empty()
    }

    fn is_general(&self) -> bool {
        self.windows
            .iter()
            .any(|w| w.trim().eq_ignore_ascii_case(ALL_WINDOWS))
    }

    fn matches_any(&self, periods: &[String]) -> bool {
        self.windows.iter().any(|w| {
            periods
                .iter()
                .any(|p| !p.eq_ignore_ascii_case(ALL_WINDOWS) && w.trim().eq_ignore_ascii_case(p.trim()))
        })
    }
}

/// Pick a message for the current periods using the thread RNG.
///
/// See [`select_weighted_message_with`].
pub fn select_weighted_message(candidates: &[MessageCandidate], matching_periods: &[String]) -> String {
    select_weighted_message_with(candidates, matching_periods, &mut rand::thread_rng())
}

/// Pick a message for the current periods.
///
/// Candidates tagged for one of `matching_periods` win over candidates tagged
/// `ALL`; the winner is drawn uniformly from the most specific group. Returns
/// an empty string when nothing qualifies.
pub fn select_weighted_message_with<R: Rng + ?Sized>(
    candidates: &[MessageCandidate],
    matching_periods: &[String],
    rng: &mut R,
) -> String {
    let usable: Vec<&MessageCandidate> = candidates.iter().filter(|c| c.is_usable()).collect();

    let specific: Vec<&MessageCandidate> = usable
        .iter()
        .copied()
        .filter(|c| c.matches_any(matching_periods))
        .collect();
    let pool: Vec<&MessageCandidate> = if specific.is_empty() {
        usable.into_iter().filter(|c| c.is_general()).collect()
    } else {
        specific
    };

    pool.choose(rng).map(|c| c.text.clone()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn periods(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn window_contains_daytime_range() {
        let morning = DeliveryWindow::new("morning", t(6, 0), t(11, 0));
        assert!(morning.contains(t(6, 0)));
        assert!(morning.contains(t(10, 59)));
        assert!(!morning.contains(t(11, 0)));
        assert!(!morning.contains(t(23, 0)));
    }

    #[test]
    fn window_wraps_past_midnight() {
        let night = DeliveryWindow::new("night", t(22, 0), t(2, 0));
        assert!(night.contains(t(23, 30)));
        assert!(night.contains(t(1, 0)));
        assert!(!night.contains(t(12, 0)));
    }

    #[test]
    fn window_with_equal_bounds_is_all_day() {
        let always = DeliveryWindow::new("always", t(0, 0), t(0, 0));
        assert!(always.contains(t(13, 37)));
    }

    #[test]
    fn matching_periods_in_order() {
        let windows = vec![
            DeliveryWindow::new("morning", t(6, 0), t(12, 0)),
            DeliveryWindow::new("workday", t(9, 0), t(17, 0)),
            DeliveryWindow::new("evening", t(18, 0), t(22, 0)),
        ];
        assert_eq!(matching_periods(&windows, t(10, 0)), vec!["morning", "workday"]);
        assert!(matching_periods(&windows, t(3, 0)).is_empty());
    }

    #[test]
    fn window_deserializes_from_json() {
        let window: DeliveryWindow =
            serde_json::from_str(r#"{"name":"lunch","start":"12:00:00","end":"13:30:00"}"#).unwrap();
        assert!(window.contains(t(12, 45)));
    }

    #[test]
    fn empty_input_gives_empty_string() {
        assert_eq!(select_weighted_message(&[], &periods(&["morning"])), "");
    }

    #[test]
    fn specific_beats_general() {
        let candidates = vec![
            MessageCandidate::new("Anytime hello", ["ALL"]),
            MessageCandidate::new("Good morning!", ["morning"]),
        ];
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            assert_eq!(
                select_weighted_message_with(&candidates, &periods(&["morning"]), &mut rng),
                "Good morning!"
            );
        }
    }

    #[test]
    fn falls_back_to_general() {
        let candidates = vec![
            MessageCandidate::new("Anytime hello", ["all"]),
            MessageCandidate::new("Good evening", ["evening"]),
        ];
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            select_weighted_message_with(&candidates, &periods(&["morning"]), &mut rng),
            "Anytime hello"
        );
    }

    #[test]
    fn nothing_matching_gives_empty_string() {
        let candidates = vec![MessageCandidate::new("Good evening", ["evening"])];
        assert_eq!(select_weighted_message(&candidates, &periods(&["morning"])), "");
        assert_eq!(select_weighted_message(&candidates, &[]), "");
    }

    #[test]
    fn blank_text_is_ignored() {
        let candidates = vec![
            MessageCandidate::new("   ", ["morning"]),
            MessageCandidate::new("Fallback", ["ALL"]),
        ];
        assert_eq!(select_weighted_message(&candidates, &periods(&["morning"])), "Fallback");
    }

    #[test]
    fn tags_compare_case_insensitively() {
        let candidates = vec![MessageCandidate::new("Rise and shine", ["Morning"])];
        assert_eq!(
            select_weighted_message(&candidates, &periods(&["MORNING"])),
            "Rise and shine"
        );
    }

    #[test]
    fn ties_are_broken_across_the_group() {
        let candidates = vec![
            MessageCandidate::new("a", ["morning"]),
            MessageCandidate::new("b", ["morning"]),
            MessageCandidate::new("c", ["morning", "evening"]),
            MessageCandidate::new("general", ["ALL"]),
        ];
        let mut rng = StdRng::seed_from_u64(42);
        let seen: HashSet<String> = (0..200)
            .map(|_| select_weighted_message_with(&candidates, &periods(&["morning"]), &mut rng))
            .collect();
        assert_eq!(seen, HashSet::from(["a".to_string(), "b".into(), "c".into()]));
    }

    #[test]
    fn same_seed_same_pick() {
        let candidates = vec![
            MessageCandidate::new("a", ["ALL"]),
            MessageCandidate::new("b", ["ALL"]),
            MessageCandidate::new("c", ["ALL"]),
        ];
        let first = select_weighted_message_with(&candidates, &[], &mut StdRng::seed_from_u64(9));
        let second = select_weighted_message_with(&candidates, &[], &mut StdRng::seed_from_u64(9));
        assert_eq!(first, second);
    }
}
