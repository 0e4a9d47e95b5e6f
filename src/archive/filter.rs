//! Time-window selection and the rebuild-or-not decision.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::ArchiveEntry;

/// Default hours added on both sides of a window.
pub const DEFAULT_BUFFER_HOURS: i64 = 2;

/// Default minimum reduction ratio worth a rebuild.
pub const DEFAULT_REDUCTION_THRESHOLD: f64 = 0.20;

/// Caller-supplied `[begin, end]` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    begin: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeWindow {
    /// Returns `None` when `begin` is after `end`.
    pub fn new(begin: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        (begin <= end).then_some(Self { begin, end })
    }

    pub fn begin(&self) -> DateTime<Utc> {
        self.begin
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Whether `t` lies in `[begin - buffer, end + buffer]`.
    pub fn contains_buffered(&self, t: DateTime<Utc>, buffer: Duration) -> bool {
        let lower = self.begin.checked_sub_signed(buffer).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let upper = self.end.checked_add_signed(buffer).unwrap_or(DateTime::<Utc>::MAX_UTC);
        lower <= t && t <= upper
    }
}

/// Buffer and threshold applied to every window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterPolicy {
    pub buffer: Duration,
    pub reduction_threshold: f64,
}

impl Default for FilterPolicy {
    fn default() -> Self {
        Self {
            buffer: Duration::hours(DEFAULT_BUFFER_HOURS),
            reduction_threshold: DEFAULT_REDUCTION_THRESHOLD,
        }
    }
}

/// Why the original archive was used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    BelowThreshold,
    ExtractionError,
    UnsupportedFormat,
    EmptySelection,
    RebuildFailed,
}

/// Outcome of pre-filtering one upload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterDecision {
    pub source_entries: usize,
    pub source_size: u64,
    pub filtered_entries: usize,
    pub filtered_size: u64,
    pub reduction: f64,
    pub applied: bool,
    pub fallback_reason: Option<FallbackReason>,
}

impl FilterDecision {
    /// No window was requested; nothing was inspected.
    pub fn skipped() -> Self {
        Self {
            source_entries: 0,
            source_size: 0,
            filtered_entries: 0,
            filtered_size: 0,
            reduction: 0.0,
            applied: false,
            fallback_reason: None,
        }
    }

    /// The archive could not be listed at all.
    pub fn failed(reason: FallbackReason) -> Self {
        Self {
            fallback_reason: Some(reason),
            ..Self::skipped()
        }
    }

    /// Same numbers, but the rebuild did not happen.
    pub fn with_fallback(self, reason: FallbackReason) -> Self {
        Self {
            applied: false,
            fallback_reason: Some(reason),
            ..self
        }
    }
}

/// Result of [`decide`]: the decision and, when a rebuild is worthwhile,
/// the entries to keep.
#[derive(Debug, Clone)]
pub struct Selection {
    pub decision: FilterDecision,
    pub selected: Vec<ArchiveEntry>,
}

impl Selection {
    pub fn should_rebuild(&self) -> bool {
        self.decision.applied
    }
}

/// Select entries inside the buffered window and decide on a rebuild.
///
/// `decision.applied` is provisional here: the caller downgrades it to
/// [`FallbackReason::RebuildFailed`] if writing the archive fails.
pub fn decide(
    entries: &[ArchiveEntry],
    window: Option<&TimeWindow>,
    policy: &FilterPolicy,
) -> Selection {
    let Some(window) = window else {
        return Selection {
            decision: FilterDecision::skipped(),
            selected: Vec::new(),
        };
    };

    let selected: Vec<ArchiveEntry> = entries
        .iter()
        .filter(|e| window.contains_buffered(e.modified, policy.buffer))
        .cloned()
        .collect();

    let source_size: u64 = entries.iter().map(|e| e.size).sum();
    let filtered_size: u64 = selected.iter().map(|e| e.size).sum();
    let reduction = if source_size == 0 {
        0.0
    } else {
        1.0 - filtered_size as f64 / source_size as f64
    };

    let fallback_reason = if selected.is_empty() {
        Some(FallbackReason::EmptySelection)
    } else if reduction <= policy.reduction_threshold {
        Some(FallbackReason::BelowThreshold)
    } else {
        None
    };

    let decision = FilterDecision {
        source_entries: entries.len(),
        source_size,
        filtered_entries: selected.len(),
        filtered_size,
        reduction,
        applied: fallback_reason.is_none(),
        fallback_reason,
    };

    Selection {
        selected: if decision.applied { selected } else { Vec::new() },
        decision,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, hour, 0, 0).unwrap()
    }

    fn entry(index: usize, modified: DateTime<Utc>, size: u64) -> ArchiveEntry {
        ArchiveEntry {
            index,
            path: format!("logs/{index}.log"),
            modified,
            size,
        }
    }

    /// One 1000-byte file every six hours for ten days.
    fn ten_days() -> Vec<ArchiveEntry> {
        (0..40)
            .map(|i| entry(i, at(1 + (i / 4) as u32, (i % 4) as u32 * 6), 1000))
            .collect()
    }

    #[test]
    fn no_window_is_a_noop() {
        let selection = decide(&ten_days(), None, &FilterPolicy::default());
        assert_eq!(selection.decision, FilterDecision::skipped());
        assert!(!selection.should_rebuild());
    }

    #[test]
    fn one_day_of_ten_is_applied() {
        let window = TimeWindow::new(at(5, 0), at(5, 23)).unwrap();
        let selection = decide(&ten_days(), Some(&window), &FilterPolicy::default());

        // Day 5 plus day 6 00:00, which the 2h buffer pulls in
        let kept: Vec<_> = selection.selected.iter().map(|e| e.index).collect();
        assert_eq!(kept, vec![16, 17, 18, 19, 20]);
        assert!(selection.decision.applied);
        assert!((selection.decision.reduction - 0.875).abs() < 1e-9);
        assert_eq!(selection.decision.fallback_reason, None);
    }

    #[test]
    fn buffer_edges_are_inclusive() {
        let window = TimeWindow::new(at(2, 8), at(2, 10)).unwrap();
        let policy = FilterPolicy {
            buffer: Duration::hours(2),
            ..FilterPolicy::default()
        };
        let entries = vec![
            entry(0, at(2, 6), 10),
            entry(1, at(2, 12), 10),
            entry(2, at(2, 13), 10),
            entry(3, at(2, 5), 70),
        ];
        let selection = decide(&entries, Some(&window), &policy);
        let kept: Vec<_> = selection.selected.iter().map(|e| e.index).collect();
        assert_eq!(kept, vec![0, 1]);
    }

    #[test]
    fn small_reduction_falls_back() {
        let entries = vec![entry(0, at(1, 0), 900), entry(1, at(9, 0), 100)];
        let window = TimeWindow::new(at(1, 0), at(1, 1)).unwrap();
        let selection = decide(&entries, Some(&window), &FilterPolicy::default());

        assert!(!selection.decision.applied);
        assert_eq!(
            selection.decision.fallback_reason,
            Some(FallbackReason::BelowThreshold)
        );
        assert!((selection.decision.reduction - 0.1).abs() < 1e-9);
        assert!(selection.selected.is_empty());
    }

    #[test]
    fn reduction_equal_to_threshold_is_not_enough() {
        let entries = vec![entry(0, at(1, 0), 80), entry(1, at(9, 0), 20)];
        let window = TimeWindow::new(at(1, 0), at(1, 0)).unwrap();
        let selection = decide(&entries, Some(&window), &FilterPolicy::default());
        assert_eq!(
            selection.decision.fallback_reason,
            Some(FallbackReason::BelowThreshold)
        );
    }

    #[test]
    fn empty_selection_falls_back() {
        let window = TimeWindow::new(at(20, 0), at(21, 0)).unwrap();
        let selection = decide(&ten_days(), Some(&window), &FilterPolicy::default());
        assert!(!selection.decision.applied);
        assert_eq!(
            selection.decision.fallback_reason,
            Some(FallbackReason::EmptySelection)
        );
    }

    #[test]
    fn threshold_is_configurable() {
        let entries = vec![entry(0, at(1, 0), 900), entry(1, at(9, 0), 100)];
        let window = TimeWindow::new(at(1, 0), at(1, 1)).unwrap();
        let policy = FilterPolicy {
            reduction_threshold: 0.05,
            ..FilterPolicy::default()
        };
        assert!(decide(&entries, Some(&window), &policy).decision.applied);
    }

    #[test]
    fn inverted_window_is_rejected() {
        assert!(TimeWindow::new(at(2, 0), at(1, 0)).is_none());
    }
}
