use crate::achievements::Snapshot;

/// Transitions detected between two snapshots, in the order of the current snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub earned: Vec<String>,
    pub progress: Vec<String>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.earned.is_empty() && self.progress.is_empty()
    }

    pub fn len(&self) -> usize {
        self.earned.len() + self.progress.len()
    }
}

/// Compare a previous snapshot against a freshly parsed one.
///
/// Entries that disappeared from `current` are ignored: a missing entry means the
/// source did not include it this read, not that it was revoked.
pub fn diff(previous: &Snapshot, current: &Snapshot) -> SnapshotDiff {
    let mut result = SnapshotDiff::default();

    for (name, state) in current {
        let before = previous.get(name);

        if state.earned {
            if !before.map(|b| b.earned).unwrap_or(false) {
                result.earned.push(name.clone());
            }
            continue;
        }

        if state.progress.is_none() {
            continue;
        }

        let progress_changed = match before {
            None => true,
            Some(b) => b.progress != state.progress || b.max_progress != state.max_progress,
        };
        if progress_changed {
            result.progress.push(name.clone());
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::achievements::AchievementState;

    fn snapshot(entries: &[(&str, AchievementState)]) -> Snapshot {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn identical_snapshots_have_no_transitions() {
        let s = snapshot(&[
            ("A", AchievementState::earned_at(1_700_000_000)),
            ("B", AchievementState::locked().with_progress(Some(2.0), Some(5.0))),
            ("C", AchievementState::locked()),
        ]);
        assert!(diff(&s, &s).is_empty());
    }

    #[test]
    fn new_unlocks_are_reported_in_current_order() {
        let previous = snapshot(&[("A", AchievementState::locked())]);
        let current = snapshot(&[
            ("Z", AchievementState::earned_at(10)),
            ("A", AchievementState::earned_at(11)),
        ]);
        let d = diff(&previous, &current);
        assert_eq!(d.earned, vec!["Z".to_string(), "A".to_string()]);
        assert!(d.progress.is_empty());
    }

    #[test]
    fn progress_changes_are_reported_while_locked() {
        let previous = snapshot(&[(
            "P",
            AchievementState::locked().with_progress(Some(1.0), Some(10.0)),
        )]);
        let moved = snapshot(&[(
            "P",
            AchievementState::locked().with_progress(Some(2.0), Some(10.0)),
        )]);
        assert_eq!(diff(&previous, &moved).progress, vec!["P".to_string()]);

        let new_max = snapshot(&[(
            "P",
            AchievementState::locked().with_progress(Some(1.0), Some(20.0)),
        )]);
        assert_eq!(diff(&previous, &new_max).progress.len(), 1);

        let no_progress = snapshot(&[("P", AchievementState::locked())]);
        assert!(diff(&previous, &no_progress).is_empty());
    }

    #[test]
    fn earned_entries_do_not_report_progress() {
        let previous = snapshot(&[]);
        let current = snapshot(&[(
            "P",
            AchievementState::earned_at(5).with_progress(Some(10.0), Some(10.0)),
        )]);
        let d = diff(&previous, &current);
        assert_eq!(d.earned.len(), 1);
        assert!(d.progress.is_empty());
    }

    #[test]
    fn disappeared_entries_are_ignored() {
        let previous = snapshot(&[("A", AchievementState::earned_at(5))]);
        assert!(diff(&previous, &Snapshot::new()).is_empty());
    }
}
