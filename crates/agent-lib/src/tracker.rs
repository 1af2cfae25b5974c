//! Last-known state per workload and transition detection
//!
//! The tracker is what keeps a periodic poll loop from re-alerting on
//! every cycle: repeated identical observations are no-ops, and only
//! actual state changes produce a [`TransitionEvent`].

use crate::models::{HealthState, ObservedRecord, TrackedEntry, TransitionEvent, WorkloadIdentity};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

/// Default alert cooldown per workload (60 seconds)
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// Concurrent map of tracked workloads
///
/// Entries live in a sharded map, so ingesting one workload never blocks
/// another and readers always clone a whole entry.
pub struct StateTracker {
    entries: DashMap<WorkloadIdentity, TrackedEntry>,
    cooldown: Duration,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}

impl StateTracker {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            cooldown,
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Apply one observation, returning the transition it caused if any
    pub fn ingest(&self, record: &ObservedRecord) -> Option<TransitionEvent> {
        if record.state == HealthState::Deleted {
            return self.remove(&record.identity, record.observed_at);
        }

        match self.entries.entry(record.identity.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.last_seen_at = record.observed_at;
                entry.missing_since = None;
                entry.labels = record.labels.clone();

                if entry.current_state == record.state {
                    return None;
                }

                entry.previous_state = Some(entry.current_state);
                entry.current_state = record.state;
                entry.last_transition_at = record.observed_at;

                Some(TransitionEvent {
                    identity: entry.identity.clone(),
                    labels: entry.labels.clone(),
                    from: entry.previous_state,
                    to: entry.current_state,
                    at: record.observed_at,
                })
            }
            Entry::Vacant(vacant) => {
                debug!(identity = %record.identity, state = %record.state, "Tracking new workload");
                vacant.insert(TrackedEntry {
                    identity: record.identity.clone(),
                    labels: record.labels.clone(),
                    current_state: record.state,
                    previous_state: None,
                    first_seen_at: record.observed_at,
                    last_seen_at: record.observed_at,
                    last_transition_at: record.observed_at,
                    last_alert_sent_at: None,
                    missing_since: None,
                });

                Some(TransitionEvent {
                    identity: record.identity.clone(),
                    labels: record.labels.clone(),
                    from: None,
                    to: record.state,
                    at: record.observed_at,
                })
            }
        }
    }

    /// Stop tracking a workload, reporting its transition to `Deleted`
    pub fn remove(&self, identity: &WorkloadIdentity, at: DateTime<Utc>) -> Option<TransitionEvent> {
        self.entries.remove(identity).map(|(_, entry)| {
            debug!(identity = %identity, "Workload no longer tracked");
            TransitionEvent {
                identity: entry.identity,
                labels: entry.labels,
                from: Some(entry.current_state),
                to: HealthState::Deleted,
                at,
            }
        })
    }

    /// Expire workloads missing from a full enumeration for at least `grace`
    ///
    /// Workloads present in `seen` have their absence cleared. The returned
    /// transitions all target `Deleted`.
    pub fn sweep_absent(
        &self,
        seen: &HashSet<WorkloadIdentity>,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Vec<TransitionEvent> {
        let mut expired = Vec::new();

        for mut entry in self.entries.iter_mut() {
            if seen.contains(entry.key()) {
                entry.missing_since = None;
                continue;
            }

            let since = *entry.missing_since.get_or_insert(now);
            if elapsed_at_least(since, now, grace) {
                expired.push(entry.key().clone());
            }
        }

        expired
            .into_iter()
            .filter_map(|identity| {
                self.entries
                    .remove_if(&identity, |_, entry| entry.missing_since.is_some())
                    .map(|(_, entry)| TransitionEvent {
                        identity: entry.identity,
                        labels: entry.labels,
                        from: Some(entry.current_state),
                        to: HealthState::Deleted,
                        at: now,
                    })
            })
            .collect()
    }

    /// Cooldown gate for alerts
    ///
    /// Returns true and stamps `last_alert_sent_at` unless an alert was
    /// already claimed for this workload within the cooldown window.
    /// Workloads that are no longer tracked are always claimable.
    pub fn claim_alert(&self, identity: &WorkloadIdentity, at: DateTime<Utc>) -> bool {
        if !self.alert_allowed(identity, at) {
            return false;
        }
        self.record_alert(identity, at);
        true
    }

    /// Whether an alert at `at` falls outside the cooldown window
    pub fn alert_allowed(&self, identity: &WorkloadIdentity, at: DateTime<Utc>) -> bool {
        self.entries
            .get(identity)
            .and_then(|entry| entry.last_alert_sent_at)
            .map_or(true, |last| elapsed_at_least(last, at, self.cooldown))
    }

    /// Stamp `last_alert_sent_at` once an alert has been handed off
    pub fn record_alert(&self, identity: &WorkloadIdentity, at: DateTime<Utc>) {
        if let Some(mut entry) = self.entries.get_mut(identity) {
            entry.last_alert_sent_at = Some(at);
        }
    }

    /// Get a copy of one entry
    pub fn get(&self, identity: &WorkloadIdentity) -> Option<TrackedEntry> {
        self.entries.get(identity).map(|r| r.clone())
    }

    /// Consistent copies of all entries, ordered by identity
    pub fn snapshot(&self) -> Vec<TrackedEntry> {
        let mut entries: Vec<TrackedEntry> =
            self.entries.iter().map(|r| r.value().clone()).collect();
        entries.sort_by(|a, b| a.identity.cmp(&b.identity));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// True when at least `window` passed between `since` and `now`
fn elapsed_at_least(since: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    match (now - since).to_std() {
        Ok(elapsed) => elapsed >= window,
        // clock went backwards
        Err(_) => window.is_zero(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WorkloadLabels;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn record(id: &str, state: HealthState, secs: i64) -> ObservedRecord {
        ObservedRecord::new(
            WorkloadIdentity::new(id),
            state,
            at(secs),
            WorkloadLabels::new("host-1", format!("name-{}", id)),
        )
    }

    #[test]
    fn test_first_observation_creates_entry() {
        let tracker = StateTracker::default();
        let event = tracker.ingest(&record("abc123", HealthState::Running, 0)).unwrap();

        assert_eq!(event.from, None);
        assert_eq!(event.to, HealthState::Running);
        assert_eq!(tracker.len(), 1);

        let entry = tracker.get(&WorkloadIdentity::new("abc123")).unwrap();
        assert_eq!(entry.current_state, HealthState::Running);
        assert_eq!(entry.previous_state, None);
        assert_eq!(entry.last_alert_sent_at, None);
    }

    #[test]
    fn test_identical_observation_is_noop() {
        let tracker = StateTracker::default();
        tracker.ingest(&record("abc123", HealthState::Running, 0));

        assert!(tracker.ingest(&record("abc123", HealthState::Running, 30)).is_none());

        let entry = tracker.get(&WorkloadIdentity::new("abc123")).unwrap();
        assert_eq!(entry.last_seen_at, at(30));
        assert_eq!(entry.last_transition_at, at(0));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_transition_shifts_previous_state() {
        let tracker = StateTracker::default();
        tracker.ingest(&record("abc123", HealthState::Running, 0));

        let event = tracker
            .ingest(&record("abc123", HealthState::Unhealthy, 30))
            .unwrap();
        assert_eq!(event.from, Some(HealthState::Running));
        assert_eq!(event.to, HealthState::Unhealthy);
        assert_eq!(event.at, at(30));

        // repeated unhealthy produces no event
        assert!(tracker
            .ingest(&record("abc123", HealthState::Unhealthy, 60))
            .is_none());

        tracker.ingest(&record("abc123", HealthState::Stopped, 90));
        let entry = tracker.get(&WorkloadIdentity::new("abc123")).unwrap();
        assert_eq!(entry.previous_state, Some(HealthState::Unhealthy));
        assert_eq!(entry.current_state, HealthState::Stopped);
        assert_eq!(entry.last_transition_at, at(90));
    }

    #[test]
    fn test_deleted_removes_entry() {
        let tracker = StateTracker::default();
        tracker.ingest(&record("default/web", HealthState::Running, 0));

        let event = tracker
            .ingest(&record("default/web", HealthState::Deleted, 10))
            .unwrap();
        assert_eq!(event.from, Some(HealthState::Running));
        assert_eq!(event.to, HealthState::Deleted);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_deleted_unknown_workload_is_ignored() {
        let tracker = StateTracker::default();
        assert!(tracker
            .ingest(&record("default/ghost", HealthState::Deleted, 0))
            .is_none());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_claim_alert_respects_cooldown() {
        let tracker = StateTracker::new(Duration::from_secs(60));
        let id = WorkloadIdentity::new("abc123");
        tracker.ingest(&record("abc123", HealthState::Unhealthy, 0));

        assert!(tracker.claim_alert(&id, at(0)));
        assert!(!tracker.claim_alert(&id, at(30)));
        assert!(!tracker.claim_alert(&id, at(59)));
        assert!(tracker.claim_alert(&id, at(60)));

        let entry = tracker.get(&id).unwrap();
        assert_eq!(entry.last_alert_sent_at, Some(at(60)));
    }

    #[test]
    fn test_alert_allowed_does_not_stamp() {
        let tracker = StateTracker::new(Duration::from_secs(60));
        let id = WorkloadIdentity::new("abc123");
        tracker.ingest(&record("abc123", HealthState::Unhealthy, 0));

        assert!(tracker.alert_allowed(&id, at(0)));
        assert!(tracker.alert_allowed(&id, at(10)));
        assert!(tracker.get(&id).unwrap().last_alert_sent_at.is_none());

        tracker.record_alert(&id, at(10));
        assert!(!tracker.alert_allowed(&id, at(40)));
        assert!(tracker.alert_allowed(&id, at(70)));
    }

    #[test]
    fn test_claim_alert_untracked_is_allowed() {
        let tracker = StateTracker::default();
        assert!(tracker.claim_alert(&WorkloadIdentity::new("gone"), at(0)));
    }

    #[test]
    fn test_sweep_absent_with_grace() {
        let tracker = StateTracker::default();
        tracker.ingest(&record("a", HealthState::Running, 0));
        tracker.ingest(&record("b", HealthState::Stopped, 0));

        let seen: HashSet<_> = [WorkloadIdentity::new("a")].into_iter().collect();
        let grace = Duration::from_secs(60);

        // first miss only starts the clock
        assert!(tracker.sweep_absent(&seen, at(30), grace).is_empty());
        let b = tracker.get(&WorkloadIdentity::new("b")).unwrap();
        assert_eq!(b.missing_since, Some(at(30)));

        assert!(tracker.sweep_absent(&seen, at(60), grace).is_empty());

        let expired = tracker.sweep_absent(&seen, at(90), grace);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].identity, WorkloadIdentity::new("b"));
        assert_eq!(expired[0].from, Some(HealthState::Stopped));
        assert_eq!(expired[0].to, HealthState::Deleted);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_reappearing_workload_clears_absence() {
        let tracker = StateTracker::default();
        tracker.ingest(&record("a", HealthState::Running, 0));

        let empty = HashSet::new();
        tracker.sweep_absent(&empty, at(30), Duration::from_secs(60));
        tracker.ingest(&record("a", HealthState::Running, 60));

        let entry = tracker.get(&WorkloadIdentity::new("a")).unwrap();
        assert_eq!(entry.missing_since, None);
    }

    #[test]
    fn test_sweep_absent_zero_grace_is_immediate() {
        let tracker = StateTracker::default();
        tracker.ingest(&record("default/a", HealthState::Running, 0));

        let expired = tracker.sweep_absent(&HashSet::new(), at(5), Duration::ZERO);
        assert_eq!(expired.len(), 1);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let tracker = StateTracker::default();
        tracker.ingest(&record("c", HealthState::Running, 0));
        tracker.ingest(&record("a", HealthState::Running, 0));
        tracker.ingest(&record("b", HealthState::Running, 0));

        let ids: Vec<_> = tracker
            .snapshot()
            .into_iter()
            .map(|e| e.identity.as_str().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
