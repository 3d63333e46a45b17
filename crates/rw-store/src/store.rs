use parking_lot::RwLock;
use rw_types::{Observation, ObjectiveDirection, StoreError, TrialId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// The ledger behind a snapshot. Positions in `observations` never change;
/// the indexes only ever grow.
#[derive(Debug, Clone, Default)]
struct Ledger {
    observations: Vec<Observation>,
    by_trial: BTreeMap<TrialId, Vec<usize>>,
    by_resource: BTreeMap<u64, Vec<usize>>,
}

impl Ledger {
    fn check(&self, observation: &Observation) -> Result<(), StoreError> {
        if !observation.value.is_finite() {
            return Err(StoreError::InvalidMetric {
                trial_id: observation.trial_id,
                value: observation.value,
            });
        }
        if let Some(positions) = self.by_trial.get(&observation.trial_id) {
            if positions
                .iter()
                .any(|&p| self.observations[p].resource == observation.resource)
            {
                return Err(StoreError::DuplicateResourceLevel {
                    trial_id: observation.trial_id,
                    resource: observation.resource,
                });
            }
            if let Some(&last) = positions.last() {
                let last = self.observations[last].resource;
                if observation.resource < last {
                    return Err(StoreError::NonIncreasingResource {
                        trial_id: observation.trial_id,
                        resource: observation.resource,
                        last,
                    });
                }
            }
        }
        Ok(())
    }

    fn append(&mut self, observation: Observation) {
        let position = self.observations.len();
        self.by_trial
            .entry(observation.trial_id)
            .or_default()
            .push(position);
        self.by_resource
            .entry(observation.resource)
            .or_default()
            .push(position);
        self.observations.push(observation);
    }
}

/// Immutable view of the ledger at one point in time.
///
/// Cloning a snapshot is cheap; it never observes writes made after it was
/// taken.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    ledger: Arc<Ledger>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.ledger.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ledger.observations.is_empty()
    }

    /// All observations in arrival order.
    pub fn observations(&self) -> &[Observation] {
        &self.ledger.observations
    }

    pub fn trial_ids(&self) -> impl Iterator<Item = TrialId> + '_ {
        self.ledger.by_trial.keys().copied()
    }

    pub fn num_trials(&self) -> usize {
        self.ledger.by_trial.len()
    }

    /// Observations of one trial, increasing in resource.
    pub fn for_trial(&self, trial_id: TrialId) -> impl Iterator<Item = &Observation> + '_ {
        self.ledger
            .by_trial
            .get(&trial_id)
            .into_iter()
            .flatten()
            .map(move |&p| &self.ledger.observations[p])
    }

    /// (resource, value) pairs of one trial.
    pub fn curve(&self, trial_id: TrialId) -> Vec<(u64, f64)> {
        self.for_trial(trial_id)
            .map(|o| (o.resource, o.value))
            .collect()
    }

    /// Every observation reported at exactly `resource`.
    pub fn at_resource(&self, resource: u64) -> impl Iterator<Item = &Observation> + '_ {
        self.ledger
            .by_resource
            .get(&resource)
            .into_iter()
            .flatten()
            .map(move |&p| &self.ledger.observations[p])
    }

    /// Best observation so far; the earliest one wins ties.
    pub fn best(&self, direction: ObjectiveDirection) -> Option<&Observation> {
        self.ledger
            .observations
            .iter()
            .fold(None, |best: Option<&Observation>, o| match best {
                Some(b) if !direction.is_better(o.value, b.value) => Some(b),
                _ => Some(o),
            })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub recorded: u64,
    pub rejected: u64,
}

/// Append-only observation ledger.
///
/// Writers clone the ledger only while a snapshot of the previous version is
/// still alive, so readers always see either none or all of an append.
#[derive(Debug, Default)]
pub struct ObservationStore {
    ledger: RwLock<Arc<Ledger>>,
    stats: RwLock<StoreStats>,
}

impl ObservationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one observation.
    pub fn record(&self, observation: Observation) -> Result<(), StoreError> {
        let mut guard = self.ledger.write();

        if let Err(e) = guard.check(&observation) {
            self.stats.write().rejected += 1;
            warn!(trial_id = %observation.trial_id, resource = observation.resource, error = %e, "observation rejected");
            return Err(e);
        }

        debug!(
            trial_id = %observation.trial_id,
            resource = observation.resource,
            value = observation.value,
            "observation recorded"
        );
        Arc::make_mut(&mut *guard).append(observation);
        drop(guard);

        self.stats.write().recorded += 1;
        Ok(())
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            ledger: Arc::clone(&self.ledger.read()),
        }
    }

    pub fn len(&self) -> usize {
        self.ledger.read().observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StoreStats {
        self.stats.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rw_types::{Configuration, ParameterValue};
    use std::thread;

    fn obs(trial: u64, resource: u64, value: f64) -> Observation {
        Observation {
            trial_id: TrialId(trial),
            config: Configuration::new().with("x", ParameterValue::Float(trial as f64 / 10.0)),
            resource,
            value,
            seed: 0,
        }
    }

    #[test]
    fn duplicate_resource_level_is_rejected() {
        let store = ObservationStore::new();
        store.record(obs(1, 4, 0.8)).unwrap();
        store.record(obs(1, 5, 0.6)).unwrap();

        let err = store.record(obs(1, 5, 0.1)).unwrap_err();
        assert_eq!(
            err,
            StoreError::DuplicateResourceLevel {
                trial_id: TrialId(1),
                resource: 5,
            }
        );

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.curve(TrialId(1)), vec![(4, 0.8), (5, 0.6)]);
        assert_eq!(store.stats(), StoreStats { recorded: 2, rejected: 1 });
    }

    #[test]
    fn resource_levels_must_increase() {
        let store = ObservationStore::new();
        store.record(obs(2, 3, 0.5)).unwrap();
        let err = store.record(obs(2, 1, 0.9)).unwrap_err();
        assert!(matches!(err, StoreError::NonIncreasingResource { last: 3, .. }));
    }

    #[test]
    fn non_finite_metric_is_rejected() {
        let store = ObservationStore::new();
        assert!(matches!(
            store.record(obs(1, 1, f64::NAN)),
            Err(StoreError::InvalidMetric { .. })
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn snapshot_is_isolated_from_later_appends() {
        let store = ObservationStore::new();
        store.record(obs(1, 1, 0.9)).unwrap();
        let before = store.snapshot();

        store.record(obs(1, 2, 0.7)).unwrap();
        store.record(obs(2, 1, 0.8)).unwrap();
        let after = store.snapshot();

        assert_eq!(before.len(), 1);
        assert_eq!(before.num_trials(), 1);
        assert_eq!(after.len(), 3);
        assert_eq!(after.at_resource(1).count(), 2);
    }

    #[test]
    fn best_respects_direction() {
        let store = ObservationStore::new();
        store.record(obs(1, 1, 0.4)).unwrap();
        store.record(obs(2, 1, 0.2)).unwrap();
        store.record(obs(3, 1, 0.7)).unwrap();
        let snapshot = store.snapshot();

        assert_eq!(snapshot.best(ObjectiveDirection::Minimize).unwrap().value, 0.2);
        assert_eq!(snapshot.best(ObjectiveDirection::Maximize).unwrap().value, 0.7);
    }

    #[test]
    fn concurrent_snapshots_see_whole_observations() {
        let store = Arc::new(ObservationStore::new());

        let writer = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for trial in 0..20 {
                    for resource in 1..=10 {
                        store
                            .record(obs(trial, resource, resource as f64))
                            .unwrap();
                    }
                }
            })
        };

        let reader = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for _ in 0..500 {
                    let snapshot = store.snapshot();
                    let indexed: usize = snapshot
                        .trial_ids()
                        .map(|id| snapshot.for_trial(id).count())
                        .sum();
                    assert_eq!(indexed, snapshot.len());
                    for o in snapshot.observations() {
                        assert_eq!(o.value, o.resource as f64);
                    }
                }
            })
        };

        writer.join().unwrap();
        reader.join().unwrap();
        assert_eq!(store.len(), 200);
    }
}
