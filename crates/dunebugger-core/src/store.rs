//! # State Store
//!
//! Owns the GPIO map and the log buffer, and tells listeners about every
//! change.
//!
//! ## Notification Model
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        StateStore Mutation                              │
//! │                                                                         │
//! │   apply_initial_state / apply_gpio_update / append_log                  │
//! │        │                                                                │
//! │        ▼                                                                │
//! │   validate ──── Err ───► nothing mutated, nobody notified               │
//! │        │                                                                │
//! │        ▼ Ok                                                             │
//! │   mutate gpio + logs, revision += 1                                     │
//! │        │                                                                │
//! │        ▼                                                                │
//! │   listener #1 ──► listener #2 ──► ... (registration order, same thread) │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Listeners run after the mutation is complete, so they never see a half
//! applied initial state. They receive `&StateStore` and must not try to lock
//! whatever shared wrapper the store lives in.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{StoreError, StoreResult};
use crate::gpio::{GpioMap, GpioValue};
use crate::logs::LogBuffer;

// =============================================================================
// Change Events
// =============================================================================

/// What a mutating call changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    /// GPIO map and log buffer were replaced together.
    InitialState { gpio_count: usize, log_count: usize },

    /// One GPIO entry was inserted or overwritten.
    GpioUpdated {
        gpio: String,
        value: GpioValue,
        previous: Option<GpioValue>,
    },

    /// One log line was appended.
    LogAppended { line: String },
}

// =============================================================================
// Listeners
// =============================================================================

/// Identifier returned by [`StateStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type Listener = Box<dyn Fn(&StoreChange, &StateStore) + Send + Sync>;

// =============================================================================
// Snapshot
// =============================================================================

/// Owned, key-sorted copy of the store for views.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSnapshot {
    pub gpio: BTreeMap<String, GpioValue>,
    pub logs: Vec<String>,
    pub revision: u64,
}

// =============================================================================
// State Store
// =============================================================================

/// Last-known device state plus its subscribers.
pub struct StateStore {
    gpio: GpioMap,
    logs: LogBuffer,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: u64,
    revision: u64,
}

impl StateStore {
    /// Creates an empty store whose log buffer keeps `log_capacity` lines.
    pub fn new(log_capacity: usize) -> Self {
        StateStore {
            gpio: GpioMap::new(),
            logs: LogBuffer::new(log_capacity),
            listeners: Vec::new(),
            next_listener: 1,
            revision: 0,
        }
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Replaces the GPIO map and the log buffer in one step.
    pub fn apply_initial_state(&mut self, gpio: GpioMap, logs: Vec<String>) -> StoreResult<()> {
        if gpio.keys().any(|k| k.is_empty()) {
            return Err(StoreError::EmptyGpioId);
        }

        self.gpio = gpio;
        self.logs.replace(logs);
        self.revision += 1;

        let change = StoreChange::InitialState {
            gpio_count: self.gpio.len(),
            log_count: self.logs.len(),
        };
        self.notify(&change);
        Ok(())
    }

    /// Inserts or overwrites one GPIO entry.
    pub fn apply_gpio_update(
        &mut self,
        gpio: impl Into<String>,
        value: GpioValue,
    ) -> StoreResult<()> {
        let gpio = gpio.into();
        if gpio.is_empty() {
            return Err(StoreError::EmptyGpioId);
        }

        let previous = self.gpio.insert(gpio.clone(), value.clone());
        self.revision += 1;

        self.notify(&StoreChange::GpioUpdated {
            gpio,
            value,
            previous,
        });
        Ok(())
    }

    /// Appends one log line.
    pub fn append_log(&mut self, line: impl Into<String>) {
        let line = line.into();
        self.logs.push(line.clone());
        self.revision += 1;

        self.notify(&StoreChange::LogAppended { line });
    }

    // =========================================================================
    // Subscription
    // =========================================================================

    /// Registers a listener. Listeners are called in registration order.
    pub fn subscribe<F>(&mut self, listener: F) -> ListenerId
    where
        F: Fn(&StoreChange, &StateStore) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Removes a listener.
    pub fn unsubscribe(&mut self, id: ListenerId) -> StoreResult<()> {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        if self.listeners.len() == before {
            return Err(StoreError::UnknownListener(id));
        }
        Ok(())
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn notify(&self, change: &StoreChange) {
        for (_, listener) in &self.listeners {
            listener(change, self);
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn gpio(&self) -> &GpioMap {
        &self.gpio
    }

    pub fn gpio_value(&self, gpio: &str) -> Option<&GpioValue> {
        self.gpio.get(gpio)
    }

    pub fn logs(&self) -> &LogBuffer {
        &self.logs
    }

    /// Number of successful mutations since creation.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            gpio: self
                .gpio
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            logs: self.logs.to_vec(),
            revision: self.revision,
        }
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(crate::DEFAULT_LOG_CAPACITY)
    }
}

impl fmt::Debug for StateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateStore")
            .field("gpio", &self.gpio)
            .field("logs", &self.logs.len())
            .field("listeners", &self.listeners.len())
            .field("revision", &self.revision)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    fn recorder(store: &mut StateStore) -> Arc<Mutex<Vec<StoreChange>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        store.subscribe(move |change, _| sink.lock().unwrap().push(change.clone()));
        seen
    }

    #[test]
    fn test_initial_state_replaces_both_collections() {
        let mut store = StateStore::new(10);
        store.apply_gpio_update("GPIO4", "LOW".into()).unwrap();
        store.append_log("stale");

        let mut gpio = GpioMap::new();
        gpio.insert("GPIO17".into(), "HIGH".into());
        store
            .apply_initial_state(gpio, vec!["boot".into(), "ready".into()])
            .unwrap();

        assert_eq!(store.gpio().len(), 1);
        assert!(store.gpio_value("GPIO4").is_none());
        assert_eq!(store.logs().to_vec(), vec!["boot", "ready"]);
    }

    #[test]
    fn test_listeners_called_in_registration_order() {
        let mut store = StateStore::new(10);
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 1..=3 {
            let order = order.clone();
            store.subscribe(move |_, _| order.lock().unwrap().push(n));
        }

        store.append_log("x");
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_listener_sees_complete_initial_state() {
        let mut store = StateStore::new(10);
        let observed = Arc::new(Mutex::new(None));
        let sink = observed.clone();
        store.subscribe(move |_, s| {
            *sink.lock().unwrap() = Some((s.gpio().len(), s.logs().len()));
        });

        let mut gpio = GpioMap::new();
        gpio.insert("a".into(), 1i64.into());
        gpio.insert("b".into(), 0i64.into());
        store
            .apply_initial_state(gpio, vec!["l1".into(), "l2".into(), "l3".into()])
            .unwrap();

        assert_eq!(*observed.lock().unwrap(), Some((2, 3)));
    }

    #[test]
    fn test_gpio_update_reports_previous_value() {
        let mut store = StateStore::new(10);
        let seen = recorder(&mut store);

        store.apply_gpio_update("GPIO17", "LOW".into()).unwrap();
        store.apply_gpio_update("GPIO17", "HIGH".into()).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            seen[1],
            StoreChange::GpioUpdated {
                gpio: "GPIO17".into(),
                value: "HIGH".into(),
                previous: Some("LOW".into()),
            }
        );
    }

    #[test]
    fn test_rejected_update_mutates_nothing() {
        let mut store = StateStore::new(10);
        let seen = recorder(&mut store);

        assert_eq!(
            store.apply_gpio_update("", "HIGH".into()),
            Err(StoreError::EmptyGpioId)
        );

        let mut gpio = GpioMap::new();
        gpio.insert(String::new(), "HIGH".into());
        assert!(store.apply_initial_state(gpio, vec!["x".into()]).is_err());

        assert!(store.gpio().is_empty());
        assert!(store.logs().is_empty());
        assert_eq!(store.revision(), 0);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unsubscribe() {
        let mut store = StateStore::new(10);
        let count = Arc::new(Mutex::new(0));
        let sink = count.clone();
        let id = store.subscribe(move |_, _| *sink.lock().unwrap() += 1);

        store.append_log("one");
        store.unsubscribe(id).unwrap();
        store.append_log("two");

        assert_eq!(*count.lock().unwrap(), 1);
        assert_eq!(store.unsubscribe(id), Err(StoreError::UnknownListener(id)));
        assert_eq!(store.listener_count(), 0);
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let mut store = StateStore::new(10);
        store.apply_gpio_update("b", "1".into()).unwrap();
        store.apply_gpio_update("a", "0".into()).unwrap();

        let snap = store.snapshot();
        let keys: Vec<_> = snap.gpio.keys().cloned().collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(snap.revision, 2);
    }

    fn gpio_update_strategy() -> impl Strategy<Value = (String, i64)> {
        ("GPIO[0-9]{1,2}", 0i64..2)
    }

    proptest! {
        /// Replaying gpio updates yields the last-write-wins fold.
        #[test]
        fn prop_gpio_updates_fold_last_write_wins(
            updates in prop::collection::vec(gpio_update_strategy(), 0..100)
        ) {
            let mut store = StateStore::new(10);
            let mut expected: HashMap<String, GpioValue> = HashMap::new();

            for (gpio, level) in &updates {
                store.apply_gpio_update(gpio.clone(), GpioValue::from(*level)).unwrap();
                expected.insert(gpio.clone(), GpioValue::from(*level));
            }

            prop_assert_eq!(store.gpio(), &expected);
        }

        /// Appends after an initial state keep the initial logs as prefix.
        #[test]
        fn prop_initial_logs_stay_prefix(
            initial in prop::collection::vec("[a-z ]{0,12}", 0..50),
            appended in prop::collection::vec("[a-z ]{0,12}", 0..50),
        ) {
            let mut store = StateStore::new(0);
            store.apply_initial_state(GpioMap::new(), initial.clone()).unwrap();
            for line in &appended {
                store.append_log(line.clone());
            }

            let logs = store.logs().to_vec();
            prop_assert_eq!(&logs[..initial.len()], &initial[..]);
            prop_assert_eq!(&logs[initial.len()..], &appended[..]);
        }
    }
}
