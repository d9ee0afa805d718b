//! Popup visibility and frequency control.
//!
//! A [`PopupController`] answers one question for page scripts: has popup
//! `id` already been shown within [`Scope`], and may it be shown now. It owns
//! a durable store, a session-lifetime store and the in-memory `once` set for
//! a single page load. Trigger sources ([`TriggerSource`]) and the page event
//! loop ([`PageSession`]) sit on top of it.

use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::rc::Rc;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, warn};

mod session;
mod trigger;

pub use session::{PageEvent, PageSession, Presentation, Presenter, RecordingPresenter};
pub use trigger::{PageMatch, ScrollMetrics, TriggerCondition, TriggerConfig, TriggerSource};

/// Validity window of the `day` scope.
pub const DAY_MILLIS: i64 = 86_400_000;

const SHOWN_FLAG: &str = "true";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PopupError {
    #[error("invalid scope: {0}")]
    InvalidScope(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Remembered indefinitely in the durable store.
    Visitor,
    /// Remembered for the lifetime of the session store.
    Session,
    /// Remembered for 24 hours after the last presentation.
    Day,
    /// Remembered for the current page load only; never persisted.
    Once,
}

impl Scope {
    pub const ALL: [Scope; 4] = [Self::Visitor, Self::Session, Self::Day, Self::Once];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Visitor => "visitor",
            Self::Session => "session",
            Self::Day => "day",
            Self::Once => "once",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "visitor" => Some(Self::Visitor),
            "session" => Some(Self::Session),
            "day" => Some(Self::Day),
            "once" => Some(Self::Once),
            _ => None,
        }
    }
}

impl Display for Scope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = PopupError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value).ok_or_else(|| PopupError::InvalidScope(value.to_string()))
    }
}

/// Storage key holding the `"true"` flag for `visitor` and `session` scopes.
#[must_use]
pub fn viewed_key(id: &str) -> String {
    format!("popup_{id}_viewed")
}

/// Storage key holding the epoch-millisecond timestamp for the `day` scope.
#[must_use]
pub fn timestamp_key(id: &str) -> String {
    format!("popup_{id}_timestamp")
}

/// String key-value store with browser storage semantics.
pub trait KeyValueStore {
    /// # Errors
    /// Returns [`StoreError::Unavailable`] when the backing storage cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// # Errors
    /// Returns [`StoreError::Unavailable`] when the backing storage cannot be written.
    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Box<T> {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        (**self).get(key)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        (**self).set(key, value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStore {
    entries: BTreeMap<String, String>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

pub trait Clock {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        i64::try_from(millis).unwrap_or(i64::MAX)
    }
}

/// Manually driven clock. Clones share the same instant.
#[derive(Debug, Clone, Default)]
pub struct FixedClock {
    now: Rc<Cell<i64>>,
}

impl FixedClock {
    #[must_use]
    pub fn new(now_millis: i64) -> Self {
        Self {
            now: Rc::new(Cell::new(now_millis)),
        }
    }

    pub fn set(&self, now_millis: i64) {
        self.now.set(now_millis);
    }

    pub fn advance(&self, millis: i64) {
        self.now.set(self.now.get().saturating_add(millis));
    }
}

impl Clock for FixedClock {
    fn now_millis(&self) -> i64 {
        self.now.get()
    }
}

/// Single source of truth for "has popup P been shown in scope S".
///
/// One controller serves one page load: the durable and session stores
/// outlive it, the `once` set does not. Use [`PopupController::into_stores`]
/// to carry the stores over to the next load.
pub struct PopupController<D, S> {
    durable: D,
    session: S,
    once: BTreeSet<String>,
    clock: Box<dyn Clock>,
}

impl<D: KeyValueStore, S: KeyValueStore> PopupController<D, S> {
    pub fn new(durable: D, session: S) -> Self {
        Self {
            durable,
            session,
            once: BTreeSet::new(),
            clock: Box::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn durable(&self) -> &D {
        &self.durable
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    /// Ends the page load, dropping `once` state and returning the stores.
    pub fn into_stores(self) -> (D, S) {
        (self.durable, self.session)
    }

    /// Reports whether `id` is still inside its validity window for `scope`.
    ///
    /// Unreadable storage counts as "not shown" so that a broken store never
    /// blocks the page.
    ///
    /// # Errors
    /// Returns [`PopupError::Validation`] when `id` is blank.
    pub fn has_been_shown(&self, id: &str, scope: Scope) -> Result<bool, PopupError> {
        validate_id(id)?;

        let shown = match scope {
            Scope::Visitor => read_flag(&self.durable, &viewed_key(id), scope),
            Scope::Session => read_flag(&self.session, &viewed_key(id), scope),
            Scope::Day => match read_timestamp(&self.durable, &timestamp_key(id)) {
                Some(recorded) => self.clock.now_millis().saturating_sub(recorded) < DAY_MILLIS,
                None => false,
            },
            Scope::Once => self.once.contains(id),
        };
        Ok(shown)
    }

    /// Records that `id` was shown in `scope`.
    ///
    /// Write failures are logged and otherwise ignored.
    ///
    /// # Errors
    /// Returns [`PopupError::Validation`] when `id` is blank.
    pub fn mark_shown(&mut self, id: &str, scope: Scope) -> Result<(), PopupError> {
        validate_id(id)?;

        match scope {
            Scope::Visitor => write_value(&mut self.durable, &viewed_key(id), SHOWN_FLAG),
            Scope::Session => write_value(&mut self.session, &viewed_key(id), SHOWN_FLAG),
            Scope::Day => {
                let now = self.clock.now_millis().to_string();
                write_value(&mut self.durable, &timestamp_key(id), &now);
            }
            Scope::Once => {
                self.once.insert(id.to_string());
            }
        }
        Ok(())
    }

    /// Presents `id` through `present` unless it was already shown in `scope`.
    ///
    /// Returns `Ok(true)` when `present` ran.
    ///
    /// # Errors
    /// Returns [`PopupError::Validation`] when `id` is blank.
    pub fn try_present<F>(&mut self, id: &str, scope: Scope, present: F) -> Result<bool, PopupError>
    where
        F: FnOnce(),
    {
        if self.has_been_shown(id, scope)? {
            debug!(popup_id = id, %scope, "popup suppressed");
            return Ok(false);
        }

        present();
        self.mark_shown(id, scope)?;
        debug!(popup_id = id, %scope, "popup presented");
        Ok(true)
    }

    /// [`Self::has_been_shown`] for scope names read from configuration.
    ///
    /// # Errors
    /// Returns [`PopupError::InvalidScope`] for an unknown scope name and
    /// [`PopupError::Validation`] for a blank `id`.
    pub fn has_been_shown_raw(&self, id: &str, scope: &str) -> Result<bool, PopupError> {
        self.has_been_shown(id, scope.parse()?)
    }

    /// [`Self::mark_shown`] for scope names read from configuration.
    ///
    /// # Errors
    /// Returns [`PopupError::InvalidScope`] for an unknown scope name and
    /// [`PopupError::Validation`] for a blank `id`.
    pub fn mark_shown_raw(&mut self, id: &str, scope: &str) -> Result<(), PopupError> {
        self.mark_shown(id, scope.parse()?)
    }

    /// [`Self::try_present`] for scope names read from configuration.
    ///
    /// # Errors
    /// Returns [`PopupError::InvalidScope`] for an unknown scope name and
    /// [`PopupError::Validation`] for a blank `id`.
    pub fn try_present_raw<F>(&mut self, id: &str, scope: &str, present: F) -> Result<bool, PopupError>
    where
        F: FnOnce(),
    {
        self.try_present(id, scope.parse()?, present)
    }
}

fn validate_id(id: &str) -> Result<(), PopupError> {
    if id.trim().is_empty() {
        return Err(PopupError::Validation(
            "popup id MUST be non-empty".to_string(),
        ));
    }
    Ok(())
}

fn read_flag<T: KeyValueStore>(store: &T, key: &str, scope: Scope) -> bool {
    match store.get(key) {
        Ok(value) => value.as_deref() == Some(SHOWN_FLAG),
        Err(err) => {
            warn!(key, %scope, error = %err, "popup store read failed; treating popup as not shown");
            false
        }
    }
}

fn read_timestamp<T: KeyValueStore>(store: &T, key: &str) -> Option<i64> {
    let raw = match store.get(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(err) => {
            warn!(key, error = %err, "popup store read failed; treating popup as not shown");
            return None;
        }
    };

    match raw.trim().parse::<i64>() {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(key, raw = %raw, error = %err, "ignoring unparsable popup timestamp");
            None
        }
    }
}

fn write_value<T: KeyValueStore>(store: &mut T, key: &str, value: &str) {
    if let Err(err) = store.set(key, value) {
        warn!(key, error = %err, "popup store write failed; popup may be shown again");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[derive(Debug, Default)]
    struct UnavailableStore;

    impl KeyValueStore for UnavailableStore {
        fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Unavailable("storage disabled".to_string()))
        }

        fn set(&mut self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("quota exceeded".to_string()))
        }
    }

    fn fixture_controller(now: i64) -> (PopupController<MemoryStore, MemoryStore>, FixedClock) {
        let clock = FixedClock::new(now);
        let controller =
            PopupController::new(MemoryStore::new(), MemoryStore::new()).with_clock(clock.clone());
        (controller, clock)
    }

    #[test]
    fn welcome_popup_is_presented_once_per_visitor() {
        let (mut controller, _clock) = fixture_controller(0);
        let mut calls = 0;

        let first = must_ok(controller.try_present("welcome", Scope::Visitor, || calls += 1));
        assert!(first);
        assert_eq!(calls, 1);
        assert_eq!(
            must_ok(controller.durable().get("popup_welcome_viewed")),
            Some("true".to_string())
        );

        let second = must_ok(controller.try_present("welcome", Scope::Visitor, || calls += 1));
        assert!(!second);
        assert_eq!(calls, 1);
    }

    #[test]
    fn every_scope_presents_at_most_once() {
        let (mut controller, _clock) = fixture_controller(5_000);
        for scope in Scope::ALL {
            let mut calls = 0;
            for _ in 0..3 {
                must_ok(controller.try_present("promo", scope, || calls += 1));
            }
            assert_eq!(calls, 1, "scope {scope} presented more than once");
        }
    }

    #[test]
    fn day_scope_expires_after_twenty_four_hours() {
        let (mut controller, clock) = fixture_controller(1_000_000);
        must_ok(controller.mark_shown("scroll", Scope::Day));
        assert_eq!(
            must_ok(controller.durable().get("popup_scroll_timestamp")),
            Some("1000000".to_string())
        );

        clock.set(1_000_000 + DAY_MILLIS - 1);
        assert!(must_ok(controller.has_been_shown("scroll", Scope::Day)));

        clock.set(1_000_000 + 86_400_001);
        assert!(!must_ok(controller.has_been_shown("scroll", Scope::Day)));
    }

    #[test]
    fn day_scope_allows_reshow_once_expired() {
        let (mut controller, clock) = fixture_controller(0);
        let mut calls = 0;
        must_ok(controller.try_present("daily", Scope::Day, || calls += 1));
        clock.advance(DAY_MILLIS);
        must_ok(controller.try_present("daily", Scope::Day, || calls += 1));
        must_ok(controller.try_present("daily", Scope::Day, || calls += 1));
        assert_eq!(calls, 2);
    }

    #[test]
    fn session_flag_is_not_visible_to_a_new_session_store() {
        let (mut controller, _clock) = fixture_controller(0);
        must_ok(controller.mark_shown("scroll", Scope::Session));
        assert!(must_ok(controller.has_been_shown("scroll", Scope::Session)));

        let (durable, _old_session) = controller.into_stores();
        let controller = PopupController::new(durable, MemoryStore::new());
        assert!(!must_ok(controller.has_been_shown("scroll", Scope::Session)));
    }

    #[test]
    fn once_flag_does_not_survive_a_reload() {
        let (mut controller, _clock) = fixture_controller(0);
        must_ok(controller.mark_shown("home", Scope::Once));
        must_ok(controller.mark_shown("welcome", Scope::Visitor));
        assert!(must_ok(controller.has_been_shown("home", Scope::Once)));

        let (durable, session) = controller.into_stores();
        let reloaded = PopupController::new(durable, session);
        assert!(!must_ok(reloaded.has_been_shown("home", Scope::Once)));
        assert!(must_ok(reloaded.has_been_shown("welcome", Scope::Visitor)));
    }

    #[test]
    fn once_scope_is_never_persisted() {
        let (mut controller, _clock) = fixture_controller(0);
        must_ok(controller.mark_shown("home", Scope::Once));
        assert!(controller.durable().is_empty());
        assert!(controller.session().is_empty());
    }

    #[test]
    fn marking_twice_matches_marking_once() {
        for scope in Scope::ALL {
            let (mut once, _) = fixture_controller(42);
            let (mut twice, _) = fixture_controller(42);
            must_ok(once.mark_shown("skills", scope));
            must_ok(twice.mark_shown("skills", scope));
            must_ok(twice.mark_shown("skills", scope));

            assert_eq!(once.durable(), twice.durable());
            assert_eq!(once.session(), twice.session());
            assert_eq!(
                must_ok(once.has_been_shown("skills", scope)),
                must_ok(twice.has_been_shown("skills", scope))
            );
        }
    }

    #[test]
    fn unknown_scope_is_rejected() {
        let (mut controller, _clock) = fixture_controller(0);
        assert_eq!(
            controller.has_been_shown_raw("welcome", "weekly"),
            Err(PopupError::InvalidScope("weekly".to_string()))
        );
        assert_eq!(
            controller.mark_shown_raw("welcome", "weekly"),
            Err(PopupError::InvalidScope("weekly".to_string()))
        );

        let mut called = false;
        let result = controller.try_present_raw("welcome", "Weekly", || called = true);
        assert!(matches!(result, Err(PopupError::InvalidScope(_))));
        assert!(!called);
        assert!(controller.durable().is_empty());
    }

    #[test]
    fn raw_scope_names_round_trip() {
        for scope in Scope::ALL {
            assert_eq!(must_ok(scope.as_str().parse::<Scope>()), scope);
        }
        let (mut controller, _clock) = fixture_controller(0);
        assert!(must_ok(controller.try_present_raw("welcome", "visitor", || {})));
        assert!(must_ok(controller.has_been_shown_raw("welcome", "visitor")));
    }

    #[test]
    fn blank_id_is_rejected() {
        let (mut controller, _clock) = fixture_controller(0);
        assert!(matches!(
            controller.has_been_shown("  ", Scope::Visitor),
            Err(PopupError::Validation(_))
        ));
        assert!(matches!(
            controller.mark_shown("", Scope::Once),
            Err(PopupError::Validation(_))
        ));
    }

    #[test]
    fn unavailable_store_fails_open() {
        let mut controller = PopupController::new(UnavailableStore, UnavailableStore)
            .with_clock(FixedClock::new(0));

        for scope in [Scope::Visitor, Scope::Session, Scope::Day] {
            let mut calls = 0;
            assert!(must_ok(controller.try_present("welcome", scope, || calls += 1)));
            assert!(must_ok(controller.try_present("welcome", scope, || calls += 1)));
            assert_eq!(calls, 2);
        }

        // The in-memory scope does not depend on storage.
        assert!(must_ok(controller.try_present("welcome", Scope::Once, || {})));
        assert!(!must_ok(controller.try_present("welcome", Scope::Once, || {})));
    }

    #[test]
    fn corrupt_day_timestamp_reads_as_not_shown() {
        let mut durable = MemoryStore::new();
        must_ok(durable.set("popup_promo_timestamp", "not-a-number"));
        let controller =
            PopupController::new(durable, MemoryStore::new()).with_clock(FixedClock::new(10));
        assert!(!must_ok(controller.has_been_shown("promo", Scope::Day)));
    }

    #[test]
    fn visitor_flag_requires_exact_true_value() {
        let mut durable = MemoryStore::new();
        must_ok(durable.set("popup_welcome_viewed", "yes"));
        let controller = PopupController::new(durable, MemoryStore::new());
        assert!(!must_ok(controller.has_been_shown("welcome", Scope::Visitor)));
    }

    proptest! {
        #[test]
        fn day_window_boundary_holds(start in 0_i64..4_000_000_000_000, offset in 0_i64..(3 * DAY_MILLIS)) {
            let (mut controller, clock) = fixture_controller(start);
            must_ok(controller.mark_shown("scroll", Scope::Day));
            clock.set(start + offset);
            let shown = must_ok(controller.has_been_shown("scroll", Scope::Day));
            prop_assert_eq!(shown, offset < DAY_MILLIS);
        }

        #[test]
        fn present_runs_exactly_once_per_window(attempts in 1_usize..20, scope_index in 0_usize..4) {
            let scope = Scope::ALL[scope_index];
            let (mut controller, _clock) = fixture_controller(7);
            let mut calls = 0;
            let mut accepted = 0;
            for _ in 0..attempts {
                if must_ok(controller.try_present("scroll", scope, || calls += 1)) {
                    accepted += 1;
                }
            }
            prop_assert_eq!(calls, 1);
            prop_assert_eq!(accepted, 1);
        }
    }
}
