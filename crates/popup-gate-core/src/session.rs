use std::collections::BTreeSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::trigger::{ScrollMetrics, TriggerCondition, TriggerConfig, TriggerSource};
use crate::{KeyValueStore, PopupController, PopupError, Scope};

/// Rendering side of a popup: shows or hides the element named `element_id`.
///
/// Implementations must treat an unknown element as a no-op.
pub trait Presenter {
    fn toggle_visible(&mut self, element_id: &str, visible: bool);

    fn is_visible(&self, element_id: &str) -> bool;
}

/// Presenter that keeps the set of visible elements in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingPresenter {
    known: Option<BTreeSet<String>>,
    visible: BTreeSet<String>,
}

impl RecordingPresenter {
    /// Accepts any element id.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts only the listed element ids, as a page with fixed markup would.
    pub fn with_elements<I, T>(elements: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            known: Some(elements.into_iter().map(Into::into).collect()),
            visible: BTreeSet::new(),
        }
    }

    pub fn visible(&self) -> impl Iterator<Item = &str> {
        self.visible.iter().map(String::as_str)
    }
}

impl Presenter for RecordingPresenter {
    fn toggle_visible(&mut self, element_id: &str, visible: bool) {
        if let Some(known) = &self.known {
            if !known.contains(element_id) {
                debug!(element_id, "no such popup element");
                return;
            }
        }

        if visible {
            self.visible.insert(element_id.to_string());
        } else {
            self.visible.remove(element_id);
        }
    }

    fn is_visible(&self, element_id: &str) -> bool {
        self.visible.contains(element_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PageEvent {
    Load { path: String },
    Scroll(ScrollMetrics),
    Elapsed { ms: u64 },
    KeyPress { key: String },
    CloseClicked { element: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Presentation {
    pub id: String,
    pub element: String,
    pub scope: Scope,
    /// Milliseconds since the page finished loading.
    pub at_ms: u64,
}

#[derive(Debug, Clone)]
struct Pending {
    trigger: TriggerSource,
    due_ms: Option<u64>,
}

/// One page load: routes page events to the trigger sources of the loaded
/// page and presents popups through the controller.
pub struct PageSession<'a, D, S, P> {
    controller: &'a mut PopupController<D, S>,
    presenter: &'a mut P,
    config: &'a TriggerConfig,
    rng: StdRng,
    path: Option<String>,
    elapsed_ms: u64,
    pending: Vec<Pending>,
    open: BTreeSet<String>,
    log: Vec<Presentation>,
}

impl<'a, D, S, P> PageSession<'a, D, S, P>
where
    D: KeyValueStore,
    S: KeyValueStore,
    P: Presenter,
{
    pub fn new(
        controller: &'a mut PopupController<D, S>,
        presenter: &'a mut P,
        config: &'a TriggerConfig,
    ) -> Self {
        Self::with_rng(controller, presenter, config, StdRng::from_entropy())
    }

    /// Same as [`Self::new`] with reproducible randomized delays.
    pub fn with_seed(
        controller: &'a mut PopupController<D, S>,
        presenter: &'a mut P,
        config: &'a TriggerConfig,
        seed: u64,
    ) -> Self {
        Self::with_rng(controller, presenter, config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        controller: &'a mut PopupController<D, S>,
        presenter: &'a mut P,
        config: &'a TriggerConfig,
        rng: StdRng,
    ) -> Self {
        Self {
            controller,
            presenter,
            config,
            rng,
            path: None,
            elapsed_ms: 0,
            pending: Vec::new(),
            open: BTreeSet::new(),
            log: Vec::new(),
        }
    }

    #[must_use]
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    #[must_use]
    pub fn presentations(&self) -> &[Presentation] {
        &self.log
    }

    /// Elements this session made visible and that are still open.
    pub fn open_elements(&self) -> impl Iterator<Item = &str> {
        self.open.iter().map(String::as_str)
    }

    /// Trigger ids still waiting for their condition.
    pub fn pending_ids(&self) -> impl Iterator<Item = &str> {
        self.pending.iter().map(|pending| pending.trigger.id.as_str())
    }

    /// Applies one page event and returns the popups it presented.
    ///
    /// # Errors
    /// Returns [`PopupError::Validation`] on a second `Load` (navigation
    /// starts a new session) and [`PopupError::Configuration`] when `Load`
    /// meets an invalid trigger configuration. A trigger that fails while
    /// firing is logged and skipped.
    pub fn handle(&mut self, event: &PageEvent) -> Result<Vec<Presentation>, PopupError> {
        match event {
            PageEvent::Load { path } => {
                self.load(path)?;
                Ok(self.fire_due_delays())
            }
            PageEvent::Elapsed { ms } => {
                self.elapsed_ms = self.elapsed_ms.saturating_add(*ms);
                Ok(self.fire_due_delays())
            }
            PageEvent::Scroll(metrics) => Ok(self.fire_scroll(metrics)),
            PageEvent::KeyPress { key } => {
                if key == "Escape" {
                    self.close_all();
                }
                Ok(Vec::new())
            }
            PageEvent::CloseClicked { element } => {
                self.close(element);
                Ok(Vec::new())
            }
        }
    }

    /// Applies events in order and returns everything presented.
    ///
    /// # Errors
    /// Stops at the first event that fails; see [`Self::handle`].
    pub fn run<'e, I>(&mut self, events: I) -> Result<Vec<Presentation>, PopupError>
    where
        I: IntoIterator<Item = &'e PageEvent>,
    {
        let mut presented = Vec::new();
        for event in events {
            presented.extend(self.handle(event)?);
        }
        Ok(presented)
    }

    fn load(&mut self, path: &str) -> Result<(), PopupError> {
        if let Some(current) = &self.path {
            return Err(PopupError::Validation(format!(
                "page {current} is already loaded; navigation requires a new page session"
            )));
        }

        self.config.validate()?;

        let mut pending = Vec::new();
        for trigger in self.config.for_page(path) {
            let due_ms = match trigger.condition {
                TriggerCondition::Delay { min_ms, max_ms } if min_ms < max_ms => {
                    Some(self.rng.gen_range(min_ms..max_ms))
                }
                TriggerCondition::Delay { min_ms, .. } => Some(min_ms),
                _ => None,
            };
            pending.push(Pending {
                trigger: trigger.clone(),
                due_ms,
            });
        }

        debug!(path, triggers = pending.len(), "page loaded");
        self.path = Some(path.to_string());
        self.elapsed_ms = 0;
        self.pending = pending;
        Ok(())
    }

    fn fire_due_delays(&mut self) -> Vec<Presentation> {
        let elapsed = self.elapsed_ms;
        let mut due: Vec<(u64, TriggerSource)> = Vec::new();
        self.pending.retain(|pending| match pending.due_ms {
            Some(due_ms) if due_ms <= elapsed => {
                due.push((due_ms, pending.trigger.clone()));
                false
            }
            _ => true,
        });
        due.sort_by_key(|(due_ms, _)| *due_ms);

        self.fire_all(due.into_iter().map(|(_, trigger)| trigger))
    }

    fn fire_scroll(&mut self, metrics: &ScrollMetrics) -> Vec<Presentation> {
        let mut satisfied = Vec::new();
        self.pending.retain(|pending| {
            if pending.trigger.condition.scroll_satisfied(metrics) {
                satisfied.push(pending.trigger.clone());
                false
            } else {
                true
            }
        });

        self.fire_all(satisfied)
    }

    /// Fires each trigger in turn; one failing trigger never holds back the rest.
    fn fire_all<I>(&mut self, triggers: I) -> Vec<Presentation>
    where
        I: IntoIterator<Item = TriggerSource>,
    {
        let mut presented = Vec::new();
        for trigger in triggers {
            match self.fire(&trigger) {
                Ok(Some(presentation)) => presented.push(presentation),
                Ok(None) => {}
                Err(err) => {
                    warn!(id = %trigger.id, error = %err, "popup trigger failed; skipping it");
                }
            }
        }
        presented
    }

    fn fire(&mut self, trigger: &TriggerSource) -> Result<Option<Presentation>, PopupError> {
        let presenter = &mut *self.presenter;
        let element = trigger.element.as_str();
        let shown = self.controller.try_present(&trigger.id, trigger.scope, || {
            presenter.toggle_visible(element, true);
        })?;

        if !shown {
            return Ok(None);
        }

        if self.presenter.is_visible(element) {
            self.open.insert(trigger.element.clone());
        }
        let presentation = Presentation {
            id: trigger.id.clone(),
            element: trigger.element.clone(),
            scope: trigger.scope,
            at_ms: self.elapsed_ms,
        };
        self.log.push(presentation.clone());
        Ok(Some(presentation))
    }

    fn close(&mut self, element: &str) {
        if self.open.remove(element) {
            self.presenter.toggle_visible(element, false);
        }
    }

    fn close_all(&mut self) {
        for element in std::mem::take(&mut self.open) {
            self.presenter.toggle_visible(&element, false);
        }
    }
}
