use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{PopupError, Scope};

/// Scroll position of the page at the time a scroll event fires.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct ScrollMetrics {
    pub scroll_y: f64,
    pub viewport_height: f64,
    pub document_height: f64,
}

impl ScrollMetrics {
    /// Fraction of the scrollable range already scrolled, or `None` when the
    /// document is not taller than the viewport.
    #[must_use]
    pub fn scrolled_fraction(&self) -> Option<f64> {
        let scrollable = self.document_height - self.viewport_height;
        if scrollable <= 0.0 {
            return None;
        }
        Some(self.scroll_y / scrollable)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerCondition {
    /// Fires `min_ms..max_ms` after load; a fixed delay when both are equal.
    Delay { min_ms: u64, max_ms: u64 },
    /// Fires once `scroll_y / (document - viewport)` reaches `at_least`.
    ScrollFraction { at_least: f64 },
    /// Fires once `scroll_y` reaches `fraction_of_document` of the document height.
    ScrollOffset { fraction_of_document: f64 },
    /// Fires when the viewport bottom is within `slack_px` of the document end.
    NearBottom { slack_px: f64 },
}

impl TriggerCondition {
    #[must_use]
    pub fn scroll_satisfied(&self, metrics: &ScrollMetrics) -> bool {
        match self {
            Self::Delay { .. } => false,
            Self::ScrollFraction { at_least } => metrics
                .scrolled_fraction()
                .is_some_and(|fraction| fraction >= *at_least),
            Self::ScrollOffset {
                fraction_of_document,
            } => metrics.scroll_y >= metrics.document_height * fraction_of_document,
            Self::NearBottom { slack_px } => {
                metrics.viewport_height + metrics.scroll_y >= metrics.document_height - slack_px
            }
        }
    }

    /// # Errors
    /// Returns [`PopupError::Configuration`] for thresholds outside their range.
    pub fn validate(&self) -> Result<(), PopupError> {
        match self {
            Self::Delay { min_ms, max_ms } => {
                if min_ms > max_ms {
                    return Err(PopupError::Configuration(format!(
                        "delay min_ms ({min_ms}) MUST NOT exceed max_ms ({max_ms})"
                    )));
                }
            }
            Self::ScrollFraction { at_least: value }
            | Self::ScrollOffset {
                fraction_of_document: value,
            } => {
                if !(0.0..=1.0).contains(value) {
                    return Err(PopupError::Configuration(format!(
                        "scroll fraction MUST be in [0.0, 1.0], got {value}"
                    )));
                }
            }
            Self::NearBottom { slack_px } => {
                if !slack_px.is_finite() || *slack_px < 0.0 {
                    return Err(PopupError::Configuration(format!(
                        "slack_px MUST be a non-negative number, got {slack_px}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Page identity, inferred from the URL path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PageMatch {
    Any,
    /// Directory index such as `/` or `/portfolio/`.
    Root,
    Contains(String),
    AnyOf(Vec<PageMatch>),
}

impl PageMatch {
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Root => path.ends_with('/'),
            Self::Contains(fragment) => path.contains(fragment.as_str()),
            Self::AnyOf(options) => options.iter().any(|option| option.matches(path)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerSource {
    pub id: String,
    pub element: String,
    pub scope: Scope,
    pub page: PageMatch,
    pub condition: TriggerCondition,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TriggerConfig {
    pub triggers: Vec<TriggerSource>,
}

impl TriggerConfig {
    /// Popups of the portfolio site this crate grew out of.
    #[must_use]
    pub fn builtin() -> Self {
        let home_page = PageMatch::AnyOf(vec![
            PageMatch::Contains("index".to_string()),
            PageMatch::Root,
        ]);

        Self {
            triggers: vec![
                TriggerSource {
                    id: "welcome".to_string(),
                    element: "welcomePopup".to_string(),
                    scope: Scope::Visitor,
                    page: home_page.clone(),
                    condition: TriggerCondition::Delay {
                        min_ms: 800,
                        max_ms: 800,
                    },
                },
                TriggerSource {
                    id: "home".to_string(),
                    element: "homePopup".to_string(),
                    scope: Scope::Session,
                    page: home_page,
                    condition: TriggerCondition::Delay {
                        min_ms: 5_000,
                        max_ms: 7_000,
                    },
                },
                TriggerSource {
                    id: "scroll".to_string(),
                    element: "scrollPopup".to_string(),
                    scope: Scope::Session,
                    page: PageMatch::Any,
                    condition: TriggerCondition::ScrollFraction { at_least: 0.70 },
                },
                TriggerSource {
                    id: "story".to_string(),
                    element: "storyPopup".to_string(),
                    scope: Scope::Session,
                    page: PageMatch::Contains("about".to_string()),
                    condition: TriggerCondition::NearBottom { slack_px: 2.0 },
                },
                TriggerSource {
                    id: "end".to_string(),
                    element: "endPopup".to_string(),
                    scope: Scope::Once,
                    page: PageMatch::Contains("about".to_string()),
                    condition: TriggerCondition::ScrollFraction { at_least: 0.95 },
                },
                TriggerSource {
                    id: "skills".to_string(),
                    element: "skillsPopup".to_string(),
                    scope: Scope::Session,
                    page: PageMatch::Contains("skills".to_string()),
                    condition: TriggerCondition::ScrollOffset {
                        fraction_of_document: 0.5,
                    },
                },
                TriggerSource {
                    id: "ai".to_string(),
                    element: "aiPopup".to_string(),
                    scope: Scope::Once,
                    page: PageMatch::Contains("skills".to_string()),
                    condition: TriggerCondition::Delay {
                        min_ms: 1_000,
                        max_ms: 1_000,
                    },
                },
            ],
        }
    }

    /// Parses and validates a JSON trigger configuration.
    ///
    /// # Errors
    /// Returns [`PopupError::Configuration`] when the document is malformed or
    /// fails [`Self::validate`].
    pub fn from_json(raw: &str) -> Result<Self, PopupError> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|err| PopupError::Configuration(format!("invalid trigger config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Each popup id must have exactly one owning trigger source.
    ///
    /// # Errors
    /// Returns [`PopupError::Configuration`] for blank or duplicate ids, blank
    /// element ids, and out-of-range conditions.
    pub fn validate(&self) -> Result<(), PopupError> {
        let mut seen = BTreeSet::new();
        for trigger in &self.triggers {
            if trigger.id.trim().is_empty() {
                return Err(PopupError::Configuration(
                    "trigger id MUST be non-empty".to_string(),
                ));
            }
            if trigger.element.trim().is_empty() {
                return Err(PopupError::Configuration(format!(
                    "trigger {} MUST name an element",
                    trigger.id
                )));
            }
            if !seen.insert(trigger.id.as_str()) {
                return Err(PopupError::Configuration(format!(
                    "popup id {} is owned by more than one trigger",
                    trigger.id
                )));
            }
            trigger.condition.validate()?;
        }
        Ok(())
    }

    pub fn for_page<'a>(&'a self, path: &'a str) -> impl Iterator<Item = &'a TriggerSource> + 'a {
        self.triggers
            .iter()
            .filter(move |trigger| trigger.page.matches(path))
    }
}
