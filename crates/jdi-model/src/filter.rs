//! Step filters: code a step-into should pass through without stopping.

use globset::{Glob, GlobSet, GlobSetBuilder};

use jdi_config::StepFilterConfig;

use crate::session::{Location, Method};

/// A compiled snapshot of the step filter options.
///
/// Snapshots are immutable; callers pass one into each step so a change to
/// the configuration never affects a step already in flight.
#[derive(Debug, Clone)]
pub struct StepFilters {
    enabled: bool,
    filter_statics: bool,
    filter_synthetics: bool,
    filter_constructors: bool,
    active_patterns: Vec<String>,
    matcher: GlobSet,
}

impl StepFilters {
    pub fn from_config(config: &StepFilterConfig) -> Self {
        let mut builder = GlobSetBuilder::new();
        let mut active_patterns = Vec::with_capacity(config.active_patterns.len());
        for pattern in &config.active_patterns {
            match Glob::new(pattern) {
                Ok(glob) => {
                    builder.add(glob);
                    active_patterns.push(pattern.clone());
                }
                Err(err) => {
                    tracing::warn!(
                        target: "jdi.model",
                        pattern = %pattern,
                        error = %err,
                        "ignoring invalid step filter pattern"
                    );
                }
            }
        }
        let matcher = builder.build().unwrap_or_else(|err| {
            tracing::warn!(target: "jdi.model", error = %err, "failed to compile step filters");
            GlobSet::empty()
        });

        Self {
            enabled: config.enabled,
            filter_statics: config.filter_statics,
            filter_synthetics: config.filter_synthetics,
            filter_constructors: config.filter_constructors,
            active_patterns,
            matcher,
        }
    }

    /// No filtering at all, even with a per-step override.
    pub fn none() -> Self {
        Self {
            enabled: false,
            filter_statics: false,
            filter_synthetics: false,
            filter_constructors: false,
            active_patterns: Vec::new(),
            matcher: GlobSet::empty(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether filtering applies to a step, given the per-step override.
    pub fn applies(&self, use_override: bool) -> bool {
        self.enabled || use_override
    }

    pub fn active_patterns(&self) -> &[String] {
        &self.active_patterns
    }

    pub fn has_active_patterns(&self) -> bool {
        !self.active_patterns.is_empty()
    }

    /// `type_name` is a fully qualified class name such as `java.util.HashMap`.
    pub fn type_is_filtered(&self, type_name: &str) -> bool {
        self.matcher.is_match(type_name)
    }

    fn any_category(&self) -> bool {
        self.filter_statics || self.filter_synthetics || self.filter_constructors
    }

    pub fn method_is_filtered(&self, method: &Method) -> bool {
        if !self.any_category() {
            return false;
        }
        (self.filter_statics && method.is_static_initializer())
            || (self.filter_synthetics && method.is_synthetic())
            || (self.filter_constructors && method.is_constructor())
    }

    pub fn location_is_filtered(&self, location: &Location, use_override: bool) -> bool {
        self.applies(use_override)
            && (self.method_is_filtered(&location.method)
                || self.type_is_filtered(&location.method.declaring_type))
    }
}

impl Default for StepFilters {
    fn default() -> Self {
        Self::from_config(&StepFilterConfig::default())
    }
}
