use serde::Deserialize;

use crate::error::SettingsError;

/// Which collaborators continue suspended chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerKind {
    /// The calling thread's tokio runtime if there is one, else OS threads.
    #[default]
    Auto,
    Tokio,
    Thread,
}

/// Composition settings as they appear in a host's TOML configuration.
///
/// ```toml
/// run-synchronously = true
/// scheduler = "tokio"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct ComposerSettings {
    run_synchronously: bool,
    scheduler: SchedulerKind,
}

impl Default for ComposerSettings {
    fn default() -> Self {
        Self {
            run_synchronously: true,
            scheduler: SchedulerKind::default(),
        }
    }
}

impl ComposerSettings {
    /// Parse settings from a TOML document or table body.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Parse`] for malformed TOML, unknown keys or
    /// unknown scheduler names.
    pub fn from_toml_str(input: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(input)?)
    }

    #[must_use]
    pub fn run_synchronously(&self) -> bool {
        self.run_synchronously
    }

    #[must_use]
    pub fn scheduler(&self) -> SchedulerKind {
        self.scheduler
    }

    #[must_use]
    pub fn with_run_synchronously(mut self, run_synchronously: bool) -> Self {
        self.run_synchronously = run_synchronously;
        self
    }

    #[must_use]
    pub fn with_scheduler(mut self, scheduler: SchedulerKind) -> Self {
        self.scheduler = scheduler;
        self
    }
}
