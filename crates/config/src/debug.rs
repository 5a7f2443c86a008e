//! Debug sink configuration settings.

use std::path::PathBuf;

use serde::Deserialize;

/// Debug sink configuration. When a path is set, the adapter writes a JSON
/// report for each provider or streaming failure into that directory.
#[derive(Default, Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DebugConfig {
    /// Directory to write failure reports into. Unset disables the sink.
    pub path: Option<PathBuf>,

    /// How much context to capture per report.
    pub capture: DebugCapture,
}

impl DebugConfig {
    /// Whether the sink is active.
    pub fn enabled(&self) -> bool {
        self.path.is_some()
    }
}

/// Verbosity of the debug sink.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebugCapture {
    /// One file per recorded failure.
    #[default]
    Errors,
    /// Additionally buffer every stream chunk for inclusion in the report.
    Streams,
}
