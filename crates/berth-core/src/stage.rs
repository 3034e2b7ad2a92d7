//! Build stage definitions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The build stages, in the only order they may run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Resolve the pinned environment image.
    Provision,

    /// Copy the source tree into the working location.
    Ingest,

    /// Run the environment's release build.
    Compile,

    /// Record the artifact path as the default command and commit the image.
    Bind,
}

impl Stage {
    /// All build stages in execution order.
    pub const ALL: [Stage; 4] = [Stage::Provision, Stage::Ingest, Stage::Compile, Stage::Bind];

    /// Get the stage name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Provision => "provision",
            Stage::Ingest => "ingest",
            Stage::Compile => "compile",
            Stage::Bind => "bind",
        }
    }

    /// Stage that must have succeeded before this one may start.
    pub fn predecessor(&self) -> Option<Stage> {
        match self {
            Stage::Provision => None,
            Stage::Ingest => Some(Stage::Provision),
            Stage::Compile => Some(Stage::Ingest),
            Stage::Bind => Some(Stage::Compile),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
