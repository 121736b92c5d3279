use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::GraphParseError;

/// Outcome tag produced by a node and matched against outgoing edge labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeLabel {
    Success,
    Failure,
    Default,
}

impl EdgeLabel {
    pub const ALL: [EdgeLabel; 3] = [EdgeLabel::Success, EdgeLabel::Failure, EdgeLabel::Default];

    /// Name used in graph notation (`SUCCESS`).
    pub fn name(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Default => "DEFAULT",
        }
    }

    /// Short id (`success`, `failure`, `*`).
    pub fn id(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Default => "*",
        }
    }
}

impl fmt::Display for EdgeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EdgeLabel {
    type Err = GraphParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|label| label.name() == s || label.id() == s)
            .ok_or_else(|| GraphParseError::UnknownLabel(s.to_string()))
    }
}
