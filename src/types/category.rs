//! Query categories and task classification.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::SwitchboardError;

/// Cache classification of a query.
///
/// The category selects the TTL and whether the semantic tier is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    /// Short-lived facts such as current conditions.
    Weather,
    /// Headlines and current events.
    News,
    /// Facts that change rarely (definitions, history, reference).
    StaticKnowledge,
    /// Open-ended chat; never cached by default.
    Conversational,
    /// Anything not classified more precisely.
    General,
}

impl Category {
    /// All categories, in declaration order.
    pub const ALL: [Category; 5] = [
        Category::Weather,
        Category::News,
        Category::StaticKnowledge,
        Category::Conversational,
        Category::General,
    ];

    /// Stable string form, used in cache keys and the L2 `category` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Weather => "weather",
            Self::News => "news",
            Self::StaticKnowledge => "static-knowledge",
            Self::Conversational => "conversational",
            Self::General => "general",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = SwitchboardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| SwitchboardError::Configuration(format!("unknown category: {s}")))
    }
}

/// Kind of work a request asks for; drives provider selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    /// Low-latency answers.
    Fast,
    /// Multi-step reasoning.
    Complex,
    /// Code generation or explanation.
    Code,
    /// No preference; any registered provider qualifies.
    #[default]
    Default,
}

impl TaskType {
    /// Capability tag a provider must carry to serve this task.
    ///
    /// `None` means every provider is a candidate.
    pub fn capability_tag(&self) -> Option<&'static str> {
        match self {
            Self::Fast => Some("fast"),
            Self::Complex => Some("complex-reasoning"),
            Self::Code => Some("code"),
            Self::Default => None,
        }
    }

    /// Stable string form for logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Complex => "complex",
            Self::Code => "code",
            Self::Default => "default",
        }
    }
}

impl FromStr for TaskType {
    type Err = SwitchboardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "complex" | "complex-reasoning" => Ok(Self::Complex),
            "code" => Ok(Self::Code),
            "default" | "" => Ok(Self::Default),
            other => Err(SwitchboardError::Configuration(format!(
                "unknown task type: {other}"
            ))),
        }
    }
}
