use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// Loading strategy for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// Sequence-to-sequence; held in half precision on an accelerator.
    Translation,
    /// Sequence classification (sentiment and friends).
    Classification,
    /// Task-wrapped model; tokenizer optional.
    Pipeline,
    Generic,
}

impl ModelKind {
    /// Lenient parse: unknown names fall back to [`ModelKind::Generic`].
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "translation" => Self::Translation,
            "sentiment" | "classification" => Self::Classification,
            "pipeline" => Self::Pipeline,
            _ => Self::Generic,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Translation => "translation",
            Self::Classification => "classification",
            Self::Pipeline => "pipeline",
            Self::Generic => "generic",
        }
    }

    pub fn requires_tokenizer(&self) -> bool {
        !matches!(self, Self::Pipeline)
    }
}

impl FromStr for ModelKind {
    type Err = Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
