//! Failure categories recorded with stage exceptions.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Category of an exception recorded in `failureTable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExceptionCategory {
    #[default]
    Unknown,
    Build,
    Test,
    Infra,
    Lab,
}

impl ExceptionCategory {
    pub const ALL: [ExceptionCategory; 5] = [
        ExceptionCategory::Unknown,
        ExceptionCategory::Build,
        ExceptionCategory::Test,
        ExceptionCategory::Infra,
        ExceptionCategory::Lab,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExceptionCategory::Unknown => "unknown",
            ExceptionCategory::Build => "build",
            ExceptionCategory::Test => "test",
            ExceptionCategory::Infra => "infra",
            ExceptionCategory::Lab => "lab",
        }
    }
}

impl std::fmt::Display for ExceptionCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExceptionCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExceptionCategory::ALL
            .into_iter()
            .find(|category| category.as_str() == s)
            .ok_or_else(|| Error::UnknownCategory(s.to_string()))
    }
}

impl TryFrom<String> for ExceptionCategory {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
