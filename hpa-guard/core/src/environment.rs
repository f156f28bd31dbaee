use std::{fmt, str::FromStr};

/// The deployment environment the webhook runs in.
///
/// Gates how much error detail is returned to API clients and which error
/// kinds are reported as retryable.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid environment '{0}': expected one of 'development', 'staging', or 'production'")]
pub struct InvalidEnvironment(String);

// === impl Environment ===

impl Environment {
    #[inline]
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }
}

impl FromStr for Environment {
    type Err = InvalidEnvironment;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "staging" | "stage" => Ok(Self::Staging),
            "production" | "prod" => Ok(Self::Production),
            _ => Err(InvalidEnvironment(s.to_string())),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
