// Logger configuration
use serde::{Deserialize, Serialize};

/// Environment variable selecting the deployment flavour
pub const SANDBOX_ENV_VAR: &str = "SANDBOX_ENV";

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_FILTER: &str = "extension_sandbox=info,sandbox_cli=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, coloured output for local development
    Pretty,
    /// One JSON object per event for log shippers
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerConfig {
    pub log_level: String,
    pub format: LogFormat,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_FILTER.to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl LoggerConfig {
    /// Derive the format from `SANDBOX_ENV`: anything other than
    /// `development` (the default) logs JSON.
    pub fn from_env() -> Self {
        let environment =
            std::env::var(SANDBOX_ENV_VAR).unwrap_or_else(|_| "development".to_string());
        Self::for_environment(&environment)
    }

    pub fn for_environment(environment: &str) -> Self {
        let format = if environment.eq_ignore_ascii_case("development") {
            LogFormat::Pretty
        } else {
            LogFormat::Json
        };
        Self {
            format,
            ..Self::default()
        }
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }
}
