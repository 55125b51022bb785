use std::path::PathBuf;
use thiserror::Error;

/// Configuration problems are the only errors that terminate a run; every
/// other failure is recorded in the run report and the pipeline continues.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("unrecognized keys in {}: {keys:?}", path.display())]
    UnknownKeys { path: PathBuf, keys: Vec<String> },

    #[error("bias rule pattern `{pattern}` does not compile: {source}")]
    InvalidRule {
        pattern: String,
        source: regex::Error,
    },

    #[error("credential variable `{var}` for summarization provider `{provider}` is not set")]
    MissingProviderCredential { provider: String, var: String },

    #[error("unsupported {what}: `{value}`")]
    Unsupported { what: &'static str, value: String },
}
