use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("cannot read environment file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid environment YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid environment: {0}")]
    Invalid(String),
}
