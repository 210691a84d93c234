use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("no input stream found")]
    NoInputStream,
    #[error("error running {command:?}: {source}")]
    Exec {
        command: PathBuf,
        #[source]
        source: io::Error,
    },
}
