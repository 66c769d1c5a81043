//! Error types for the confwatch command line.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] confwatch::Error),

    #[error("cannot write output: {0}")]
    Output(#[from] std::io::Error),
}
