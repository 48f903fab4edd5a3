//! Error types for spotfind.

use thiserror::Error;

/// Result type alias for spotfind operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for spot finding.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration, detected before any image is processed.
    #[error("configuration error: {0}")]
    Config(String),

    /// A single image produced more strong pixels than the configured fraction allows.
    #[error(
        "the number of strong pixels found ({found}) on image {frame} is greater than the \
         maximum allowed ({max}); try changing spot finding parameters"
    )]
    TooManyStrongPixels {
        /// Frame number of the offending image.
        frame: usize,
        /// Strong pixels found across all panels.
        found: usize,
        /// Maximum number of strong pixels allowed.
        max: usize,
    },

    /// A task running on a worker thread failed.
    #[error("worker fault in chunk {chunk}: {source}")]
    WorkerFault {
        /// Chunk being processed when the failure happened.
        chunk: usize,
        /// Original error raised by the task.
        #[source]
        source: Box<Error>,
    },

    /// A task running on a worker thread panicked.
    #[error("worker panicked in chunk {chunk}: {message}")]
    WorkerPanic {
        /// Chunk being processed when the panic happened.
        chunk: usize,
        /// Panic payload, if it was a string.
        message: String,
    },

    /// Internal invariant violated, usually a collaborator contract breach.
    #[error("inconsistent state: {0}")]
    Inconsistent(String),

    /// Failure reported by the image source.
    #[error("image source error: {0}")]
    ImageSource(String),

    /// Configuration file could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns the original error, looking through worker wrappers.
    #[must_use]
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::WorkerFault { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Returns true if the strong pixel guard tripped, directly or inside a worker.
    #[must_use]
    pub fn is_strong_pixel_overflow(&self) -> bool {
        matches!(self.root_cause(), Error::TooManyStrongPixels { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_cause_unwraps_worker_faults() {
        let err = Error::WorkerFault {
            chunk: 3,
            source: Box::new(Error::TooManyStrongPixels {
                frame: 7,
                found: 11,
                max: 10,
            }),
        };
        assert!(err.is_strong_pixel_overflow());
        assert!(matches!(
            err.root_cause(),
            Error::TooManyStrongPixels { frame: 7, .. }
        ));
    }

    #[test]
    fn test_overflow_message_mentions_counts() {
        let err = Error::TooManyStrongPixels {
            frame: 1,
            found: 11,
            max: 10,
        };
        let msg = err.to_string();
        assert!(msg.contains("(11)"), "{msg}");
        assert!(msg.contains("(10)"), "{msg}");
    }
}
