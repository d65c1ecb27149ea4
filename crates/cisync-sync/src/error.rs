use cisync_adapters::AdapterError;
use thiserror::Error;

/// Failures that abort a whole collection step (and with it a domain or the cycle).
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] AdapterError),
    #[error("pagination exceeded {max_pages} pages; next page was {url}")]
    PaginationOverrun { max_pages: usize, url: String },
    #[error("a sync cycle is already in flight")]
    AlreadyRunning,
}

/// Failure of a single (subject, survey) pair. Recorded, never propagated.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("listing existing files for employee {employee_id}: {source}")]
    FileLookup {
        employee_id: String,
        #[source]
        source: AdapterError,
    },
    #[error("posting applicant comment: {0}")]
    Comment(#[source] AdapterError),
    #[error("comment posted but status change failed: {0}")]
    StatusChange(#[source] AdapterError),
    #[error("downloading report {link:?}: {source}")]
    Download {
        link: String,
        #[source]
        source: AdapterError,
    },
    #[error("uploading {file_name}: {source}")]
    Upload {
        file_name: String,
        #[source]
        source: AdapterError,
    },
}
