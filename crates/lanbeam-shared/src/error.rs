use thiserror::Error;

/// Malformed input rejected at a protocol boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Announcement has no device id")]
    MissingDeviceId,

    #[error("Transfer manifest is empty")]
    EmptyManifest,

    #[error("File name is empty")]
    EmptyFileName,
}
