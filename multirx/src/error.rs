use std::path::PathBuf;

/// An error from setting up or running a recording.
///
/// Where each one can come from:
///
/// - `InvalidChannel`, `DuplicateChannel`, `ChannelCount`, and
///   `InvalidParameter` are startup errors. [`record`][crate::record] returns
///   them before any thread is spawned or any stream command is issued.
/// - `Device` and `Uhd` come out of a device backend. During setup they abort
///   the run; during streaming the acquisition loop logs them and stops.
/// - `FileOpen` and `FileWrite` only ever end a single channel's writer. The
///   other channels and the acquisition loop carry on.
/// - `WriterPanicked` means a writer thread died without reporting.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Underlying OS I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// A configured channel index doesn't exist on the device.
    #[error("Invalid channel {channel} specified, device has {available} channels")]
    #[allow(missing_docs)]
    InvalidChannel { channel: usize, available: usize },

    /// The same channel index was configured twice.
    #[error("Channel {0} is configured more than once")]
    DuplicateChannel(usize),

    /// Every channel the device streams needs a destination, and vice versa.
    #[error("{configured} channels configured, but the device streams {device}")]
    #[allow(missing_docs)]
    ChannelCount { configured: usize, device: usize },

    /// Some argument to a function is invalid.
    #[error("Invalid Parameter: {0}")]
    InvalidParameter(&'static str),

    /// The device reported a failure.
    #[error("Device error: {0}")]
    Device(String),

    /// A UHD C API call returned an error code.
    #[error("UHD call `{call}` failed with error code {code}")]
    #[allow(missing_docs)]
    Uhd { call: &'static str, code: i32 },

    /// A writer couldn't open its destination file.
    #[error("Failed to open {} for writing", .path.display())]
    #[allow(missing_docs)]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A writer failed partway through writing its file.
    #[error("Failed writing to {}", .path.display())]
    #[allow(missing_docs)]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A writer thread panicked.
    #[error("Writer thread for channel {0} panicked")]
    WriterPanicked(usize),
}
