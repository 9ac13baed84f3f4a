//! Error types for FileDock.

use thiserror::Error;

/// Common error type for connector operations.
///
/// Every variant carries a stable wire code (see [`ConnectorError::code`]) and
/// an HTTP-style status (see [`ConnectorError::status`]) so the connector can
/// turn any failure into the protocol's `{"error": [...]}` envelope.
#[derive(Error, Debug)]
pub enum ConnectorError {
    /// No command name was supplied.
    #[error("command required")]
    CommandRequired,

    /// The command exists but is disabled for this connector.
    #[error("command not supported")]
    CommandNoSupport,

    /// The command name is not part of the protocol.
    #[error("unknown command")]
    UnknownCommand,

    /// Parameters are missing or malformed for the named command.
    #[error("invalid parameters for command: {0}")]
    CommandParams(String),

    /// The target file does not exist.
    #[error("file not found")]
    FileNotFound,

    /// The target folder does not exist.
    #[error("folder not found")]
    FolderNotFound,

    /// A file was expected but a directory was found.
    #[error("not a file")]
    NotFile,

    /// An entry with the given name already exists.
    #[error("{0} already exists")]
    Exists(String),

    /// The given name is not a valid entry name.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// ACL or path containment violation.
    #[error("permission denied")]
    PermissionDenied,

    /// The operation would exceed the volume's storage quota.
    #[error("quota exceeded (maximum {maximum} bytes, usage {usage} bytes)")]
    Quota {
        /// Configured maximum in bytes.
        maximum: u64,
        /// Observed usage in bytes when the operation was rejected.
        usage: u64,
    },

    /// An uploaded file is larger than the volume allows.
    #[error("upload file size exceeded")]
    UploadFileSize,

    /// An uploaded file's type is not allowed by the volume.
    #[error("file type not allowed")]
    FileTypeNotAllow,

    /// The archive type is not supported.
    #[error("unsupported archive type")]
    ArchiveType,

    /// The request was cancelled by an abort command.
    #[error("connection aborted")]
    ConnectionAborted,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Image processing error.
    #[error("image error: {0}")]
    Image(String),

    /// Archive processing error.
    #[error("archive error: {0}")]
    Archive(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Background task failure.
    #[error("task error: {0}")]
    Task(String),
}

impl ConnectorError {
    /// Unwrap to the innermost connector error.
    ///
    /// Blocking helpers and archive/image libraries report failures through
    /// `std::io::Error`; when such an error wraps one of our own errors the
    /// wrapped one is the root cause.
    pub fn innermost(&self) -> &ConnectorError {
        if let ConnectorError::Io(e) = self {
            if let Some(inner) = e.get_ref().and_then(|r| r.downcast_ref::<ConnectorError>()) {
                return inner.innermost();
            }
        }
        self
    }

    /// Stable protocol error code.
    pub fn code(&self) -> &'static str {
        match self.innermost() {
            ConnectorError::CommandRequired => "errCmdReq",
            ConnectorError::CommandNoSupport => "errCmdNoSupport",
            ConnectorError::UnknownCommand => "errUnknownCmd",
            ConnectorError::CommandParams(_) => "errCmdParams",
            ConnectorError::FileNotFound => "errFileNotFound",
            ConnectorError::FolderNotFound => "errFolderNotFound",
            ConnectorError::NotFile => "errNotFile",
            ConnectorError::Exists(_) => "errExists",
            ConnectorError::InvalidName(_) => "errInvName",
            ConnectorError::PermissionDenied => "errPerm",
            ConnectorError::Quota { .. } => "errQuota",
            ConnectorError::UploadFileSize => "errUploadFileSize",
            ConnectorError::FileTypeNotAllow => "errUploadMime",
            ConnectorError::ArchiveType => "errArcType",
            ConnectorError::ConnectionAborted => "errAbort",
            ConnectorError::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => "errFileNotFound",
                std::io::ErrorKind::PermissionDenied => "errPerm",
                _ => "errUnknown",
            },
            ConnectorError::Image(_)
            | ConnectorError::Archive(_)
            | ConnectorError::Config(_)
            | ConnectorError::Task(_) => "errUnknown",
        }
    }

    /// Structured details that follow the code in the error array.
    pub fn details(&self) -> Vec<String> {
        match self.innermost() {
            ConnectorError::CommandParams(cmd) => vec![cmd.clone()],
            ConnectorError::Exists(name) | ConnectorError::InvalidName(name) => {
                vec![name.clone()]
            }
            ConnectorError::Quota { maximum, usage } => {
                vec![maximum.to_string(), usage.to_string()]
            }
            _ => Vec::new(),
        }
    }

    /// HTTP-style status code for this error.
    pub fn status(&self) -> u16 {
        match self.innermost() {
            ConnectorError::FileNotFound | ConnectorError::FolderNotFound => 404,
            ConnectorError::PermissionDenied | ConnectorError::Quota { .. } => 403,
            ConnectorError::CommandRequired
            | ConnectorError::CommandNoSupport
            | ConnectorError::UnknownCommand
            | ConnectorError::CommandParams(_)
            | ConnectorError::NotFile
            | ConnectorError::Exists(_)
            | ConnectorError::InvalidName(_)
            | ConnectorError::UploadFileSize
            | ConnectorError::FileTypeNotAllow
            | ConnectorError::ArchiveType
            | ConnectorError::ConnectionAborted => 400,
            ConnectorError::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => 404,
                std::io::ErrorKind::PermissionDenied => 403,
                _ => 500,
            },
            ConnectorError::Image(_)
            | ConnectorError::Archive(_)
            | ConnectorError::Config(_)
            | ConnectorError::Task(_) => 500,
        }
    }

    /// Wrap this error in an `std::io::Error` so it can cross blocking APIs.
    pub fn into_io(self) -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::Other, self)
    }
}

impl From<tokio::task::JoinError> for ConnectorError {
    fn from(e: tokio::task::JoinError) -> Self {
        ConnectorError::Task(e.to_string())
    }
}

impl From<walkdir::Error> for ConnectorError {
    fn from(e: walkdir::Error) -> Self {
        match e.into_io_error() {
            Some(io) => ConnectorError::Io(io),
            None => ConnectorError::Task("directory walk loop detected".to_string()),
        }
    }
}

/// Result type alias for connector operations.
pub type Result<T> = std::result::Result<T, ConnectorError>;
