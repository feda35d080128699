//! Library status codes and the error type used throughout the crate.
//!
//! Every public operation returns [`Result`]. The kinds map one-to-one to
//! the stable numeric codes that command-line front-ends turn into exit
//! statuses, starting at 50000.

use std::error::Error as StdError;
use std::fmt;

/// The different classes of failure that can occur while manipulating
/// control groups.
///
/// The discriminants are stable and form the exit-code contract with the
/// tools built on top of this library.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u32)]
pub enum ErrorKind {
    /// Support for the requested feature was not compiled in.
    NotCompiled = 50000,

    /// No cgroup filesystem is mounted.
    NotMounted = 50001,

    /// The requested group does not exist.
    NotExist = 50002,

    /// The group could not be created.
    NotCreated = 50003,

    /// A controller named by the group is not mounted anywhere.
    SubsysNotMounted = 50004,

    /// The caller does not own the group.
    NotOwner = 50005,

    /// The controller is mounted in more than one place.
    MultiMounted = 50006,

    /// The operation is not allowed (kernel refused it).
    NotAllowed = 50007,

    /// A fixed-capacity container overflowed.
    MaxValuesExceeded = 50008,

    /// The controller was already added to the group.
    ControllerExists = 50009,

    /// The setting was already added to the controller.
    ValueExists = 50010,

    /// Invalid input (bad name, bad option, bad value form).
    Invalid = 50011,

    /// A controller could not be created.
    ControllerCreateFailed = 50012,

    /// Generic failure.
    Fail = 50013,

    /// The library context has not been initialized.
    NotInitialized = 50014,

    /// The requested setting does not exist in the group.
    ValueNotExist = 50015,

    /// An OS error occurred; the originating errno travels with the error.
    Other = 50016,

    /// Two groups that were expected to be equal differ.
    NotEqual = 50017,

    /// Two controllers that were expected to be equal differ.
    ControllersDiffer = 50018,

    /// A rules file could not be parsed.
    ParseFail = 50019,

    /// The rules file is missing.
    RulesFileMissing = 50020,

    /// Mounting a hierarchy failed.
    MountFail = 50021,

    /// An iterator was exhausted. Not a failure.
    EndOfIteration = 50022,

    /// A configuration file could not be parsed.
    ConfigParseFail = 50023,

    /// Conflicting namespace paths were supplied.
    NamespacePaths = 50024,

    /// A controller is missing from the namespace table.
    NamespaceController = 50025,

    /// Either a mount section or a namespace section is required.
    MountNamespace = 50026,

    /// The kernel does not support the requested feature.
    Unsupported = 50027,

    /// The group directory was created but some values could not be set.
    CantSetValue = 50028,

    /// The group could not be removed because it still has children.
    NonEmpty = 50029,

    /// The abstraction layer has no mapping for the setting.
    NoVersionConvert = 50030,
}

impl ErrorKind {
    /// The stable numeric code used as a tool exit status.
    pub fn code(self) -> u32 {
        self as u32
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    cause: Option<Box<dyn StdError + Send + Sync>>,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self.kind {
            ErrorKind::NotCompiled => "requested feature is not compiled in",
            ErrorKind::NotMounted => "no cgroup filesystem is mounted",
            ErrorKind::NotExist => "the requested group does not exist",
            ErrorKind::NotCreated => "the group could not be created",
            ErrorKind::SubsysNotMounted => "a requested controller is not mounted",
            ErrorKind::NotOwner => "the caller does not own the group",
            ErrorKind::MultiMounted => "the controller is mounted at multiple paths",
            ErrorKind::NotAllowed => "the operation is not allowed",
            ErrorKind::MaxValuesExceeded => "a fixed-capacity container overflowed",
            ErrorKind::ControllerExists => "the controller already exists in the group",
            ErrorKind::ValueExists => "the setting already exists in the controller",
            ErrorKind::Invalid => "invalid input",
            ErrorKind::ControllerCreateFailed => "a controller could not be created",
            ErrorKind::Fail => "operation failed",
            ErrorKind::NotInitialized => "the library context is not initialized",
            ErrorKind::ValueNotExist => "the requested setting does not exist",
            ErrorKind::Other => "an OS error occurred",
            ErrorKind::NotEqual => "the groups are not equal",
            ErrorKind::ControllersDiffer => "the controllers differ",
            ErrorKind::ParseFail => "the rules configuration could not be parsed",
            ErrorKind::RulesFileMissing => "the rules file is missing",
            ErrorKind::MountFail => "mounting the hierarchy failed",
            ErrorKind::EndOfIteration => "end of iteration",
            ErrorKind::ConfigParseFail => "the configuration file could not be parsed",
            ErrorKind::NamespacePaths => "conflicting namespace paths",
            ErrorKind::NamespaceController => "controller missing from the namespace table",
            ErrorKind::MountNamespace => "a mount or namespace section is required",
            ErrorKind::Unsupported => "the kernel does not support the requested feature",
            ErrorKind::CantSetValue => "the group was created but some values failed",
            ErrorKind::NonEmpty => "the group is not empty",
            ErrorKind::NoVersionConvert => "the setting cannot be converted between versions",
        };

        match self.cause {
            Some(ref cause) => write!(f, "{}: {}", msg, cause),
            None => write!(f, "{}", msg),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self.cause {
            Some(ref x) => Some(&**x),
            None => None,
        }
    }
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self { kind, cause: None }
    }

    pub(crate) fn with_cause<E>(kind: ErrorKind, cause: E) -> Self
    where
        E: 'static + Send + Sync + StdError,
    {
        Self {
            kind,
            cause: Some(Box::new(cause)),
        }
    }

    /// Wrap an OS error, preserving the errno for callers that need it.
    pub(crate) fn from_os(err: std::io::Error) -> Self {
        Error::with_cause(ErrorKind::Other, err)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The raw errno behind an [`ErrorKind::Other`] error, if one was
    /// captured.
    pub fn os_error(&self) -> Option<i32> {
        self.cause
            .as_ref()
            .and_then(|c| c.downcast_ref::<std::io::Error>())
            .and_then(|io| io.raw_os_error())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::from_os(err)
    }
}

impl From<procfs::ProcError> for Error {
    fn from(err: procfs::ProcError) -> Self {
        match err {
            procfs::ProcError::NotFound(_) => Error::new(ErrorKind::NotExist),
            procfs::ProcError::Io(io, _) => Error::from_os(io),
            other => Error::with_cause(ErrorKind::Fail, other),
        }
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Error::from_os(std::io::Error::from_raw_os_error(err as i32))
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;
