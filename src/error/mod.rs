//! library error types.

mod sql_state;

pub use sql_state::SqlState;

use core::{
    convert::Infallible,
    fmt,
    ops::{Deref, DerefMut},
};

use std::{error, io};

use fallible_iterator::FallibleIterator;
use postgres_protocol::message::backend::ErrorFields;

/// public facing error type. providing basic format and display based error
/// handling.
///
/// typed error handling is done with runtime downcast to the concrete error
/// types this module offers.
///
/// # Examples
/// ```rust
/// use pgpipe::error::{DbError, Error, SqlState};
///
/// fn is_undefined_table(e: &Error) -> bool {
///     e.downcast_ref::<DbError>()
///         .is_some_and(|db| SqlState::UNDEFINED_TABLE.eq(db.code()))
/// }
/// ```
pub struct Error(Box<dyn error::Error + Send + Sync>);

impl Error {
    /// true when the error means the connection's io driver is gone.
    pub fn is_driver_down(&self) -> bool {
        self.0.is::<DriverDown>() || self.0.is::<DriverDownReceiving>()
    }

    pub(crate) fn unexpected() -> Self {
        Self(Box::new(UnexpectedMessage))
    }

    pub(crate) fn boxed(e: Box<dyn error::Error + Send + Sync>) -> Self {
        Self(e)
    }

    #[cold]
    #[inline(never)]
    pub(crate) fn db(mut fields: ErrorFields<'_>) -> Self {
        match DbError::parse(&mut fields) {
            Ok(e) => Self(Box::new(e)),
            Err(e) => Self(Box::new(e)),
        }
    }
}

impl Deref for Error {
    type Target = dyn error::Error + Send + Sync;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl DerefMut for Error {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.0
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.0.source()
    }
}

impl From<Infallible> for Error {
    fn from(e: Infallible) -> Self {
        match e {}
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self(Box::new(e))
    }
}

impl From<core::str::Utf8Error> for Error {
    fn from(e: core::str::Utf8Error) -> Self {
        Self(Box::new(e))
    }
}

macro_rules! from_impl {
    ($ty: ty) => {
        impl From<$ty> for Error {
            fn from(e: $ty) -> Self {
                Self(Box::new(e))
            }
        }
    };
}

/// error indicating the connection's io driver is dropped and unreachable
/// when sending a request to it.
///
/// the request never reached the database and it's safe to retry the
/// operation elsewhere if desired.
#[derive(Debug)]
pub struct DriverDown;

impl fmt::Display for DriverDown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("connection driver is gone. request was not sent")
    }
}

impl error::Error for DriverDown {}

from_impl!(DriverDown);

/// error indicating the connection's io driver went away while a request
/// was in flight. this is the connection-failed notification every pending
/// completion receives when the driver tears down.
///
/// the request may or may not have executed on the server and must not be
/// retried blindly.
#[derive(Debug)]
pub struct DriverDownReceiving;

impl fmt::Display for DriverDownReceiving {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("connection driver is gone. in flight response is lost")
    }
}

impl error::Error for DriverDownReceiving {}

from_impl!(DriverDownReceiving);

/// the server sent a message the driver did not expect at this point of the
/// protocol exchange.
#[derive(Debug)]
pub struct UnexpectedMessage;

impl fmt::Display for UnexpectedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("unexpected message from database")
    }
}

impl error::Error for UnexpectedMessage {}

from_impl!(UnexpectedMessage);

/// the query string sent to the server was empty.
#[derive(Debug)]
pub struct EmptyQuery;

impl fmt::Display for EmptyQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("empty query string sent to database")
    }
}

impl error::Error for EmptyQuery {}

from_impl!(EmptyQuery);

/// an earlier statement of the same pipeline failed. the statement carrying
/// this error was skipped by the server and never executed.
#[derive(Debug)]
pub struct PipelineAborted;

impl fmt::Display for PipelineAborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("pipeline aborted by an earlier statement failure")
    }
}

impl error::Error for PipelineAborted {}

from_impl!(PipelineAborted);

/// the closure staging a pipeline returned an error. staged queries were
/// replaced with a single `ROLLBACK;` before anything was flushed.
pub struct PipelineOperationFailed {
    source: Error,
}

impl PipelineOperationFailed {
    pub(crate) fn new(source: Error) -> Self {
        Self { source }
    }
}

impl fmt::Debug for PipelineOperationFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineOperationFailed")
            .field("source", &self.source)
            .finish()
    }
}

impl fmt::Display for PipelineOperationFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error while staging pipeline queries: {}", self.source)
    }
}

impl error::Error for PipelineOperationFailed {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        Some(&*self.source)
    }
}

from_impl!(PipelineOperationFailed);

/// the server has no type with the given name. produced when the oid
/// discovery query returns no oid pair for a registered user defined type.
#[derive(Debug)]
pub struct UserTypeNotFound {
    pub name: &'static str,
}

impl fmt::Display for UserTypeNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no user defined type named {:?} exists on the server", self.name)
    }
}

impl error::Error for UserTypeNotFound {}

from_impl!(UserTypeNotFound);

/// a user defined type was referenced in a context where oid discovery can
/// not run (pipeline staging) before its oids were resolved.
#[derive(Debug)]
pub struct UserTypeUnresolved {
    pub name: &'static str,
}

impl fmt::Display for UserTypeUnresolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "user defined type {:?} has no resolved oids yet. run a query referencing it or Client::discover first",
            self.name
        )
    }
}

impl error::Error for UserTypeUnresolved {}

from_impl!(UserTypeUnresolved);

/// binary codec failure on a received or encoded value.
#[derive(Debug, PartialEq, Eq)]
pub enum CodecError {
    /// the wire oid of a value does not match the expected type.
    OidMismatch { expected: u32, found: u32 },
    /// a composite value carries a different member count than its type.
    MemberCount { expected: usize, found: usize },
    /// received an array with more than one dimension.
    MultiDimensionalArray { dims: i32 },
    /// received a null where the target type can not express one.
    UnexpectedNull,
    /// the cell payload is shorter than the type's wire format.
    Truncated,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::OidMismatch { expected, found } => {
                write!(f, "mismatched object identifiers: expected {expected}, found {found}")
            }
            Self::MemberCount { expected, found } => {
                write!(f, "mismatched composite member counts: expected {expected}, found {found}")
            }
            Self::MultiDimensionalArray { dims } => {
                write!(f, "unexpected {dims} dimensional array")
            }
            Self::UnexpectedNull => f.write_str("unexpected null value"),
            Self::Truncated => f.write_str("truncated value payload"),
        }
    }
}

impl error::Error for CodecError {}

from_impl!(CodecError);

/// result row access with an out of range index.
#[derive(Debug)]
pub struct InvalidRowIndex(pub usize);

impl fmt::Display for InvalidRowIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no row at index {} exists", self.0)
    }
}

impl error::Error for InvalidRowIndex {}

from_impl!(InvalidRowIndex);

/// row field access with an out of range index.
#[derive(Debug)]
pub struct InvalidColumnIndex(pub usize);

impl fmt::Display for InvalidColumnIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no column at index {} exists", self.0)
    }
}

impl error::Error for InvalidColumnIndex {}

from_impl!(InvalidColumnIndex);

/// row field access with an unknown column name.
#[derive(Debug)]
pub struct InvalidColumnName(pub String);

impl fmt::Display for InvalidColumnName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no column named {:?} exists", self.0)
    }
}

impl error::Error for InvalidColumnName {}

from_impl!(InvalidColumnName);

/// connection string or authentication setup failure.
#[non_exhaustive]
#[derive(Debug)]
pub enum ConfigError {
    MissingUser,
    MissingPassword,
    WrongPassword,
    UnsupportedAuthentication,
    MissingHost,
    UnevenPorts,
    SslUnsupported,
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::MissingUser => f.write_str("user is missing from configuration"),
            Self::MissingPassword => f.write_str("password is missing from configuration"),
            Self::WrongPassword => f.write_str("server rejected the provided credentials"),
            Self::UnsupportedAuthentication => f.write_str("server requested an unsupported authentication method"),
            Self::MissingHost => f.write_str("no host in configuration"),
            Self::UnevenPorts => f.write_str("port count must be 1 or match the host count"),
            Self::SslUnsupported => f.write_str("sslmode=require is not supported"),
            Self::Invalid(ref msg) => write!(f, "invalid connection string: {msg}"),
        }
    }
}

impl error::Error for ConfigError {}

from_impl!(ConfigError);

/// A Postgres error or notice parsed from the server's diagnostic fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbError {
    severity: String,
    code: SqlState,
    message: String,
    detail: Option<String>,
    hint: Option<String>,
    position: Option<u32>,
    where_: Option<String>,
    schema: Option<String>,
    table: Option<String>,
    column: Option<String>,
    datatype: Option<String>,
    constraint: Option<String>,
}

impl DbError {
    #[cold]
    #[inline(never)]
    pub(crate) fn parse(fields: &mut ErrorFields<'_>) -> io::Result<DbError> {
        let mut res = DbError {
            severity: String::new(),
            code: SqlState::SUCCESSFUL_COMPLETION,
            message: String::new(),
            detail: None,
            hint: None,
            position: None,
            where_: None,
            schema: None,
            table: None,
            column: None,
            datatype: None,
            constraint: None,
        };

        let mut seen = (false, false, false);

        while let Some(field) = fields.next()? {
            let value = String::from_utf8_lossy(field.value_bytes());
            match field.type_() {
                b'S' => {
                    res.severity = value.into_owned();
                    seen.0 = true;
                }
                b'C' => {
                    res.code = SqlState::from_code(&value);
                    seen.1 = true;
                }
                b'M' => {
                    res.message = value.into_owned();
                    seen.2 = true;
                }
                b'D' => res.detail = Some(value.into_owned()),
                b'H' => res.hint = Some(value.into_owned()),
                b'P' => {
                    res.position = Some(value.parse().map_err(|_| {
                        io::Error::new(io::ErrorKind::InvalidInput, "`P` field did not contain an integer")
                    })?)
                }
                b'W' => res.where_ = Some(value.into_owned()),
                b's' => res.schema = Some(value.into_owned()),
                b't' => res.table = Some(value.into_owned()),
                b'c' => res.column = Some(value.into_owned()),
                b'd' => res.datatype = Some(value.into_owned()),
                b'n' => res.constraint = Some(value.into_owned()),
                _ => {}
            }
        }

        if !(seen.0 && seen.1 && seen.2) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "`S`, `C` or `M` diagnostic field missing",
            ));
        }

        Ok(res)
    }

    /// ERROR, FATAL or PANIC (or a localized translation of one of these).
    pub fn severity(&self) -> &str {
        &self.severity
    }

    /// The SQLSTATE code for the error.
    pub fn code(&self) -> &SqlState {
        &self.code
    }

    /// The primary human readable error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// An optional secondary message carrying more detail.
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// An optional suggestion what to do about the problem.
    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    /// An optional cursor position into the original query string.
    pub fn position(&self) -> Option<u32> {
        self.position
    }

    /// An indication of the context in which the error occurred.
    pub fn where_(&self) -> Option<&str> {
        self.where_.as_deref()
    }

    /// Schema of the object the error relates to, if any.
    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Table the error relates to, if any.
    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    /// Column the error relates to, if any.
    pub fn column(&self) -> Option<&str> {
        self.column.as_deref()
    }

    /// Data type the error relates to, if any.
    pub fn datatype(&self) -> Option<&str> {
        self.datatype.as_deref()
    }

    /// Constraint the error relates to, if any.
    pub fn constraint(&self) -> Option<&str> {
        self.constraint.as_deref()
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity, self.message)?;
        if let Some(detail) = &self.detail {
            write!(f, "\nDETAIL: {detail}")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\nHINT: {hint}")?;
        }
        Ok(())
    }
}

impl error::Error for DbError {}

from_impl!(DbError);
