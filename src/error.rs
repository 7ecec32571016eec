use core::fmt;

/// Numeric SQLite result codes as they cross the boundary.
///
/// Extended codes are layered as `base | (sub << 8)`; [`ErrorCode::from_code`]
/// decodes them by their low byte.
pub mod codes {
    pub const SQLITE_OK: i32 = 0;
    pub const SQLITE_ERROR: i32 = 1;
    pub const SQLITE_INTERNAL: i32 = 2;
    pub const SQLITE_PERM: i32 = 3;
    pub const SQLITE_ABORT: i32 = 4;
    pub const SQLITE_BUSY: i32 = 5;
    pub const SQLITE_LOCKED: i32 = 6;
    pub const SQLITE_NOMEM: i32 = 7;
    pub const SQLITE_READONLY: i32 = 8;
    pub const SQLITE_INTERRUPT: i32 = 9;
    pub const SQLITE_IOERR: i32 = 10;
    pub const SQLITE_CORRUPT: i32 = 11;
    pub const SQLITE_NOTFOUND: i32 = 12;
    pub const SQLITE_FULL: i32 = 13;
    pub const SQLITE_CANTOPEN: i32 = 14;
    pub const SQLITE_PROTOCOL: i32 = 15;
    pub const SQLITE_EMPTY: i32 = 16;
    pub const SQLITE_SCHEMA: i32 = 17;
    pub const SQLITE_TOOBIG: i32 = 18;
    pub const SQLITE_CONSTRAINT: i32 = 19;
    pub const SQLITE_MISMATCH: i32 = 20;
    pub const SQLITE_MISUSE: i32 = 21;
    pub const SQLITE_NOLFS: i32 = 22;
    pub const SQLITE_AUTH: i32 = 23;
    pub const SQLITE_FORMAT: i32 = 24;
    pub const SQLITE_RANGE: i32 = 25;
    pub const SQLITE_NOTADB: i32 = 26;
    pub const SQLITE_NOTICE: i32 = 27;
    pub const SQLITE_WARNING: i32 = 28;
    pub const SQLITE_ROW: i32 = 100;
    pub const SQLITE_DONE: i32 = 101;

    pub const SQLITE_ERROR_MISSING_COLLSEQ: i32 = SQLITE_ERROR | (1 << 8);
    pub const SQLITE_BUSY_RECOVERY: i32 = SQLITE_BUSY | (1 << 8);
    pub const SQLITE_BUSY_SNAPSHOT: i32 = SQLITE_BUSY | (2 << 8);
    pub const SQLITE_BUSY_TIMEOUT: i32 = SQLITE_BUSY | (3 << 8);
    pub const SQLITE_LOCKED_SHAREDCACHE: i32 = SQLITE_LOCKED | (1 << 8);
    pub const SQLITE_READONLY_RECOVERY: i32 = SQLITE_READONLY | (1 << 8);
    pub const SQLITE_READONLY_CANTLOCK: i32 = SQLITE_READONLY | (2 << 8);
    pub const SQLITE_IOERR_READ: i32 = SQLITE_IOERR | (1 << 8);
    pub const SQLITE_IOERR_SHORT_READ: i32 = SQLITE_IOERR | (2 << 8);
    pub const SQLITE_IOERR_WRITE: i32 = SQLITE_IOERR | (3 << 8);
    pub const SQLITE_CORRUPT_VTAB: i32 = SQLITE_CORRUPT | (1 << 8);
    pub const SQLITE_CANTOPEN_NOTEMPDIR: i32 = SQLITE_CANTOPEN | (1 << 8);
    pub const SQLITE_CONSTRAINT_CHECK: i32 = SQLITE_CONSTRAINT | (1 << 8);
    pub const SQLITE_CONSTRAINT_COMMITHOOK: i32 = SQLITE_CONSTRAINT | (2 << 8);
    pub const SQLITE_CONSTRAINT_FOREIGNKEY: i32 = SQLITE_CONSTRAINT | (3 << 8);
    pub const SQLITE_CONSTRAINT_FUNCTION: i32 = SQLITE_CONSTRAINT | (4 << 8);
    pub const SQLITE_CONSTRAINT_NOTNULL: i32 = SQLITE_CONSTRAINT | (5 << 8);
    pub const SQLITE_CONSTRAINT_PRIMARYKEY: i32 = SQLITE_CONSTRAINT | (6 << 8);
    pub const SQLITE_CONSTRAINT_TRIGGER: i32 = SQLITE_CONSTRAINT | (7 << 8);
    pub const SQLITE_CONSTRAINT_UNIQUE: i32 = SQLITE_CONSTRAINT | (8 << 8);
    pub const SQLITE_CONSTRAINT_VTAB: i32 = SQLITE_CONSTRAINT | (9 << 8);
    pub const SQLITE_CONSTRAINT_ROWID: i32 = SQLITE_CONSTRAINT | (10 << 8);

    /// Authorizer verdict: deny the whole statement.
    pub const SQLITE_DENY: i32 = 1;
    /// Authorizer verdict: treat the column as NULL / skip the action.
    pub const SQLITE_IGNORE: i32 = 2;

    /// Low byte of a possibly-extended result code.
    pub const fn primary(code: i32) -> i32 {
        code & 0xff
    }

    /// Whether `code` reports a failure (anything but OK, ROW and DONE).
    pub const fn is_error(code: i32) -> bool {
        !matches!(primary(code), SQLITE_OK | SQLITE_ROW | SQLITE_DONE)
    }
}

/// Failure reported by the engine, the bridge, or a user handler.
///
/// `code` is the primary result code; `extended` keeps the engine's extended
/// code when it reported one.
#[derive(Clone, Debug)]
pub struct Error {
    pub code: ErrorCode,
    pub extended: Option<i32>,
    pub message: Option<String>,
}

pub type Result<T> = core::result::Result<T, Error>;

macro_rules! result_codes {
    ($($variant:ident = $code:path),+ $(,)?) => {
        /// Primary SQLite result code, plus the bridge's own capability error.
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        pub enum ErrorCode {
            $($variant,)+
            /// An optional engine entry point is missing.
            FeatureUnavailable,
            /// A code outside the primary table, kept verbatim.
            Unknown(i32),
        }

        impl ErrorCode {
            /// Decode a raw result code; extended codes map by their low byte.
            pub const fn from_code(code: i32) -> ErrorCode {
                match codes::primary(code) {
                    $($code => ErrorCode::$variant,)+
                    _ => ErrorCode::Unknown(code),
                }
            }

            /// Numeric code, or `None` for [`ErrorCode::FeatureUnavailable`].
            pub const fn code(self) -> Option<i32> {
                match self {
                    $(ErrorCode::$variant => Some($code),)+
                    ErrorCode::FeatureUnavailable => None,
                    ErrorCode::Unknown(code) => Some(code),
                }
            }
        }
    };
}

result_codes! {
    Ok = codes::SQLITE_OK,
    Error = codes::SQLITE_ERROR,
    Internal = codes::SQLITE_INTERNAL,
    Perm = codes::SQLITE_PERM,
    Abort = codes::SQLITE_ABORT,
    Busy = codes::SQLITE_BUSY,
    Locked = codes::SQLITE_LOCKED,
    NoMem = codes::SQLITE_NOMEM,
    ReadOnly = codes::SQLITE_READONLY,
    Interrupt = codes::SQLITE_INTERRUPT,
    IoErr = codes::SQLITE_IOERR,
    Corrupt = codes::SQLITE_CORRUPT,
    NotFound = codes::SQLITE_NOTFOUND,
    Full = codes::SQLITE_FULL,
    CantOpen = codes::SQLITE_CANTOPEN,
    Protocol = codes::SQLITE_PROTOCOL,
    Empty = codes::SQLITE_EMPTY,
    Schema = codes::SQLITE_SCHEMA,
    TooBig = codes::SQLITE_TOOBIG,
    Constraint = codes::SQLITE_CONSTRAINT,
    Mismatch = codes::SQLITE_MISMATCH,
    Misuse = codes::SQLITE_MISUSE,
    NoLfs = codes::SQLITE_NOLFS,
    Auth = codes::SQLITE_AUTH,
    Format = codes::SQLITE_FORMAT,
    Range = codes::SQLITE_RANGE,
    NotADb = codes::SQLITE_NOTADB,
    Notice = codes::SQLITE_NOTICE,
    Warning = codes::SQLITE_WARNING,
    Row = codes::SQLITE_ROW,
    Done = codes::SQLITE_DONE,
}

impl Error {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            extended: None,
            message: None,
        }
    }

    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            extended: None,
            message: Some(message.into()),
        }
    }

    /// Build from the engine's primary code, message and extended code.
    pub fn from_code(code: i32, message: Option<String>, extended: Option<i32>) -> Self {
        Self {
            code: ErrorCode::from_code(code),
            extended,
            message,
        }
    }

    pub fn feature_unavailable(msg: &'static str) -> Self {
        Self {
            code: ErrorCode::FeatureUnavailable,
            extended: None,
            message: Some(msg.into()),
        }
    }

    /// Shorthand for a generic `SQLITE_ERROR` carrying `message`.
    ///
    /// This is what most handlers return to fail a statement.
    pub fn user(message: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::Error, message)
    }

    /// Numeric code to report across the boundary.
    ///
    /// The extended code wins when the backend supplied one; capability errors
    /// surface as `SQLITE_ERROR`.
    pub fn result_code(&self) -> i32 {
        match (self.code.code(), self.extended) {
            (Some(primary), Some(extended)) if codes::primary(extended) == primary => extended,
            (Some(primary), _) => primary,
            (None, _) => codes::SQLITE_ERROR,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, &self.message) {
            (_, Some(msg)) => f.write_str(msg),
            (ErrorCode::FeatureUnavailable, None) => f.write_str("engine feature unavailable"),
            (_, None) => write!(f, "result code {}", self.result_code()),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorCode, codes};

    #[test]
    fn error_code_mapping() {
        assert_eq!(ErrorCode::from_code(0), ErrorCode::Ok);
        assert_eq!(ErrorCode::from_code(19), ErrorCode::Constraint);
        // Extended result code should map by primary low byte.
        assert_eq!(ErrorCode::from_code((8 << 8) | 19), ErrorCode::Constraint);
        assert_eq!(ErrorCode::from_code(14), ErrorCode::CantOpen);
        assert_eq!(ErrorCode::from_code(999), ErrorCode::Unknown(999));
    }

    #[test]
    fn feature_unavailable_message() {
        let err = Error::feature_unavailable("missing");
        assert_eq!(err.code, ErrorCode::FeatureUnavailable);
        assert_eq!(err.message.as_deref(), Some("missing"));
        assert_eq!(err.result_code(), codes::SQLITE_ERROR);
    }

    #[test]
    fn result_code_prefers_matching_extended_code() {
        let err = Error::from_code(
            codes::SQLITE_CONSTRAINT,
            None,
            Some(codes::SQLITE_CONSTRAINT_UNIQUE),
        );
        assert_eq!(err.result_code(), codes::SQLITE_CONSTRAINT_UNIQUE);

        // A stale extended code from an unrelated failure is ignored.
        let err = Error::from_code(codes::SQLITE_MISUSE, None, Some(codes::SQLITE_IOERR_READ));
        assert_eq!(err.result_code(), codes::SQLITE_MISUSE);
    }

    #[test]
    fn extended_codes_keep_their_base() {
        assert_eq!(codes::primary(codes::SQLITE_BUSY_TIMEOUT), codes::SQLITE_BUSY);
        assert!(codes::is_error(codes::SQLITE_IOERR_WRITE));
        assert!(!codes::is_error(codes::SQLITE_ROW));
        assert!(!codes::is_error(codes::SQLITE_DONE));
    }

    #[test]
    fn display_falls_back_to_the_numeric_code() {
        let err = Error::from_code(codes::SQLITE_BUSY, None, Some(codes::SQLITE_BUSY_TIMEOUT));
        assert_eq!(err.to_string(), format!("result code {}", codes::SQLITE_BUSY_TIMEOUT));
        assert_eq!(Error::user("nope").to_string(), "nope");
        assert_eq!(ErrorCode::Done.code(), Some(codes::SQLITE_DONE));
        assert_eq!(ErrorCode::FeatureUnavailable.code(), None);
    }
}
