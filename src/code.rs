//! Canonical RPC status codes as a typed enum.
//!
//! Every failed call surfaces to the caller as a [`Code`] plus a short message.
//! The numeric value travels in the `grpc-status` header, the HTTP status is
//! derived from it so plain HTTP clients still see something sensible.
//!
//! ```rust
//! use applyd::Code;
//!
//! assert_eq!(Code::Unauthenticated.value(), 16);
//! assert_eq!(Code::Unauthenticated.http_status(), 401);
//! assert_eq!(Code::DeadlineExceeded.as_str(), "deadline_exceeded");
//! ```

use std::fmt;

/// All canonical RPC status codes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Code {
    Ok,                 // 0
    Cancelled,          // 1
    Unknown,            // 2
    InvalidArgument,    // 3
    DeadlineExceeded,   // 4
    NotFound,           // 5
    AlreadyExists,      // 6
    PermissionDenied,   // 7
    ResourceExhausted,  // 8
    FailedPrecondition, // 9
    Aborted,            // 10
    OutOfRange,         // 11
    Unimplemented,      // 12
    Internal,           // 13
    Unavailable,        // 14
    DataLoss,           // 15
    Unauthenticated,    // 16
}

impl Code {
    /// Numeric wire value, as carried by the `grpc-status` header.
    pub fn value(self) -> u8 {
        match self {
            Self::Ok                 => 0,
            Self::Cancelled          => 1,
            Self::Unknown            => 2,
            Self::InvalidArgument    => 3,
            Self::DeadlineExceeded   => 4,
            Self::NotFound           => 5,
            Self::AlreadyExists      => 6,
            Self::PermissionDenied   => 7,
            Self::ResourceExhausted  => 8,
            Self::FailedPrecondition => 9,
            Self::Aborted            => 10,
            Self::OutOfRange         => 11,
            Self::Unimplemented      => 12,
            Self::Internal           => 13,
            Self::Unavailable        => 14,
            Self::DataLoss           => 15,
            Self::Unauthenticated    => 16,
        }
    }

    /// Snake-case name used in JSON error bodies.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok                 => "ok",
            Self::Cancelled          => "cancelled",
            Self::Unknown            => "unknown",
            Self::InvalidArgument    => "invalid_argument",
            Self::DeadlineExceeded   => "deadline_exceeded",
            Self::NotFound           => "not_found",
            Self::AlreadyExists      => "already_exists",
            Self::PermissionDenied   => "permission_denied",
            Self::ResourceExhausted  => "resource_exhausted",
            Self::FailedPrecondition => "failed_precondition",
            Self::Aborted            => "aborted",
            Self::OutOfRange         => "out_of_range",
            Self::Unimplemented      => "unimplemented",
            Self::Internal           => "internal",
            Self::Unavailable        => "unavailable",
            Self::DataLoss           => "data_loss",
            Self::Unauthenticated    => "unauthenticated",
        }
    }

    /// HTTP status a plain HTTP client sees for this code.
    pub fn http_status(self) -> u16 {
        match self {
            Self::Ok                 => 200,
            Self::Cancelled          => 499,
            Self::Unknown            => 500,
            Self::InvalidArgument    => 400,
            Self::DeadlineExceeded   => 504,
            Self::NotFound           => 404,
            Self::AlreadyExists      => 409,
            Self::PermissionDenied   => 403,
            Self::ResourceExhausted  => 429,
            Self::FailedPrecondition => 400,
            Self::Aborted            => 409,
            Self::OutOfRange         => 400,
            Self::Unimplemented      => 501,
            Self::Internal           => 500,
            Self::Unavailable        => 503,
            Self::DataLoss           => 500,
            Self::Unauthenticated    => 401,
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
