use quern_reapi::{pack_any, proto};
use thiserror::Error;
use tonic::Status;

/// Closed status-code enumeration, numerically aligned with google.rpc.Code.
/// All cross-component control flow dispatches on this instead of raw
/// status integers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    pub fn from_i32(code: i32) -> Self {
        match code {
            0 => Code::Ok,
            1 => Code::Cancelled,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            6 => Code::AlreadyExists,
            7 => Code::PermissionDenied,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            10 => Code::Aborted,
            11 => Code::OutOfRange,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            15 => Code::DataLoss,
            16 => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }

    /// Whether an operation failing with this code may be retried without
    /// changing the request. Retriable failures rotate to another worker or
    /// wait out the backend; everything else propagates to the caller.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            Code::Unknown
                | Code::Aborted
                | Code::Internal
                | Code::Unavailable
                | Code::ResourceExhausted
        )
    }
}

/// Errors raised by the scheduling core. Must stay `Clone` so resolutions
/// can be shared between concurrent waiters of a single-flight load.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("blob {0} not found")]
    BlobNotFound(proto::Digest),

    #[error("operation {0} not found")]
    OperationNotFound(String),

    #[error("{}", describe_violations(.0))]
    ViolatesPrecondition(proto::rpc::PreconditionFailure),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("backplane error: {0}")]
    Backplane(String),

    /// A status received from a collaborator that maps onto no local
    /// variant. The code survives the round trip for classification.
    #[error("{1}")]
    Remote(Code, String),
}

fn describe_violations(failure: &proto::rpc::PreconditionFailure) -> String {
    let summary = failure
        .violations
        .iter()
        .map(|v| format!("{}: {} {}", v.r#type, v.subject, v.description))
        .collect::<Vec<_>>()
        .join("; ");
    format!("precondition failure: [{}]", summary)
}

impl Error {
    pub fn code(&self) -> Code {
        match self {
            Error::InvalidRequest(_) => Code::InvalidArgument,
            Error::BlobNotFound(_) | Error::OperationNotFound(_) => Code::NotFound,
            Error::ViolatesPrecondition(_) | Error::Forbidden(_) => Code::FailedPrecondition,
            Error::ResourceExhausted(_) => Code::ResourceExhausted,
            Error::DeadlineExceeded(_) => Code::DeadlineExceeded,
            Error::Unavailable(_) => Code::Unavailable,
            Error::Backplane(_) => Code::Internal,
            Error::Remote(code, _) => *code,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.code().is_retriable()
    }

    /// A deadline hit while reporting another failure must not itself be
    /// reported as a deadline, or retry loops feed on their own timeouts.
    pub fn downgrade_deadline(self) -> Self {
        match self {
            Error::DeadlineExceeded(msg) => Error::Unavailable(msg),
            other => other,
        }
    }

    /// The error as a google.rpc.Status, violations packed into details.
    pub fn as_rpc_status(&self) -> proto::rpc::Status {
        let details = match self {
            Error::ViolatesPrecondition(failure) => vec![pack_any(failure)],
            _ => vec![],
        };
        proto::rpc::Status {
            code: self.code() as i32,
            message: self.to_string(),
            details,
        }
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        let message = status.message().to_string();
        match status.code() {
            tonic::Code::InvalidArgument => Error::InvalidRequest(message),
            tonic::Code::DeadlineExceeded => Error::DeadlineExceeded(message),
            tonic::Code::ResourceExhausted => Error::ResourceExhausted(message),
            tonic::Code::Unavailable => Error::Unavailable(message),
            code => Error::Remote(Code::from_i32(code as i32), message),
        }
    }
}

impl From<Error> for Status {
    fn from(error: Error) -> Self {
        let message = error.to_string();
        match error.code() {
            Code::Ok | Code::Unknown => Status::unknown(message),
            Code::Cancelled => Status::cancelled(message),
            Code::InvalidArgument => Status::invalid_argument(message),
            Code::DeadlineExceeded => Status::deadline_exceeded(message),
            Code::NotFound => Status::not_found(message),
            Code::AlreadyExists => Status::already_exists(message),
            Code::PermissionDenied => Status::permission_denied(message),
            Code::ResourceExhausted => Status::resource_exhausted(message),
            Code::FailedPrecondition => Status::failed_precondition(message),
            Code::Aborted => Status::aborted(message),
            Code::OutOfRange => Status::out_of_range(message),
            Code::Unimplemented => Status::unimplemented(message),
            Code::Internal => Status::internal(message),
            Code::Unavailable => Status::unavailable(message),
            Code::DataLoss => Status::data_loss(message),
            Code::Unauthenticated => Status::unauthenticated(message),
        }
    }
}

impl From<prost::DecodeError> for Error {
    fn from(value: prost::DecodeError) -> Self {
        Error::InvalidRequest(value.to_string())
    }
}

impl From<quern_reapi::DigestError> for Error {
    fn from(value: quern_reapi::DigestError) -> Self {
        Error::InvalidRequest(value.to_string())
    }
}
