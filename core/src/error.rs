// Copyright 2024 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;

use tonic::Status;

/// How a network failure should be treated by a `FailurePolicy`. Only
/// `Temporary` and `Timeout` are ever offered to a policy for a decision;
/// `Permanent` always surfaces to the caller (spec §4.3, §7).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkErrorKind {
    Temporary,
    Timeout,
    Permanent,
}

impl NetworkErrorKind {
    pub fn is_transient(self) -> bool {
        matches!(self, NetworkErrorKind::Temporary | NetworkErrorKind::Timeout)
    }

    /// Classify a `tonic::Status` the way the engine and the System cache's
    /// refresh worker both need to: unavailable/deadline-exceeded are
    /// retryable, everything else is treated as permanent.
    pub fn classify(status: &Status) -> NetworkErrorKind {
        match status.code() {
            tonic::Code::DeadlineExceeded => NetworkErrorKind::Timeout,
            tonic::Code::Unavailable | tonic::Code::ResourceExhausted => NetworkErrorKind::Temporary,
            _ => NetworkErrorKind::Permanent,
        }
    }
}

/// The error taxonomy for the authorization path, covering both the System
/// and Backend legs plus cache bookkeeping failures.
#[derive(Debug)]
pub enum CoreError {
    /// A request-shaped argument was missing or empty where the contract
    /// requires it (e.g. an empty `service_id` on a System cache lookup).
    InvalidArguments { message: String },
    /// No application exists for the given service/credentials, and no cached
    /// entry could stand in for it.
    ApplicationNotFound { service_id: String },
    /// The request carried no usable identifier for the configured
    /// `AuthPattern` (e.g. no API key, no OpenID `azp` claim).
    MissingCredentials,
    /// Proxy-rule evaluation produced an empty metrics map.
    NoMatchingRule,
    /// A Backend `authorize`/`auth_rep` call carried zero transactions.
    InvalidTransactions,
    /// No `ProxyConfig` is cached for this service and System could not be
    /// reached to fetch one.
    ServiceConfigUnavailable { service_id: String },
    /// Backend rejected the transaction outright (not a rate-limit denial -
    /// those are expressed as `authorized: false` in a normal response).
    BackendRejected { message: String },
    /// The remote call failed and, if transient, the configured
    /// `FailurePolicy` decided not to paper over it.
    RemoteUnavailable { message: String, kind: NetworkErrorKind },
    /// A rate limit was breached.
    LimitsExceeded,
    /// A flush batch could not be reconciled because the snapshot it was
    /// built from no longer matches live state in a recoverable way.
    ReconciliationFailed { message: String },
    /// The flush queue is at capacity and the caller asked for a policy that
    /// rejects new work rather than drop the oldest entry.
    QueueFull,
    Transport(tonic::transport::Error),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::InvalidArguments { message } => write!(f, "invalid arguments: {message}"),
            CoreError::ApplicationNotFound { service_id } => {
                write!(f, "no application found for service {service_id}")
            }
            CoreError::MissingCredentials => write!(f, "request carried no usable credentials"),
            CoreError::NoMatchingRule => write!(f, "no proxy rule matched the request"),
            CoreError::InvalidTransactions => write!(f, "request carried zero transactions"),
            CoreError::ServiceConfigUnavailable { service_id } => {
                write!(f, "no proxy config available for service {service_id}")
            }
            CoreError::BackendRejected { message } => write!(f, "backend rejected request: {message}"),
            CoreError::RemoteUnavailable { message, .. } => write!(f, "remote call failed: {message}"),
            CoreError::LimitsExceeded => write!(f, "usage limits are exceeded"),
            CoreError::ReconciliationFailed { message } => {
                write!(f, "flush reconciliation failed: {message}")
            }
            CoreError::QueueFull => write!(f, "flush queue is at capacity"),
            CoreError::Transport(err) => write!(f, "transport error: {err}"),
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoreError::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<tonic::transport::Error> for CoreError {
    fn from(err: tonic::transport::Error) -> Self {
        CoreError::Transport(err)
    }
}

impl From<CoreError> for Status {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidArguments { message } => Status::invalid_argument(message),
            CoreError::ApplicationNotFound { service_id } => {
                Status::not_found(format!("no application found for service {service_id}"))
            }
            CoreError::MissingCredentials => {
                Status::unauthenticated("request carried no usable credentials")
            }
            CoreError::NoMatchingRule => Status::not_found("no proxy rule matched the request"),
            CoreError::InvalidTransactions => {
                Status::invalid_argument("request carried zero transactions")
            }
            CoreError::ServiceConfigUnavailable { service_id } => Status::unavailable(format!(
                "no proxy config available for service {service_id}"
            )),
            CoreError::BackendRejected { message } => Status::permission_denied(message),
            CoreError::RemoteUnavailable { message, .. } => Status::unavailable(message),
            CoreError::LimitsExceeded => Status::resource_exhausted("usage limits are exceeded"),
            CoreError::ReconciliationFailed { message } => Status::internal(message),
            CoreError::QueueFull => Status::resource_exhausted("flush queue is at capacity"),
            CoreError::Transport(err) => Status::unavailable(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_not_found_maps_to_not_found_status() {
        let status: Status = CoreError::ApplicationNotFound {
            service_id: "svc-1".to_owned(),
        }
        .into();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[test]
    fn missing_credentials_maps_to_unauthenticated() {
        let status: Status = CoreError::MissingCredentials.into();
        assert_eq!(status.code(), tonic::Code::Unauthenticated);
    }

    #[test]
    fn queue_full_maps_to_resource_exhausted() {
        let status: Status = CoreError::QueueFull.into();
        assert_eq!(status.code(), tonic::Code::ResourceExhausted);
    }

    #[test]
    fn classifies_deadline_exceeded_as_timeout() {
        let status = Status::deadline_exceeded("slow");
        assert_eq!(NetworkErrorKind::classify(&status), NetworkErrorKind::Timeout);
    }

    #[test]
    fn classifies_unavailable_as_temporary() {
        let status = Status::unavailable("down");
        assert_eq!(NetworkErrorKind::classify(&status), NetworkErrorKind::Temporary);
    }

    #[test]
    fn classifies_permission_denied_as_permanent_and_not_transient() {
        let status = Status::permission_denied("nope");
        let kind = NetworkErrorKind::classify(&status);
        assert_eq!(kind, NetworkErrorKind::Permanent);
        assert!(!kind.is_transient());
    }
}
