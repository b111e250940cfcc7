//! Tunnel backend contract
//!
//! The state machine never talks to sockets or devices itself. It hands a
//! [`ConnectionPlan`] to a [`TunnelBackend`] and later receives
//! [`BackendEvent`]s tagged with the [`AttemptId`] they belong to. Events for
//! an attempt that is no longer current are dropped by the state machine.

use fos_vpn::selector::ConnectionPlan;
use fos_vpn::states::{ErrorStateCause, TunnelEndpoint};
use std::fmt;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Identifies one connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttemptId(u64);

impl AttemptId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Details of an established tunnel
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelMetadata {
    pub interface: String,
    /// Endpoint actually used, when it differs from the plan (resolved custom host)
    pub endpoint: Option<TunnelEndpoint>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptFailure {
    /// Worth retrying with the next attempt
    Transient(ErrorStateCause),
    /// Retrying will not help
    Fatal(ErrorStateCause),
}

impl AttemptFailure {
    pub fn cause(&self) -> &ErrorStateCause {
        match self {
            AttemptFailure::Transient(cause) | AttemptFailure::Fatal(cause) => cause,
        }
    }

    pub fn into_cause(self) -> ErrorStateCause {
        match self {
            AttemptFailure::Transient(cause) | AttemptFailure::Fatal(cause) => cause,
        }
    }

    /// Fatal failures and policy causes are never retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, AttemptFailure::Transient(cause) if !cause.is_policy())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// A custom host was resolved; the attempt has not sent anything yet
    Resolved(SocketAddr),
    Up(TunnelMetadata),
    Down,
    Failed(AttemptFailure),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendMessage {
    pub attempt: AttemptId,
    pub event: BackendEvent,
}

pub type BackendEventSender = mpsc::UnboundedSender<BackendMessage>;
pub type BackendEventReceiver = mpsc::UnboundedReceiver<BackendMessage>;

/// Handle to a running attempt
#[derive(Debug)]
pub struct AttemptHandle {
    id: AttemptId,
    task: Option<AbortHandle>,
}

impl AttemptHandle {
    pub fn new(id: AttemptId) -> Self {
        Self { id, task: None }
    }

    pub fn with_task(id: AttemptId, task: AbortHandle) -> Self {
        Self {
            id,
            task: Some(task),
        }
    }

    pub fn id(&self) -> AttemptId {
        self.id
    }

    /// Stop the attempt's task, if it has one
    pub fn cancel(&self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

/// Establishes tunnels
///
/// `start` must not block; progress is reported through `events`. After
/// `abort` the backend reports `Down` for that attempt once it has torn
/// everything down.
pub trait TunnelBackend: Send + 'static {
    fn start(&mut self, id: AttemptId, plan: ConnectionPlan, events: BackendEventSender) -> AttemptHandle;

    fn abort(&mut self, handle: AttemptHandle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use fos_vpn::states::{AuthFailedError, ParameterGenerationError};

    #[test]
    fn test_policy_causes_never_retry() {
        let policy = AttemptFailure::Transient(ErrorStateCause::AuthFailed {
            reason: AuthFailedError::ExpiredAccount,
        });
        assert!(!policy.is_retryable());

        let fatal = AttemptFailure::Fatal(ErrorStateCause::TunnelParameterError {
            error: ParameterGenerationError::CustomTunnelHostResolutionError,
        });
        assert!(!fatal.is_retryable());

        assert!(AttemptFailure::Transient(ErrorStateCause::StartTunnelError).is_retryable());
    }

    #[test]
    fn test_attempt_ids_increase() {
        let first = AttemptId::new(1);
        assert!(first.next() > first);
        assert_eq!(first.next().to_string(), "#2");
    }
}
