//! Our error types for instrument sessions and TSP-Link topologies.

use thiserror::Error;

use crate::{
    clock::Millis,
    node::NodeNumber,
    status::StatusByte,
};

pub type Result<T, I> = core::result::Result<T, Error<I>>;

/// One entry drained from an instrument's error queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorQueueEntry {
    /// Instrument error code. `0` means "no error".
    pub code: i32,
    /// Compound message as reported by the instrument, quotes stripped.
    pub message: String,
    /// Node the entry was drained from.
    pub node: NodeNumber,
}

impl ErrorQueueEntry {
    /// Parse a reply to a "next error" query.
    ///
    /// Accepts the SCPI form `-113,"Undefined header"` and the TSP form
    /// `code<TAB>message<TAB>severity<TAB>node`. When the reply names no node, `node` is used.
    pub fn parse(
        command: &str,
        reply: &str,
        node: NodeNumber,
    ) -> core::result::Result<Self, ParseError> {
        let reply = reply.trim();
        let invalid = || ParseError::new(command, reply, "error queue entry");

        let (code, message, reported_node) = if reply.contains('\t') {
            let mut fields = reply.split('\t');
            let code = fields.next().ok_or_else(invalid)?;
            let message = fields.next().unwrap_or_default();
            let reported_node = fields.nth(1);
            (code, message, reported_node)
        } else {
            let (code, message) = reply.split_once(',').unwrap_or((reply, ""));
            (code, message, None)
        };

        let code = crate::accessor::parse_integer(code)
            .and_then(|code| i32::try_from(code).ok())
            .ok_or_else(invalid)?;
        let node = reported_node
            .and_then(crate::accessor::parse_integer)
            .and_then(|n| u16::try_from(n).ok())
            .and_then(NodeNumber::new)
            .unwrap_or(node);

        Ok(Self {
            code,
            message: message.trim().trim_matches('"').to_string(),
            node,
        })
    }
}

impl core::fmt::Display for ErrorQueueEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{},{} (node {})", self.code, self.message, self.node)
    }
}

/// A reply which did not match the grammar its command expects.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed parsing reply {raw:?} to `{command}` as {expected}")]
pub struct ParseError {
    /// Command whose reply was being parsed. Empty when parsing detached text.
    pub command: String,
    /// The reply exactly as received.
    pub raw: String,
    /// Short description of the expected grammar, e.g. "real number".
    pub expected: &'static str,
}

impl ParseError {
    pub fn new(command: impl Into<String>, raw: impl Into<String>, expected: &'static str) -> Self {
        Self {
            command: command.into(),
            raw: raw.into(),
            expected,
        }
    }
}

/// Custom error type for instrument dialogue and link coordination.
#[derive(Error, Debug)]
pub enum Error<I: embedded_io::Error> {
    #[error("Transport error ({kind:?}) after `{command}`: {error:?}")]
    Transport {
        command: String,
        kind: embedded_io::ErrorKind,
        error: I,
    },
    #[error("No reply to `{command}` within {timeout:?} (last status {status:?})")]
    CommunicationTimeout {
        command: String,
        timeout: Millis,
        status: Option<StatusByte>,
    },
    #[error("Instrument reported errors after `{command}` (status {status}): {errors:?}")]
    DeviceStatusError {
        command: String,
        status: StatusByte,
        errors: Vec<ErrorQueueEntry>,
    },
    #[error("Error queue of node {node} did not empty after {iterations} reads of `{command}`")]
    ErrorQueueStuck {
        node: NodeNumber,
        command: String,
        iterations: usize,
        /// Entries popped before giving up.
        errors: Vec<ErrorQueueEntry>,
    },
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("Link reset `{command}` did not complete within {timeout:?} (last status {status})")]
    LinkResetTimeout {
        command: String,
        timeout: Millis,
        status: StatusByte,
    },
    #[error("Link is {state} after `{command}` but {expected_nodes} nodes were expected")]
    LinkOffline {
        command: String,
        expected_nodes: usize,
        state: crate::link::LinkState,
    },
    /// `cause` is the failure of `command`; see [`Error::cause`].
    #[error("Assigning a group to node {node} failed at `{command}`; already assigned: {assigned:?}")]
    GroupAssignmentFailed {
        node: NodeNumber,
        command: String,
        assigned: Vec<NodeNumber>,
        cause: Box<Error<I>>,
    },
    #[error("Invalid node number {0}")]
    InvalidNode(u16),
    #[error("Topology violation: {0}")]
    Topology(&'static str),
}

impl<I: embedded_io::Error> Error<I> {
    /// Wrap a transport fault raised while handling `command`.
    ///
    /// Faults of kind [`embedded_io::ErrorKind::TimedOut`] become [`Error::CommunicationTimeout`].
    pub(crate) fn from_transport(command: &str, error: I, timeout: Millis) -> Self {
        match error.kind() {
            embedded_io::ErrorKind::TimedOut => Error::CommunicationTimeout {
                command: command.into(),
                timeout,
                status: None,
            },
            kind => Error::Transport {
                command: command.into(),
                kind,
                error,
            },
        }
    }

    /// Errors drained from the instrument while this error was raised.
    pub fn device_errors(&self) -> &[ErrorQueueEntry] {
        match self {
            Error::DeviceStatusError { errors, .. } | Error::ErrorQueueStuck { errors, .. } => errors,
            Error::GroupAssignmentFailed { cause, .. } => cause.device_errors(),
            _ => &[],
        }
    }

    /// The underlying failure of a compound error.
    pub fn cause(&self) -> Option<&Error<I>> {
        match self {
            Error::GroupAssignmentFailed { cause, .. } => Some(cause.as_ref()),
            _ => None,
        }
    }

    /// True when the client gave up waiting; the instrument may still complete the operation.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::CommunicationTimeout { .. } | Error::LinkResetTimeout { .. }
        )
    }
}
