use std::error::Error;
use std::fmt;
use std::fmt::{Display, Formatter};

#[derive(Clone, Debug)]
pub struct NodeError {
  message: String,
  pub kind: NodeErrorKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeErrorKind {
  Invalid,
  DoesNotExist,
  TransientIo,
  FatalIo,
  Cancelled,
  // an invariant was violated; this is a programming bug, not a runtime
  // condition, and callers are expected to fail fast on it
  Assertion,
  Internal,
}

impl NodeError {
  pub fn does_not_exist(entity_name: &'static str, value: impl Display) -> NodeError {
    NodeError {
      message: format!("{} {} does not exist", entity_name, value),
      kind: NodeErrorKind::DoesNotExist,
    }
  }

  pub fn invalid(explanation: impl Display) -> NodeError {
    NodeError {
      message: explanation.to_string(),
      kind: NodeErrorKind::Invalid,
    }
  }

  pub fn transient_io(explanation: impl Display) -> NodeError {
    NodeError {
      message: explanation.to_string(),
      kind: NodeErrorKind::TransientIo,
    }
  }

  pub fn fatal_io(explanation: impl Display) -> NodeError {
    NodeError {
      message: explanation.to_string(),
      kind: NodeErrorKind::FatalIo,
    }
  }

  pub fn cancelled(explanation: impl Display) -> NodeError {
    NodeError {
      message: explanation.to_string(),
      kind: NodeErrorKind::Cancelled,
    }
  }

  pub fn assertion(explanation: impl Display) -> NodeError {
    NodeError {
      message: explanation.to_string(),
      kind: NodeErrorKind::Assertion,
    }
  }

  pub fn internal(explanation: impl Display) -> NodeError {
    NodeError {
      message: explanation.to_string(),
      kind: NodeErrorKind::Internal,
    }
  }

  // TransientIo is the only kind worth another attempt; everything else is
  // either caller error or a terminal condition
  pub fn is_retryable(&self) -> bool {
    matches!(self.kind, NodeErrorKind::TransientIo)
  }

  pub fn with_context(mut self, context: impl Display) -> Self {
    self.message = format!("{}; {}", context, self.message);
    self
  }
}

impl Display for NodeError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    let prefix = match &self.kind {
      NodeErrorKind::Invalid => "invalid request",
      NodeErrorKind::DoesNotExist => "missing",
      NodeErrorKind::TransientIo => "transient io error",
      NodeErrorKind::FatalIo => "fatal io error",
      NodeErrorKind::Cancelled => "cancelled",
      NodeErrorKind::Assertion => "assertion failed",
      NodeErrorKind::Internal => "internal error",
    };
    write!(f, "{}; {}", prefix, self.message)
  }
}

impl<E> From<E> for NodeError where E: Error {
  fn from(reason: E) -> Self {
    NodeError {
      message: reason.to_string(),
      kind: NodeErrorKind::Internal,
    }
  }
}

pub type NodeResult<T> = Result<T, NodeError>;

pub trait Contextable {
  fn with_context<F, S>(self, context_fn: F) -> Self
  where F: FnOnce() -> S, S: Display;
}

impl<T> Contextable for NodeResult<T> {
  fn with_context<F, S>(self, context_fn: F) -> Self
  where F: FnOnce() -> S, S: Display {
    match self {
      Ok(x) => Ok(x),
      Err(e) => Err(e.with_context(context_fn())),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_context_prepends() {
    let res: NodeResult<()> = Err(NodeError::invalid("bad plan"));
    let res = res.with_context(|| "while validating compaction");
    let msg = res.unwrap_err().to_string();
    assert_eq!(msg, "invalid request; while validating compaction; bad plan");
  }

  #[test]
  fn test_retryable_kinds() {
    assert!(NodeError::transient_io("upload timed out").is_retryable());
    assert!(!NodeError::fatal_io("retries exhausted").is_retryable());
    assert!(!NodeError::invalid("empty binlog set").is_retryable());
  }
}
