//! The runtime error taxonomy.
//!
//! Faults produced by the dispatch loop, the value operations, and the
//! built-in functions are typed [`Error`] values. When a fault escapes a
//! running frame the interpreter wraps it in a [`RuntimeError`], which
//! accumulates the ordered error list and the source-position trace while
//! frames unwind.

use std::error::Error as StdError;
use std::fmt::Display;
use std::sync::Arc;

use beef::lean::Cow;

use crate::span::{Pos, Span};
use crate::util::JoinIter;
use crate::value::Value;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Clone)]
pub enum Error {
  /// An operation is not defined for the operand types.
  InvalidOperator {
    op: &'static str,
    lhs: Cow<'static, str>,
    rhs: Option<Cow<'static, str>>,
  },
  /// A conversion rejected the target type.
  NotConvertible {
    from: &'static str,
    to: Cow<'static, str>,
  },
  DivisionByZero,
  StackOverflow,
  NotHashable {
    got: &'static str,
  },
  NotCallable {
    got: &'static str,
  },
  NotIterable {
    got: &'static str,
  },
  InvalidKeyType {
    sel: Option<Cow<'static, str>>,
    want: Cow<'static, str>,
    got: Cow<'static, str>,
  },
  InvalidValueType {
    sel: Option<Cow<'static, str>>,
    want: Cow<'static, str>,
    got: Cow<'static, str>,
  },
  InvalidIndexType {
    sel: Option<Cow<'static, str>>,
    want: Cow<'static, str>,
    got: Cow<'static, str>,
  },
  InvalidArgumentType {
    name: Cow<'static, str>,
    want: Cow<'static, str>,
    got: Cow<'static, str>,
  },
  /// `want_max == usize::MAX` means "no upper bound".
  WrongNumArguments {
    want_min: usize,
    want_max: usize,
    got: usize,
  },
  MissingArgument {
    name: Cow<'static, str>,
  },
  NoSuchField {
    name: Cow<'static, str>,
  },
  IndexOutOfRange {
    index: i64,
    len: usize,
  },
  SliceOutOfRange {
    lo: i64,
    hi: i64,
    len: usize,
  },
  /// A value thrown by `throw`, caught by `try` or surfaced to the host.
  Exception(Value),
  /// The run was cancelled through its abort handle.
  Aborted,
  /// A worded runtime fault (immutability, iteration locks, limits).
  Message(Cow<'static, str>),
  Runtime(Box<RuntimeError>),
}

impl Error {
  pub fn message(message: impl Into<Cow<'static, str>>) -> Error {
    Error::Message(message.into())
  }

  pub(crate) fn invalid_binop(op: &'static str, lhs: &Value, rhs: &Value) -> Error {
    Error::InvalidOperator {
      op,
      lhs: Cow::borrowed(lhs.type_name()),
      rhs: Some(Cow::borrowed(rhs.type_name())),
    }
  }

  pub(crate) fn invalid_unop(op: &'static str, operand: &Value) -> Error {
    Error::InvalidOperator {
      op,
      lhs: Cow::borrowed(operand.type_name()),
      rhs: None,
    }
  }

  pub fn is_invalid_operator(&self) -> bool {
    matches!(self, Error::InvalidOperator { .. })
  }

  /// The innermost primary error: unwraps [`Error::Runtime`] wrappers.
  pub fn primary(&self) -> &Error {
    match self {
      Error::Runtime(rt) => rt.primary(),
      other => other,
    }
  }
}

impl Display for Error {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Error::InvalidOperator { op, lhs, rhs } => match rhs {
        Some(rhs) => write!(f, "unsupported operation: {lhs} {op} {rhs}"),
        None => write!(f, "unsupported operation: {op}{lhs}"),
      },
      Error::NotConvertible { from, to } => write!(f, "cannot convert {from} to {to}"),
      Error::DivisionByZero => write!(f, "division by zero"),
      Error::StackOverflow => write!(f, "stack overflow"),
      Error::NotHashable { got } => write!(f, "{got} is not hashable"),
      Error::NotCallable { got } => write!(f, "{got} is not callable"),
      Error::NotIterable { got } => write!(f, "{got} is not iterable"),
      Error::InvalidKeyType { sel, want, got } => {
        write!(f, "invalid key type")?;
        if let Some(sel) = sel {
          write!(f, " for '{sel}'")?;
        }
        write!(f, ": want {want}, got {got}")
      }
      Error::InvalidValueType { sel, want, got } => {
        write!(f, "invalid value type")?;
        if let Some(sel) = sel {
          write!(f, " for '{sel}'")?;
        }
        write!(f, ": want {want}, got {got}")
      }
      Error::InvalidIndexType { sel, want, got } => {
        write!(f, "invalid index type")?;
        if let Some(sel) = sel {
          write!(f, " for '{sel}'")?;
        }
        write!(f, ": want {want}, got {got}")
      }
      Error::InvalidArgumentType { name, want, got } => {
        write!(f, "invalid type for argument '{name}': want {want}, got {got}")
      }
      Error::WrongNumArguments {
        want_min,
        want_max,
        got,
      } => {
        write!(f, "wrong number of arguments: ")?;
        if want_min == want_max {
          write!(f, "want {want_min}")?;
        } else if got < want_min {
          write!(f, "want at least {want_min}")?;
        } else {
          write!(f, "want at most {want_max}")?;
        }
        write!(f, ", got {got}")
      }
      Error::MissingArgument { name } => write!(f, "missing argument for '{name}'"),
      Error::NoSuchField { name } => write!(f, "no such field '{name}'"),
      Error::IndexOutOfRange { index, len } => {
        write!(f, "index {index} out of range [0, {len})")
      }
      Error::SliceOutOfRange { lo, hi, len } => {
        write!(f, "invalid slice indices: required 0 <= {lo} <= {hi} <= {len}")
      }
      Error::Exception(value) => write!(f, "exception: {value:?}"),
      Error::Aborted => write!(f, "aborted"),
      Error::Message(message) => write!(f, "{message}"),
      Error::Runtime(rt) => write!(f, "{rt}"),
    }
  }
}

impl StdError for Error {}

/// One frame of a runtime trace.
#[derive(Debug, Clone)]
pub struct TraceFrame {
  /// Name of the function that was executing.
  pub name: Arc<str>,
  /// Span of the faulting instruction, or of the deferred-call site.
  pub span: Span,
  /// Resolved position, when the unit carries a line index.
  pub pos: Option<Pos>,
  /// The recorded position is a deferred-call site.
  pub defer: bool,
}

impl Display for TraceFrame {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if self.defer {
      write!(f, "in deferred call from {} at ", self.name)?;
    } else {
      write!(f, "in {} at ", self.name)?;
    }
    match self.pos {
      Some(pos) => write!(f, "{pos}"),
      None => write!(f, "{}", self.span),
    }
  }
}

/// The structured error a failing run returns: an ordered list of errors
/// (the first is the primary fault, the rest were raised by deferred calls
/// during unwinding) and the accumulated source-position trace.
#[derive(Debug, Clone)]
pub struct RuntimeError {
  pub errors: Vec<Error>,
  pub trace: Vec<TraceFrame>,
}

impl RuntimeError {
  pub fn new(error: Error) -> RuntimeError {
    RuntimeError {
      errors: vec![error],
      trace: vec![],
    }
  }

  pub fn primary(&self) -> &Error {
    self.errors[0].primary()
  }

  pub(crate) fn push_frame(&mut self, name: Arc<str>, span: Span, pos: Option<Pos>, defer: bool) {
    self.trace.push(TraceFrame {
      name,
      span,
      pos,
      defer,
    });
  }

  /// Splice the errors and trace of a nested failure (typically a deferred
  /// call raising during unwinding) into this carrier.
  pub(crate) fn absorb(&mut self, error: Error) {
    match error {
      Error::Runtime(rt) => {
        self.errors.extend(rt.errors);
        self.trace.extend(rt.trace);
      }
      other => self.errors.push(other),
    }
  }
}

impl Display for RuntimeError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.errors[0])?;
    if !self.trace.is_empty() {
      write!(f, "\n  {}", self.trace.iter().join("\n  "))?;
    }
    for error in self.errors.iter().skip(1) {
      write!(f, "\nalso raised: {error}")?;
    }
    Ok(())
  }
}

impl From<RuntimeError> for Error {
  fn from(value: RuntimeError) -> Self {
    Error::Runtime(Box::new(value))
  }
}
