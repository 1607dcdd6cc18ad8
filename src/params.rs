//! Input and output parameter declarations.

use crate::dataflow::{InputSource, Sender};

/// How one inbound channel binds into a firing.
pub enum InParam {
    /// Bind by value into the script context.
    Value { name: String },
    /// Stage as a file (or files) under a declared pattern.
    File { name: String, pattern: String },
    /// Export as an environment variable.
    Env { name: String },
    /// Pipe into the command.
    Stdin,
    /// Iterate: the firing fans out over each element.
    Each { name: String },
    /// A tuple of inner params bound jointly from a single list value.
    Set { inner: Vec<InParam> },
    /// Resolve once at the first firing, reuse by-reference after; the
    /// optional channel receives the final value on operator stop.
    SharedValue { name: String, into: Option<Sender> },
    SharedFile {
        name: String,
        pattern: String,
        into: Option<Sender>,
    },
}

impl InParam {
    pub fn is_shared(&self) -> bool {
        matches!(
            self,
            InParam::SharedValue { .. } | InParam::SharedFile { .. }
        ) || matches!(self, InParam::Set { inner } if inner.iter().any(InParam::is_shared))
    }

    pub fn is_each(&self) -> bool {
        matches!(self, InParam::Each { .. })
    }
}

/// One wired input port: declaration plus its source.
pub struct InPort {
    pub param: InParam,
    pub source: InputSource,
}

/// How a completed firing binds onto an outbound channel.
pub enum OutParam {
    /// Emit the context value under `name`.
    Value { name: String },
    /// Emit the work-dir files matching `pattern` (single path, or a list).
    File { pattern: String },
    /// Emit the captured standard output.
    Stdout,
    /// Emit a list built from the inner declarations.
    Set { inner: Vec<OutParam> },
}

/// One wired output port: declaration plus its write channel.
pub struct OutPort {
    pub param: OutParam,
    pub tx: Sender,
}
