use crate::{CompileError, RuntimeObject};

/// Turns a content snapshot into a runtime object.
///
/// Compilation is the expensive part of keeping a proxy up to date: it may load resources from
/// storage and block while doing so. The engine therefore only ever calls it from a spawned
/// task, with no engine lock held.
///
/// A failed compile is not fatal. The proxy is simply left without a runtime object until the
/// next successful compile.
pub trait Compiler: Send + Sync + 'static {
    /// The snapshot type produced by the content nodes this compiler understands.
    type Snapshot: Send + 'static;

    /// The runtime object type produced by this compiler.
    type Object: RuntimeObject;

    /// Builds a runtime object from a snapshot. May block.
    ///
    /// # Errors
    ///
    /// Returns an error if a referenced resource is missing or the object cannot be built.
    fn compile(&self, snapshot: Self::Snapshot) -> Result<Self::Object, CompileError>;
}
