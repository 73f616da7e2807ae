pub mod bindings;
pub mod compiler;
pub mod engine;
pub mod pool;
pub mod types;

pub use bindings::HostContext;
pub use compiler::{ScriptArtifact, ScriptCompiler};
pub use engine::ScriptEngine;
pub use pool::{VmFactory, VmPool};
pub use types::{ScriptRequest, ScriptResponse};
