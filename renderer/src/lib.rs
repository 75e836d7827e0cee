pub mod config;
pub mod dispatcher;
pub mod environment;
pub mod error;
pub mod evaluator;
pub mod key;
pub mod registry;
pub mod runtime_value;
pub mod store;

pub use config::{RenderConfig, StoreFailurePolicy};
pub use dispatcher::{RenderOutput, RenderPass, RenderStats, Renderer, render_tree};
pub use error::{DiagnosticError, RuntimeError};
pub use registry::{LoadError, TemplateRegistry};
pub use runtime_value::RuntimeValue;
pub use store::{CacheStore, FileStore, MemoryStore, StoreError};
