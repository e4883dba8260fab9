pub mod confirmation;
pub mod engine;
pub mod executor;
pub mod matcher;
pub mod merge;
pub mod recipes;
pub mod recorder;
pub mod resolver;
pub mod run_log;
pub mod validator;

pub use confirmation::ConfirmationBroker;
pub use engine::{Engine, EngineBuilder};
pub use executor::{Executor, RunOptions};
pub use matcher::{SchemaCache, SchemaMatcher};
pub use merge::{merge, Contribution, MergeConflict, Merged};
pub use recipes::MemoryRecipeStore;
pub use recorder::{MemoryRunStore, RunRecorder};
pub use resolver::{ConfirmationPolicy, TransformError, TransformResolver};
pub use run_log::RunLogger;
pub use validator::{validate, ValidatedGraph, ValidationError};
