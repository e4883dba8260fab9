pub mod catalog;
pub mod chain;
pub mod config;
pub mod error;
pub mod event;
pub mod mapping;
pub mod schema;
pub mod traits;
pub mod types;

pub use catalog::{AgentDescriptor, CatalogSnapshot, FileCatalog, StaticCatalog, TrustTier};
pub use chain::{ChainDefinition, Edge, EdgeId, GraphNode, MergePolicy, NodeId, NodeKind, TransformSpec};
pub use config::WeftConfig;
pub use error::{InvocationError, Result, WeftError};
pub use event::EventBus;
pub use mapping::{coerce_value, CoercionError, FieldMapping, FieldSource, MatchKind};
pub use schema::{FieldSpec, FieldType, SchemaDescriptor, SchemaHash};
pub use traits::{AgentInvoker, CatalogSource, GenerativeTransformer, RecipeStore, RunSink};
pub use types::*;
