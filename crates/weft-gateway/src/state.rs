use weft_engine::Engine;

/// Shared application state for axum handlers.
pub struct AppState {
    pub engine: Engine,
}
