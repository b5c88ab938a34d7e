//! Rendering adapters for the world database.
//!
//! # Invariants
//! - Adapters observe world state through the `SceneGraph` boundary or a
//!   shared reference; they never mutate the database.
//! - Everything here works headless. No GPU or window is required.

mod recording;
mod renderer;

pub use recording::{RecordingSceneGraph, SceneCall};
pub use renderer::{DebugTextRenderer, RenderView, Renderer};

pub fn crate_info() -> &'static str {
    "worldbase-render v0.1.0"
}
