pub mod reconciler;
pub mod renderer;
