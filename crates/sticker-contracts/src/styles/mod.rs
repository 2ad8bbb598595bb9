mod registry;
mod selectors;

pub use registry::{StyleRegistry, StyleSpec, DEFAULT_STYLE_ID};
pub use selectors::StyleSelection;
