mod registry;
mod selectors;

pub use registry::{DirectiveRegistry, DirectiveSpec, DEFAULT_DIRECTIVE};
pub use selectors::{DirectiveSelection, DirectiveSelector};
