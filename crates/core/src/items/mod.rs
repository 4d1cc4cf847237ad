//! Todo items: the unit synchronized by the engine.

mod items_model;

pub use items_model::*;
