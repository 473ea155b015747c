mod traits;
pub use traits::{Layer, LayerError};

pub mod layers;
