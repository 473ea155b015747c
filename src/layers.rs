//! The fixed layer set: convolution, bias, rectified-linear, fully-connected.

mod bias;
mod conv;
mod fc;
mod relu;

pub use bias::BiasLayer;
pub use conv::ConvLayer;
pub use fc::FCLayer;
pub use relu::ReLuLayer;
