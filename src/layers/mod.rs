/// Neural network layer primitives
///
/// Both the frozen backbone and the refinement stages are stacks of
/// same-padded convolutions, so a single block type covers them.

pub mod conv;

pub use conv::ConvBlock;
