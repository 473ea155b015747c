use std::fmt::Debug;

use ndarray::prelude::*;
use ndarray::RemoveAxis;
use thiserror::Error;

/// Errors surfaced by layer construction and the forward/backward passes.
///
/// All of these are terminal for the current training step: a failed call
/// performs no partial computation and leaves the layer's parameters and
/// caches untouched.
#[derive(Debug, Error)]
pub enum LayerError {
    /// A batch's per-sample shape disagrees with the layer's declared input
    /// shape. Axis 0 (the batch axis) is never part of the comparison.
    #[error("input shape mismatch: layer expects per-sample shape {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// `backward` was called before a `forward` call stored the activations
    /// (or inputs) this layer needs to compute its gradients.
    #[error("backward called before forward stored the required activations")]
    BackwardBeforeForward,

    /// Construction parameters that can never produce a working layer.
    #[error("invalid layer configuration: {0}")]
    Config(String),
}

/// A feed-forward network layer.
///
/// Axis 0 of every input, output and gradient array is the mini-batch axis;
/// each `inputs[i]` is a single sample. A layer's declared shapes fix the
/// remaining axes at construction time.
///
/// The expected call sequence per training step is `forward` on every layer
/// left to right, `backward` right to left (feeding each layer's returned
/// input gradient to the layer before it), then `update_parameters` on every
/// layer. Layers that need cached state for `backward` reject out-of-order
/// calls with [`LayerError::BackwardBeforeForward`].
pub trait Layer<D>: Debug
where
    D: Dimension + RemoveAxis,
{
    /// Type of the output shape, typically one of `Ix2`, `Ix4`, etc.
    ///
    /// Axis 0 of this is always the mini-batch axis.
    type Output: Dimension + RemoveAxis;

    /// The input shape this layer accepts, for a batch with one sample.
    fn input_shape(&self) -> D;

    /// The output shape this layer produces, for a batch with one sample.
    fn output_shape(&self) -> Self::Output;

    /// Compute this layer's output for a batch of inputs.
    ///
    /// Fails with [`LayerError::ShapeMismatch`] if the per-sample shape of
    /// `inputs` is not the layer's declared input shape.
    ///
    /// If `keep_acts` is true, the output is also stored in the layer's
    /// activation cache; layers whose backward pass reads its own output
    /// (ReLu) require this before `backward`. The output is computed as a
    /// pure function of inputs and parameters before any cache is written.
    fn forward(
        &mut self,
        inputs: ArrayView<'_, f32, D>,
        keep_acts: bool,
    ) -> Result<Array<f32, Self::Output>, LayerError>;

    /// Back-propagate a gradient through this layer.
    ///
    /// `gradient` must be shaped like this layer's last output; the returned
    /// array is shaped like its last input and is the gradient to feed to the
    /// previous layer. Layers with learnable weights always retain their
    /// parameter gradient for the next `update_parameters` call; `keep_grad`
    /// controls gradient caching everywhere else.
    fn backward(
        &mut self,
        gradient: ArrayView<'_, f32, Self::Output>,
        keep_grad: bool,
    ) -> Result<Array<f32, D>, LayerError>;

    /// Apply one gradient-descent step to this layer's parameters.
    ///
    /// `param ← param·(1 − regu_strength) − learn_rate·gradient/len`, where
    /// `len` is the leading-axis length of the stored gradient. Layers
    /// without parameters (and layers with no stored gradient) do nothing.
    fn update_parameters(&mut self, _learn_rate: f32, _regu_strength: f32) {}
}

/// Check a batch against a declared shape, ignoring the batch axis.
///
/// `expected` follows the crate-wide convention of a full dimension with
/// axis 0 set to 1.
pub(crate) fn check_batch_shape<D: Dimension>(expected: &D, actual: D) -> Result<(), LayerError> {
    let mut batch_of_one = actual;
    batch_of_one.as_array_view_mut()[0] = 1;
    if batch_of_one != *expected {
        return Err(LayerError::ShapeMismatch {
            expected: expected.slice()[1..].to_vec(),
            actual: batch_of_one.slice()[1..].to_vec(),
        });
    }
    Ok(())
}
