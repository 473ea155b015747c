use ndarray::prelude::*;
use ndarray::RemoveAxis;

use crate::traits::check_batch_shape;
use crate::{Layer, LayerError};

/// Layer that adds a learned bias to each input. The output shape is the same
/// as the input shape, and there is one bias per element of a single sample,
/// broadcast over the batch axis.
#[derive(Debug)]
pub struct BiasLayer<D: Dimension> {
    /// The input shape of this layer, for a batch with one sample.
    ///
    /// Invariant: `shape[0] == 1`
    shape: D,
    /// Biases, shaped like one sample (leading axis of length 1).
    /// Zero-initialized; biases are conventionally not regularized.
    biases: Array<f32, D>,
    acts: Option<Array<f32, D>>,
    gradient: Option<Array<f32, D>>,
}

impl<D: Dimension> BiasLayer<D> {
    pub fn new(mut input_shape: D) -> Self {
        input_shape.as_array_view_mut()[0] = 1;
        BiasLayer {
            shape: input_shape.clone(),
            biases: Array::zeros(input_shape),
            acts: None,
            gradient: None,
        }
    }

    pub fn biases(&self) -> ArrayView<'_, f32, D> {
        self.biases.view()
    }

    pub fn biases_mut(&mut self) -> ArrayViewMut<'_, f32, D> {
        self.biases.view_mut()
    }

    /// The batch gradient stored by the last backward pass, if kept.
    pub fn gradient(&self) -> Option<ArrayView<'_, f32, D>> {
        self.gradient.as_ref().map(|g| g.view())
    }
}

impl<D> Layer<D> for BiasLayer<D>
where
    D: Dimension + RemoveAxis,
{
    type Output = D;

    fn input_shape(&self) -> D {
        self.shape.clone()
    }

    fn output_shape(&self) -> D {
        self.shape.clone()
    }

    fn forward(
        &mut self,
        inputs: ArrayView<'_, f32, D>,
        keep_acts: bool,
    ) -> Result<Array<f32, D>, LayerError> {
        check_batch_shape(&self.shape, inputs.raw_dim())?;
        let acts = &inputs + &self.biases;
        if keep_acts {
            self.acts = Some(acts.clone());
        }
        Ok(acts)
    }

    fn backward(
        &mut self,
        gradient: ArrayView<'_, f32, D>,
        keep_grad: bool,
    ) -> Result<Array<f32, D>, LayerError> {
        // Bias addition has a unit Jacobian: the gradient passes through
        // unchanged, and the passed gradient doubles as the parameter
        // gradient for the update step.
        let grad = gradient.to_owned();
        if keep_grad {
            self.gradient = Some(grad.clone());
        }
        Ok(grad)
    }

    fn update_parameters(&mut self, learn_rate: f32, _regu_strength: f32) {
        if let Some(gradient) = &self.gradient {
            if let Some(mean) = gradient.mean_axis(Axis(0)) {
                self.biases
                    .index_axis_mut(Axis(0), 0)
                    .scaled_add(-learn_rate, &mean);
            }
        }
    }
}
