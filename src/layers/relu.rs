use ndarray::prelude::*;
use ndarray::{RemoveAxis, Zip};

use crate::traits::check_batch_shape;
use crate::{Layer, LayerError};

/// Elementwise `max(0, x)` rectifier. No learnable parameters.
///
/// The backward pass needs to know which positions the forward pass clipped
/// to zero, so `forward` must be called with `keep_acts` before `backward`.
#[derive(Debug)]
pub struct ReLuLayer<D: Dimension> {
    /// The input shape of this layer, for a batch with one sample.
    ///
    /// Invariant: `shape[0] == 1`
    shape: D,
    acts: Option<Array<f32, D>>,
    gradient: Option<Array<f32, D>>,
}

impl<D: Dimension> ReLuLayer<D> {
    pub fn new(mut input_shape: D) -> Self {
        input_shape.as_array_view_mut()[0] = 1;
        ReLuLayer {
            shape: input_shape,
            acts: None,
            gradient: None,
        }
    }

    /// The masked gradient stored by the last backward pass, if kept.
    pub fn gradient(&self) -> Option<ArrayView<'_, f32, D>> {
        self.gradient.as_ref().map(|g| g.view())
    }
}

impl<D> Layer<D> for ReLuLayer<D>
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
        let acts = inputs.mapv(|v| v.max(0.0));
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
        let acts = self.acts.as_ref().ok_or(LayerError::BackwardBeforeForward)?;
        // Positions clipped to zero get zero gradient; an activation of
        // exactly zero counts as clipped.
        let grad = Zip::from(acts)
            .and(&gradient)
            .map_collect(|&a, &g| if a > 0.0 { g } else { 0.0 });
        if keep_grad {
            self.gradient = Some(grad.clone());
        }
        Ok(grad)
    }
}
