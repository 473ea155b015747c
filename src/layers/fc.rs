use ndarray::prelude::*;
use ndarray::RemoveAxis;
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::Rng;

use crate::traits::check_batch_shape;
use crate::{Layer, LayerError};

/// A fully-connected layer.
///
/// Each sample is flattened into a row and multiplied by a learned
/// `(flat_dim, n_neurons)` weight matrix, so the output shape is
/// `(batch, n_neurons)` whatever the input dimensionality.
#[derive(Debug)]
pub struct FCLayer<D> {
    /// The input shape of this layer, for a batch with one sample.
    ///
    /// Invariant: `input_shape[0] == 1`
    input_shape: D,
    n_neurons: usize,
    weights: Array2<f32>,
    /// Flattened inputs from the last forward pass. Cached unconditionally;
    /// the backward pass cannot run without them.
    inputs: Option<Array2<f32>>,
    acts: Option<Array2<f32>>,
    /// Weight gradient from the last backward pass, shaped like `weights`.
    gradient: Option<Array2<f32>>,
}

impl<D> FCLayer<D>
where
    D: Dimension + RemoveAxis,
{
    /// Create a fully-connected layer of `n_neurons` cells for inputs of the
    /// given shape (axis 0 is ignored).
    ///
    /// Weights are He-initialized from `rng`: standard normal values scaled
    /// by `sqrt(2 / flat_dim)`.
    pub fn new<R>(mut input_shape: D, n_neurons: usize, rng: &mut R) -> Result<Self, LayerError>
    where
        R: Rng + ?Sized,
    {
        input_shape.as_array_view_mut()[0] = 1;
        let flat_dim = input_shape.size();
        if n_neurons == 0 {
            return Err(LayerError::Config(
                "a fully-connected layer needs at least one neuron".into(),
            ));
        }
        if flat_dim == 0 {
            return Err(LayerError::Config(
                "fully-connected input shape has zero elements".into(),
            ));
        }
        let weights = (2.0 / flat_dim as f32).sqrt()
            * Array::random_using((flat_dim, n_neurons), StandardNormal, rng);
        Ok(FCLayer {
            input_shape,
            n_neurons,
            weights,
            inputs: None,
            acts: None,
            gradient: None,
        })
    }

    pub fn weights(&self) -> ArrayView2<'_, f32> {
        self.weights.view()
    }

    pub fn weights_mut(&mut self) -> ArrayViewMut2<'_, f32> {
        self.weights.view_mut()
    }

    /// The weight gradient stored by the last backward pass.
    pub fn gradient(&self) -> Option<ArrayView2<'_, f32>> {
        self.gradient.as_ref().map(|g| g.view())
    }
}

impl<D> Layer<D> for FCLayer<D>
where
    D: Dimension + RemoveAxis,
{
    type Output = Ix2;

    fn input_shape(&self) -> D {
        self.input_shape.clone()
    }

    fn output_shape(&self) -> Ix2 {
        Ix2(1, self.n_neurons)
    }

    fn forward(
        &mut self,
        inputs: ArrayView<'_, f32, D>,
        keep_acts: bool,
    ) -> Result<Array2<f32>, LayerError> {
        check_batch_shape(&self.input_shape, inputs.raw_dim())?;
        let n = inputs.len_of(Axis(0));
        let flat = inputs
            .to_owned()
            .into_shape((n, self.input_shape.size()))
            .expect("per-sample shape was just checked");
        let acts = flat.dot(&self.weights);
        self.inputs = Some(flat);
        if keep_acts {
            self.acts = Some(acts.clone());
        }
        Ok(acts)
    }

    fn backward(
        &mut self,
        gradient: ArrayView2<'_, f32>,
        _keep_grad: bool,
    ) -> Result<Array<f32, D>, LayerError> {
        let flat = self.inputs.as_ref().ok_or(LayerError::BackwardBeforeForward)?;
        let n = flat.len_of(Axis(0));
        assert_eq!(
            gradient.raw_dim().into_pattern(),
            (n, self.n_neurons),
            "gradient must be shaped like the last forward output"
        );

        let dw = flat.t().dot(&gradient);
        let dx = gradient.dot(&self.weights.t());

        let mut shape = self.input_shape.clone();
        shape.as_array_view_mut()[0] = n;
        let dx = dx
            .into_shape(shape)
            .expect("rows of the gradient match the input shape");

        // The weight gradient is always needed for the update step, so it is
        // stored regardless of `keep_grad`.
        self.gradient = Some(dw);
        Ok(dx)
    }

    fn update_parameters(&mut self, learn_rate: f32, regu_strength: f32) {
        if let Some(gradient) = &self.gradient {
            let len = gradient.len_of(Axis(0));
            if len == 0 {
                return;
            }
            self.weights *= 1.0 - regu_strength;
            self.weights.scaled_add(-learn_rate / len as f32, gradient);
        }
    }
}
