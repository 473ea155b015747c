//! Convolution over image batches.
//!
//! Image batches have the shape `(num_images, num_channels, height, width)`.
//! Filter banks have the shape `(num_filters, num_channels, field, field)`.
//!
//! All three kernels below share one alignment convention: an output pixel
//! `(i, j)` sees the input window starting at `(i - p, j - p)` with
//! `p = (field - 1) / 2` and zeros outside the image. That makes the two
//! backward kernels the exact transpose of the forward one, which is what the
//! finite-difference tests check.

use ndarray::prelude::*;
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::Rng;
use rayon::prelude::*;

use crate::traits::check_batch_shape;
use crate::{Layer, LayerError};

/// "Same"-mode 2D cross-correlation, accumulated into `out`.
///
/// `out[i, j] += Σ x[i + u - p, j + v - p] · kernel[u, v]` over all kernel
/// cells `(u, v)`, with out-of-range input pixels treated as zero.
fn correlate2d_same(x: ArrayView2<f32>, kernel: ArrayView2<f32>, mut out: ArrayViewMut2<f32>) {
    let (h, w) = x.raw_dim().into_pattern();
    let (kh, kw) = kernel.raw_dim().into_pattern();
    let (py, px) = ((kh - 1) / 2, (kw - 1) / 2);
    for i in 0..h {
        for j in 0..w {
            let mut acc = 0.0;
            for u in 0..kh {
                if i + u < py || i + u - py >= h {
                    continue;
                }
                for v in 0..kw {
                    if j + v < px || j + v - px >= w {
                        continue;
                    }
                    acc += x[[i + u - py, j + v - px]] * kernel[[u, v]];
                }
            }
            out[[i, j]] += acc;
        }
    }
}

/// Derivatives of loss with respect to one filter channel, accumulated into `dw`.
///
/// `dw[u, v] += Σ x[i + u - p, j + v - p] · g[i, j]` over all output pixels
/// `(i, j)` — the valid-mode correlation of the zero-padded input with the
/// output gradient.
fn correlate2d_dw(x: ArrayView2<f32>, g: ArrayView2<f32>, mut dw: ArrayViewMut2<f32>) {
    let (h, w) = x.raw_dim().into_pattern();
    let (kh, kw) = dw.raw_dim().into_pattern();
    let (py, px) = ((kh - 1) / 2, (kw - 1) / 2);
    for u in 0..kh {
        for v in 0..kw {
            let mut acc = 0.0;
            for i in 0..h {
                if i + u < py || i + u - py >= h {
                    continue;
                }
                for j in 0..w {
                    if j + v < px || j + v - px >= w {
                        continue;
                    }
                    acc += x[[i + u - py, j + v - px]] * g[[i, j]];
                }
            }
            dw[[u, v]] += acc;
        }
    }
}

/// "Same"-mode 2D convolution (spatially flipped kernel), accumulated into `dx`.
///
/// `dx[a, b] += Σ kernel[u, v] · g[a + p - u, b + p - v]` — how an output
/// gradient propagates back through [`correlate2d_same`].
fn convolve2d_same(g: ArrayView2<f32>, kernel: ArrayView2<f32>, mut dx: ArrayViewMut2<f32>) {
    let (h, w) = g.raw_dim().into_pattern();
    let (kh, kw) = kernel.raw_dim().into_pattern();
    let (py, px) = ((kh - 1) / 2, (kw - 1) / 2);
    for a in 0..h {
        for b in 0..w {
            let mut acc = 0.0;
            for u in 0..kh {
                if a + py < u || a + py - u >= h {
                    continue;
                }
                for v in 0..kw {
                    if b + px < v || b + px - v >= w {
                        continue;
                    }
                    acc += kernel[[u, v]] * g[[a + py - u, b + px - v]];
                }
            }
            dx[[a, b]] += acc;
        }
    }
}

/// A layer that learns a bank of small square 2D filters.
///
/// Forward computes, for every sample, the "same"-mode correlation of each
/// input channel with each filter, summed over channels; the channel axis
/// goes from `num_channels` to `num_filters` and the spatial size is
/// unchanged.
#[derive(Debug)]
pub struct ConvLayer {
    /// The input shape of this layer, for a batch with one image.
    ///
    /// Invariant: `input_shape[0] == 1`
    input_shape: Ix4,
    n_filters: usize,
    /// Filter bank, shape `(n_filters, num_channels, field, field)`.
    weights: Array4<f32>,
    /// Raw inputs from the last forward pass. Cached unconditionally; the
    /// backward pass cannot run without them.
    inputs: Option<Array4<f32>>,
    acts: Option<Array4<f32>>,
    /// Filter gradient from the last backward pass, shaped like `weights`.
    gradient: Option<Array4<f32>>,
}

impl ConvLayer {
    /// Create a convolutional layer for inputs shaped
    /// `(_, num_channels, height, width)` (axis 0 is ignored).
    ///
    /// Filters are `field × field` and He-initialized from `rng`: standard
    /// normal values scaled by `sqrt(2 / fan_in)` where
    /// `fan_in = num_channels · field²`.
    pub fn new<R>(
        mut input_shape: Ix4,
        n_filters: usize,
        field: usize,
        rng: &mut R,
    ) -> Result<Self, LayerError>
    where
        R: Rng + ?Sized,
    {
        input_shape.as_array_view_mut()[0] = 1;
        let (_, channels, height, width) = input_shape.into_pattern();
        if field == 0 || field > height.min(width) {
            return Err(LayerError::Config(format!(
                "convolution field {field} does not fit a {height}x{width} input"
            )));
        }
        let fan_in = channels * field * field;
        let weights = (2.0 / fan_in as f32).sqrt()
            * Array::random_using((n_filters, channels, field, field), StandardNormal, rng);
        Ok(ConvLayer {
            input_shape,
            n_filters,
            weights,
            inputs: None,
            acts: None,
            gradient: None,
        })
    }

    pub fn weights(&self) -> ArrayView4<'_, f32> {
        self.weights.view()
    }

    pub fn weights_mut(&mut self) -> ArrayViewMut4<'_, f32> {
        self.weights.view_mut()
    }

    /// The filter gradient stored by the last backward pass.
    pub fn gradient(&self) -> Option<ArrayView4<'_, f32>> {
        self.gradient.as_ref().map(|g| g.view())
    }
}

impl Layer<Ix4> for ConvLayer {
    type Output = Ix4;

    fn input_shape(&self) -> Ix4 {
        self.input_shape
    }

    fn output_shape(&self) -> Ix4 {
        let (_, _, height, width) = self.input_shape.into_pattern();
        Ix4(1, self.n_filters, height, width)
    }

    fn forward(
        &mut self,
        inputs: ArrayView4<'_, f32>,
        keep_acts: bool,
    ) -> Result<Array4<f32>, LayerError> {
        check_batch_shape(&self.input_shape, inputs.raw_dim())?;
        let (n, _, height, width) = inputs.raw_dim().into_pattern();
        let weights = &self.weights;

        let mut outputs = Array4::zeros((n, self.n_filters, height, width));
        // Each sample's output planes are disjoint, so the batch axis can run
        // in parallel.
        outputs
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(inputs.axis_iter(Axis(0)).into_par_iter())
            .for_each(|(mut out, image)| {
                for (k, mut plane) in out.axis_iter_mut(Axis(0)).enumerate() {
                    for (c, channel) in image.axis_iter(Axis(0)).enumerate() {
                        correlate2d_same(
                            channel,
                            weights.slice(s![k, c, .., ..]),
                            plane.view_mut(),
                        );
                    }
                }
            });

        self.inputs = Some(inputs.to_owned());
        if keep_acts {
            self.acts = Some(outputs.clone());
        }
        Ok(outputs)
    }

    fn backward(
        &mut self,
        gradient: ArrayView4<'_, f32>,
        _keep_grad: bool,
    ) -> Result<Array4<f32>, LayerError> {
        let inputs = self.inputs.as_ref().ok_or(LayerError::BackwardBeforeForward)?;
        let (n, channels, height, width) = inputs.raw_dim().into_pattern();
        assert_eq!(
            gradient.raw_dim().into_pattern(),
            (n, self.n_filters, height, width),
            "gradient must be shaped like the last forward output"
        );
        let weights = &self.weights;
        let weight_dim = weights.raw_dim();

        // Filter gradient: each rayon task sums its samples into a private
        // partial, and the partials are reduced by addition afterward.
        let dw = inputs
            .axis_iter(Axis(0))
            .into_par_iter()
            .zip(gradient.axis_iter(Axis(0)).into_par_iter())
            .fold(
                || Array4::zeros(weight_dim),
                |mut dw, (image, grad)| {
                    for (k, grad_plane) in grad.axis_iter(Axis(0)).enumerate() {
                        for (c, channel) in image.axis_iter(Axis(0)).enumerate() {
                            correlate2d_dw(channel, grad_plane, dw.slice_mut(s![k, c, .., ..]));
                        }
                    }
                    dw
                },
            )
            .reduce(|| Array4::zeros(weight_dim), |a, b| a + b);

        // Input gradient: convolution, not correlation. The kernel is
        // spatially flipped relative to the forward pass.
        let mut dx = Array4::zeros((n, channels, height, width));
        dx.axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(gradient.axis_iter(Axis(0)).into_par_iter())
            .for_each(|(mut dxi, grad)| {
                for (c, mut channel) in dxi.axis_iter_mut(Axis(0)).enumerate() {
                    for (k, grad_plane) in grad.axis_iter(Axis(0)).enumerate() {
                        convolve2d_same(
                            grad_plane,
                            weights.slice(s![k, c, .., ..]),
                            channel.view_mut(),
                        );
                    }
                }
            });

        // The filter gradient is always needed for the update step, so it is
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
