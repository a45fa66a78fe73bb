//! Forward hooks and the indirection that survives layer conversion
//!
//! A hook wraps a layer's forward entry point. It does not call the layer's
//! `forward` (which would dispatch back into the hook); it keeps the raw
//! forward function it was attached over in [`AttachedHook`]. Converting a
//! layer to compressed form rebinds that function so the hook keeps working.

use crate::layer::LinearLayer;
use candle_core::Tensor;
use qlayer_common::{QLayerError, Result};
use std::fmt;
use std::sync::Arc;

/// Raw forward entry point of a layer variant.
pub type ForwardFn = fn(&LinearLayer, &Tensor) -> Result<Tensor>;

/// Behaviour injected around a layer's forward pass.
pub trait ModuleHook: Send + Sync + fmt::Debug {
    /// Runs before the forward pass. Returning `Some` replaces the input.
    fn pre_forward(&self, _input: &Tensor) -> Result<Option<Tensor>> {
        Ok(None)
    }

    /// Runs on the forward output.
    fn post_forward(&self, output: Tensor) -> Result<Tensor> {
        Ok(output)
    }
}

/// Forward entry point of a dense layer.
pub fn dense_forward(layer: &LinearLayer, input: &Tensor) -> Result<Tensor> {
    match layer {
        LinearLayer::Dense(dense) => dense.forward(input),
        LinearLayer::Compressed(_) => Err(QLayerError::state(
            "dense forward invoked on a compressed layer; the hook was not rebound",
        )),
    }
}

/// Forward entry point of a compressed layer.
pub fn compressed_forward(layer: &LinearLayer, input: &Tensor) -> Result<Tensor> {
    match layer {
        LinearLayer::Compressed(compressed) => compressed.forward(input),
        LinearLayer::Dense(_) => {
            Err(QLayerError::state("compressed forward invoked on a dense layer"))
        }
    }
}

/// A hook together with the forward function it wraps.
#[derive(Clone)]
pub struct AttachedHook {
    hook: Arc<dyn ModuleHook>,
    original_forward: ForwardFn,
}

impl AttachedHook {
    pub fn new(hook: Arc<dyn ModuleHook>, original_forward: ForwardFn) -> Self {
        Self { hook, original_forward }
    }

    pub fn hook(&self) -> &Arc<dyn ModuleHook> {
        &self.hook
    }

    /// Point the stored forward reference at a new entry point.
    pub fn rebind_forward(&mut self, forward: ForwardFn) {
        self.original_forward = forward;
    }

    /// `pre_forward`, then the wrapped forward, then `post_forward`.
    pub fn run(&self, layer: &LinearLayer, input: &Tensor) -> Result<Tensor> {
        let replaced = self.hook.pre_forward(input)?;
        let input = replaced.as_ref().unwrap_or(input);
        let output = (self.original_forward)(layer, input)?;
        self.hook.post_forward(output)
    }
}

impl fmt::Debug for AttachedHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachedHook").field("hook", &self.hook).finish_non_exhaustive()
    }
}
