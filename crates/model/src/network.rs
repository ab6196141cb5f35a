//! Named networks that own their parameters.
//!
//! Every trainable module of a pipeline (`netG`, `netD`, `shape_encoder`, ...)
//! is a [`Network`]: a `VarMap` holding its variables plus the module built on
//! top of it. Checkpoints and optimizers address parameters through the map
//! by name.

use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::{ModuleT, VarBuilder, VarMap};
use layers::{init, InitKind};

/// Forward capability of networks that take a condition next to their input.
pub trait ConditionedModule {
    fn forward_c(&self, xs: &Tensor, condition: &Tensor, train: bool) -> Result<Tensor>;
}

pub struct Network<M> {
    name: String,
    varmap: VarMap,
    module: M,
}

impl<M> Network<M> {
    /// Creates a fresh `VarMap` and lets `build` register variables under it.
    pub fn build<F>(name: &str, dtype: DType, device: &Device, build: F) -> Result<Self>
    where
        F: FnOnce(VarBuilder) -> Result<M>,
    {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, device);
        let module = build(vb)?;
        Ok(Self {
            name: name.to_string(),
            varmap,
            module,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    /// Re-initialises all variables with `kind`.
    pub fn init_weights(&self, kind: InitKind) -> Result<()> {
        init::init_varmap(&self.varmap, kind)
    }

    /// Variables updated by the optimizer, sorted by name.
    pub fn trainable_vars(&self) -> Vec<(String, Var)> {
        trainable_vars(&self.varmap)
    }

    pub fn num_parameters(&self) -> usize {
        self.trainable_vars()
            .iter()
            .map(|(_, var)| var.elem_count())
            .sum()
    }
}

/// Variables of `varmap` sorted by name. Batch-norm running statistics are
/// excluded; they are state, not parameters.
pub fn trainable_vars(varmap: &VarMap) -> Vec<(String, Var)> {
    let data = match varmap.data().lock() {
        Ok(data) => data,
        Err(poisoned) => poisoned.into_inner(),
    };
    let mut vars: Vec<(String, Var)> = data
        .iter()
        .filter(|(name, _)| !name.contains("running_"))
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    vars
}

impl<T: ModuleT + ?Sized> Network<Box<T>> {
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        self.module.forward_t(xs, train)
    }
}

impl<T: ConditionedModule + ?Sized> Network<Box<T>> {
    pub fn forward_c(&self, xs: &Tensor, condition: &Tensor, train: bool) -> Result<Tensor> {
        self.module.forward_c(xs, condition, train)
    }
}
