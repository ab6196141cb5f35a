//! Tag-to-constructor registries for generators and discriminators.
//!
//! Configuration names a network by tag (`resnet_9blocks`, `unet_256`,
//! `n_layers`, ...). A registry maps each tag to a constructor closure that
//! builds the network behind a narrow forward interface. Unknown tags fail at
//! construction time with the list of known tags.

use std::collections::BTreeMap;

use candle_core::{Error, Result};
use candle_nn::{ModuleT, VarBuilder};

use crate::{
    config::{ConditionedGeneratorConfig, DiscriminatorConfig, GeneratorConfig},
    discriminator::{NLayerDiscriminator, PixelDiscriminator},
    generator::{ConditionedResnetGenerator, ResnetGenerator, UnetGenerator},
    network::ConditionedModule,
};

pub type Constructor<S, T> = Box<dyn Fn(&S, VarBuilder) -> Result<T> + Send + Sync>;

pub struct Registry<S, T> {
    kind: &'static str,
    entries: BTreeMap<&'static str, Constructor<S, T>>,
}

impl<S, T> Registry<S, T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
        }
    }

    pub fn register<F>(&mut self, tag: &'static str, constructor: F)
    where
        F: Fn(&S, VarBuilder) -> Result<T> + Send + Sync + 'static,
    {
        self.entries.insert(tag, Box::new(constructor));
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.entries.contains_key(tag)
    }

    pub fn tags(&self) -> Vec<&'static str> {
        self.entries.keys().copied().collect()
    }

    pub fn build(&self, tag: &str, config: &S, vb: VarBuilder) -> Result<T> {
        match self.entries.get(tag) {
            Some(constructor) => constructor(config, vb),
            None => Err(Error::Msg(format!(
                "{} model name [{tag}] is not recognized (expected one of: {})",
                self.kind,
                self.tags().join(", ")
            ))),
        }
    }
}

pub type GeneratorRegistry = Registry<GeneratorConfig, Box<dyn ModuleT>>;
pub type ConditionedGeneratorRegistry =
    Registry<ConditionedGeneratorConfig, Box<dyn ConditionedModule>>;
pub type DiscriminatorRegistry = Registry<DiscriminatorConfig, Box<dyn ModuleT>>;

fn resnet(n_blocks: Option<usize>) -> impl Fn(&GeneratorConfig, VarBuilder) -> Result<Box<dyn ModuleT>> {
    move |config, vb| {
        let mut config = config.clone();
        if let Some(n) = n_blocks {
            config.n_blocks = n;
        }
        Ok(Box::new(ResnetGenerator::new(config, vb)?) as Box<dyn ModuleT>)
    }
}

fn unet(num_downs: Option<usize>) -> impl Fn(&GeneratorConfig, VarBuilder) -> Result<Box<dyn ModuleT>> {
    move |config, vb| {
        let mut config = config.clone();
        if let Some(n) = num_downs {
            config.num_downs = n;
        }
        Ok(Box::new(UnetGenerator::new(config, vb)?) as Box<dyn ModuleT>)
    }
}

/// Generators: `resnet_9blocks`, `resnet_6blocks`, `resnet` (block count
/// from config), `unet_128`, `unet_256`, `unet` (depth from config).
pub fn generators() -> GeneratorRegistry {
    let mut registry = Registry::new("generator");
    registry.register("resnet_9blocks", resnet(Some(9)));
    registry.register("resnet_6blocks", resnet(Some(6)));
    registry.register("resnet", resnet(None));
    registry.register("unet_128", unet(Some(7)));
    registry.register("unet_256", unet(Some(8)));
    registry.register("unet", unet(None));
    registry
}

fn conditioned_resnet(
    n_blocks: Option<usize>,
) -> impl Fn(&ConditionedGeneratorConfig, VarBuilder) -> Result<Box<dyn ConditionedModule>> {
    move |config, vb| {
        let mut config = config.clone();
        if let Some(n) = n_blocks {
            config.base.n_blocks = n;
        }
        Ok(Box::new(ConditionedResnetGenerator::new(config, vb)?) as Box<dyn ConditionedModule>)
    }
}

/// Conditioned generators: `resnet_9blocks`, `resnet_6blocks`, `resnet`.
pub fn conditioned_generators() -> ConditionedGeneratorRegistry {
    let mut registry = Registry::new("conditioned generator");
    registry.register("resnet_9blocks", conditioned_resnet(Some(9)));
    registry.register("resnet_6blocks", conditioned_resnet(Some(6)));
    registry.register("resnet", conditioned_resnet(None));
    registry
}

/// Discriminators: `basic` (3 layers), `n_layers`, `pixel`.
pub fn discriminators() -> DiscriminatorRegistry {
    let mut registry: DiscriminatorRegistry = Registry::new("discriminator");
    registry.register("basic", |config, vb| {
        let mut config = config.clone();
        config.n_layers = 3;
        Ok(Box::new(NLayerDiscriminator::new(config, vb)?) as Box<dyn ModuleT>)
    });
    registry.register("n_layers", |config, vb| {
        Ok(Box::new(NLayerDiscriminator::new(config.clone(), vb)?) as Box<dyn ModuleT>)
    });
    registry.register("pixel", |config, vb| {
        Ok(Box::new(PixelDiscriminator::new(config.clone(), vb)?) as Box<dyn ModuleT>)
    });
    registry
}
