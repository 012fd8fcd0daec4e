//! Reference MLP generator and projection discriminator
//!
//! These networks are deliberately small: a mapping MLP producing `num_ws`
//! style vectors with a tracked average, a synthesis MLP modulated by each
//! style in turn, and a discriminator with projection conditioning. Every
//! layer uses the equalized learning rate parameterization.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::VarMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::{check_dims, copy_named, Discriminator, Generator, Network};
use crate::error::{Error, Result};
use crate::training::config::NetworkConfig;
use crate::utils::math::{lrelu, normalize_2nd_moment};
use crate::utils::sample;

/// Learning rate multiplier of the mapping network
const MAPPING_LR_MULTIPLIER: f64 = 0.01;

/// Shapes of the reference generator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlpGeneratorConfig {
    /// Latent dimensionality
    pub z_dim: usize,
    /// Conditioning dimensionality
    pub c_dim: usize,
    /// Style dimensionality
    pub w_dim: usize,
    /// Number of style vectors
    pub num_ws: usize,
    /// Mapping depth
    pub mapping_layers: usize,
    /// Synthesis width
    pub hidden_dim: usize,
    /// Output channels
    pub img_channels: usize,
    /// Output resolution
    pub img_resolution: usize,
    /// Decay of the tracked average style
    pub w_avg_beta: f64,
    /// Initialization seed
    pub seed: u64,
}

/// Shapes of the reference discriminator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlpDiscriminatorConfig {
    /// Conditioning dimensionality
    pub c_dim: usize,
    /// Input channels
    pub img_channels: usize,
    /// Input resolution
    pub img_resolution: usize,
    /// Hidden width
    pub hidden_dim: usize,
    /// Hidden depth
    pub num_layers: usize,
    /// Initialization seed
    pub seed: u64,
}

impl MlpGeneratorConfig {
    /// Derive generator shapes from the network section and dataset geometry
    pub fn from_network(
        net: &NetworkConfig,
        c_dim: usize,
        img_channels: usize,
        img_resolution: usize,
        seed: u64,
    ) -> Self {
        Self {
            z_dim: net.z_dim,
            c_dim,
            w_dim: net.w_dim,
            num_ws: net.num_ws,
            mapping_layers: net.mapping_layers,
            hidden_dim: net.hidden_dim,
            img_channels,
            img_resolution,
            w_avg_beta: net.w_avg_beta,
            seed,
        }
    }
}

impl MlpDiscriminatorConfig {
    /// Derive discriminator shapes from the network section and dataset geometry
    pub fn from_network(
        net: &NetworkConfig,
        c_dim: usize,
        img_channels: usize,
        img_resolution: usize,
        seed: u64,
    ) -> Self {
        Self {
            c_dim,
            img_channels,
            img_resolution,
            hidden_dim: net.hidden_dim,
            num_layers: net.discriminator_layers,
            seed,
        }
    }
}

/// Named tensor registry backed by a `VarMap`
struct ParamRegistry {
    varmap: VarMap,
    rng: StdRng,
    device: Device,
}

impl ParamRegistry {
    fn new(seed: u64, device: &Device) -> Self {
        Self {
            varmap: VarMap::new(),
            rng: StdRng::seed_from_u64(seed),
            device: device.clone(),
        }
    }

    fn insert(&mut self, name: String, value: Tensor) -> Result<Tensor> {
        let var = Var::from_tensor(&value)?;
        let tensor = var.as_tensor().clone();
        self.varmap
            .data()
            .lock()
            .map_err(|_| Error::internal("parameter registry lock poisoned"))?
            .insert(name, var);
        Ok(tensor)
    }

    fn randn(&mut self, name: String, dims: &[usize], scale: f64) -> Result<Tensor> {
        let value = sample::randn(&mut self.rng, dims, &self.device)?.affine(scale, 0.0)?;
        self.insert(name, value)
    }

    fn constant(&mut self, name: String, dims: &[usize], value: f64) -> Result<Tensor> {
        let value = Tensor::zeros(dims, DType::F32, &self.device)?.affine(0.0, value)?;
        self.insert(name, value)
    }

    fn named(&self) -> Vec<(String, Var)> {
        let guard = match self.varmap.data().lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sorted(&guard)
    }
}

fn sorted(vars: &HashMap<String, Var>) -> Vec<(String, Var)> {
    let mut named: Vec<(String, Var)> = vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    named.sort_by(|a, b| a.0.cmp(&b.0));
    named
}

/// Fully connected layer with equalized learning rate
struct EqualizedLinear {
    weight: Tensor,
    bias: Tensor,
    weight_gain: f64,
    bias_gain: f64,
}

impl EqualizedLinear {
    fn new(
        params: &mut ParamRegistry,
        name: &str,
        in_features: usize,
        out_features: usize,
        lr_multiplier: f64,
        bias_init: f64,
    ) -> Result<Self> {
        let weight = params.randn(
            format!("{name}.weight"),
            &[out_features, in_features],
            1.0 / lr_multiplier,
        )?;
        let bias = params.constant(format!("{name}.bias"), &[out_features], bias_init / lr_multiplier)?;
        Ok(Self {
            weight,
            bias,
            weight_gain: lr_multiplier / (in_features as f64).sqrt(),
            bias_gain: lr_multiplier,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let w = self.weight.affine(self.weight_gain, 0.0)?;
        let b = self.bias.affine(self.bias_gain, 0.0)?;
        Ok(x.matmul(&w.t()?)?.broadcast_add(&b)?)
    }
}

/// Reference mapping + synthesis generator
pub struct MlpGenerator {
    config: MlpGeneratorConfig,
    params: ParamRegistry,
    buffers: ParamRegistry,
    embed: Option<EqualizedLinear>,
    mapping: Vec<EqualizedLinear>,
    w_avg: Var,
    input: EqualizedLinear,
    styles: Vec<EqualizedLinear>,
    blocks: Vec<EqualizedLinear>,
    to_img: EqualizedLinear,
    device: Device,
}

impl MlpGenerator {
    /// Build a generator with seeded initialization
    pub fn new(config: MlpGeneratorConfig, device: &Device) -> Result<Self> {
        if config.num_ws < 1 || config.mapping_layers < 1 {
            return Err(Error::config("Generator needs at least one style and one mapping layer"));
        }

        let mut params = ParamRegistry::new(config.seed, device);
        let mut buffers = ParamRegistry::new(config.seed, device);

        let embed = if config.c_dim > 0 {
            Some(EqualizedLinear::new(
                &mut params,
                "mapping.embed",
                config.c_dim,
                config.w_dim,
                1.0,
                0.0,
            )?)
        } else {
            None
        };

        let mut mapping = Vec::with_capacity(config.mapping_layers);
        let mut in_features = config.z_dim + if config.c_dim > 0 { config.w_dim } else { 0 };
        for i in 0..config.mapping_layers {
            mapping.push(EqualizedLinear::new(
                &mut params,
                &format!("mapping.fc{i}"),
                in_features,
                config.w_dim,
                MAPPING_LR_MULTIPLIER,
                0.0,
            )?);
            in_features = config.w_dim;
        }

        buffers.constant("mapping.w_avg".to_string(), &[config.w_dim], 0.0)?;
        let w_avg = buffers
            .named()
            .into_iter()
            .map(|(_, v)| v)
            .next()
            .ok_or_else(|| Error::internal("w_avg buffer missing"))?;

        let input = EqualizedLinear::new(
            &mut params,
            "synthesis.input",
            config.w_dim,
            config.hidden_dim,
            1.0,
            0.0,
        )?;

        let mut styles = Vec::with_capacity(config.num_ws.saturating_sub(1));
        let mut blocks = Vec::with_capacity(config.num_ws.saturating_sub(1));
        for i in 1..config.num_ws {
            styles.push(EqualizedLinear::new(
                &mut params,
                &format!("synthesis.b{i}.affine"),
                config.w_dim,
                config.hidden_dim,
                1.0,
                1.0,
            )?);
            blocks.push(EqualizedLinear::new(
                &mut params,
                &format!("synthesis.b{i}.fc"),
                config.hidden_dim,
                config.hidden_dim,
                1.0,
                0.0,
            )?);
        }

        let to_img = EqualizedLinear::new(
            &mut params,
            "synthesis.to_img",
            config.hidden_dim,
            config.img_channels * config.img_resolution * config.img_resolution,
            1.0,
            0.0,
        )?;

        Ok(Self {
            config,
            params,
            buffers,
            embed,
            mapping,
            w_avg,
            input,
            styles,
            blocks,
            to_img,
            device: device.clone(),
        })
    }

    /// Generator shapes
    pub fn config(&self) -> &MlpGeneratorConfig {
        &self.config
    }

    /// Current tracked average style
    pub fn w_avg(&self) -> &Tensor {
        self.w_avg.as_tensor()
    }
}

impl Network for MlpGenerator {
    fn named_parameters(&self) -> Vec<(String, Var)> {
        self.params.named()
    }

    fn named_buffers(&self) -> Vec<(String, Var)> {
        self.buffers.named()
    }
}

impl Generator for MlpGenerator {
    fn z_dim(&self) -> usize {
        self.config.z_dim
    }

    fn c_dim(&self) -> usize {
        self.config.c_dim
    }

    fn w_dim(&self) -> usize {
        self.config.w_dim
    }

    fn num_ws(&self) -> usize {
        self.config.num_ws
    }

    fn img_channels(&self) -> usize {
        self.config.img_channels
    }

    fn img_resolution(&self) -> usize {
        self.config.img_resolution
    }

    fn mapping(&self, z: &Tensor, c: &Tensor, skip_w_avg_update: bool) -> Result<Tensor> {
        let n = z.dim(0)?;
        check_dims("gen_z", z, &[n, self.config.z_dim])?;
        check_dims("gen_c", c, &[n, self.config.c_dim])?;

        let mut x = normalize_2nd_moment(z)?;
        if let Some(embed) = &self.embed {
            let y = normalize_2nd_moment(&embed.forward(c)?)?;
            x = Tensor::cat(&[&x, &y], 1)?;
        }
        for layer in &self.mapping {
            x = lrelu(&layer.forward(&x)?)?;
        }

        if !skip_w_avg_update {
            let beta = self.config.w_avg_beta;
            let batch_avg = x.detach().mean(0)?;
            let updated = self
                .w_avg
                .as_tensor()
                .affine(beta, 0.0)?
                .add(&batch_avg.affine(1.0 - beta, 0.0)?)?;
            self.w_avg.set(&updated)?;
        }

        Ok(x
            .unsqueeze(1)?
            .broadcast_as((n, self.config.num_ws, self.config.w_dim))?
            .contiguous()?)
    }

    fn synthesis(&self, ws: &Tensor) -> Result<Tensor> {
        let n = ws.dim(0)?;
        check_dims("ws", ws, &[n, self.config.num_ws, self.config.w_dim])?;

        let w0 = ws.narrow(1, 0, 1)?.squeeze(1)?;
        let mut h = lrelu(&self.input.forward(&w0)?)?;
        for (i, (style, block)) in self.styles.iter().zip(&self.blocks).enumerate() {
            let w = ws.narrow(1, i + 1, 1)?.squeeze(1)?;
            let s = style.forward(&w)?;
            h = lrelu(&block.forward(&h.mul(&s)?)?)?;
        }

        let res = self.config.img_resolution;
        Ok(self
            .to_img
            .forward(&h)?
            .reshape((n, self.config.img_channels, res, res))?)
    }

    fn deep_copy(&self) -> Result<Box<dyn Generator>> {
        let copy = MlpGenerator::new(self.config.clone(), &self.device)?;
        copy_named(&self.named_parameters(), &copy.named_parameters(), true)?;
        copy_named(&self.named_buffers(), &copy.named_buffers(), true)?;
        Ok(Box::new(copy))
    }
}

/// Reference discriminator with projection conditioning
pub struct MlpDiscriminator {
    config: MlpDiscriminatorConfig,
    params: ParamRegistry,
    layers: Vec<EqualizedLinear>,
    out: EqualizedLinear,
    cmap: Option<EqualizedLinear>,
}

impl MlpDiscriminator {
    /// Build a discriminator with seeded initialization
    pub fn new(config: MlpDiscriminatorConfig, device: &Device) -> Result<Self> {
        let mut params = ParamRegistry::new(config.seed, device);

        let mut layers = Vec::with_capacity(config.num_layers);
        let mut in_features = config.img_channels * config.img_resolution * config.img_resolution;
        for i in 0..config.num_layers {
            layers.push(EqualizedLinear::new(
                &mut params,
                &format!("b{i}.fc"),
                in_features,
                config.hidden_dim,
                1.0,
                0.0,
            )?);
            in_features = config.hidden_dim;
        }

        let (out, cmap) = if config.c_dim > 0 {
            let out = EqualizedLinear::new(&mut params, "out", in_features, config.hidden_dim, 1.0, 0.0)?;
            let cmap = EqualizedLinear::new(&mut params, "cmap", config.c_dim, config.hidden_dim, 1.0, 0.0)?;
            (out, Some(cmap))
        } else {
            (EqualizedLinear::new(&mut params, "out", in_features, 1, 1.0, 0.0)?, None)
        };

        Ok(Self {
            config,
            params,
            layers,
            out,
            cmap,
        })
    }

    /// Discriminator shapes
    pub fn config(&self) -> &MlpDiscriminatorConfig {
        &self.config
    }
}

impl Network for MlpDiscriminator {
    fn named_parameters(&self) -> Vec<(String, Var)> {
        self.params.named()
    }
}

impl Discriminator for MlpDiscriminator {
    fn c_dim(&self) -> usize {
        self.config.c_dim
    }

    fn img_channels(&self) -> usize {
        self.config.img_channels
    }

    fn img_resolution(&self) -> usize {
        self.config.img_resolution
    }

    fn forward(&self, img: &Tensor, c: &Tensor) -> Result<Tensor> {
        let n = img.dim(0)?;
        let res = self.config.img_resolution;
        check_dims("img", img, &[n, self.config.img_channels, res, res])?;
        check_dims("c", c, &[n, self.config.c_dim])?;

        let mut x = img.flatten_from(1)?;
        for layer in &self.layers {
            x = lrelu(&layer.forward(&x)?)?;
        }

        let out = self.out.forward(&x)?;
        match &self.cmap {
            Some(cmap) => {
                let projection = cmap.forward(c)?;
                let scale = 1.0 / (self.config.hidden_dim as f64).sqrt();
                Ok(out.mul(&projection)?.sum(1)?.affine(scale, 0.0)?)
            }
            None => Ok(out.squeeze(1)?),
        }
    }
}
