use super::{ModelError, Result};
use crate::nn::{AvgPool2d, ConvSpec, MaxPool2d};
use serde::{Deserialize, Serialize};

/// Stem: one convolution, ReLU, then max pooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StemConfig {
    pub conv: ConvSpec,
    pub pool_kernel: usize,
    pub pool_stride: usize,
}

/// One stage of bottleneck blocks. Only the first block uses `stride`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    pub blocks: usize,
    /// Output channels of every block in the stage.
    pub depth: usize,
    /// Channels of the 1x1 reduce and 3x3 convolutions.
    pub bottleneck: usize,
    pub stride: usize,
}

impl StageConfig {
    pub const fn new(blocks: usize, depth: usize, bottleneck: usize, stride: usize) -> Self {
        Self {
            blocks,
            depth,
            bottleneck,
            stride,
        }
    }
}

/// Which convolution of the main path carries a block's stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StridePlacement {
    /// On the 3x3 convolution.
    #[default]
    Spatial,
    /// On the leading 1x1 reduce convolution.
    Reduce,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub stem: StemConfig,
    pub stages: Vec<StageConfig>,
    pub stride_placement: StridePlacement,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::resnet50()
    }
}

impl ModelConfig {
    /// ResNet-50 v1: 7x7/2 stem, 3/2 max pool, `[3, 4, 6, 3]` bottleneck blocks.
    pub fn resnet50() -> Self {
        Self {
            stem: StemConfig {
                conv: ConvSpec::new(64, 7, 2, 3),
                pool_kernel: 3,
                pool_stride: 2,
            },
            stages: vec![
                StageConfig::new(3, 256, 64, 1),
                StageConfig::new(4, 512, 128, 2),
                StageConfig::new(6, 1024, 256, 2),
                StageConfig::new(3, 2048, 512, 2),
            ],
            stride_placement: StridePlacement::Spatial,
        }
    }

    /// A two-stage network with the same block structure, for smoke runs on small images.
    pub fn tiny() -> Self {
        Self {
            stem: StemConfig {
                conv: ConvSpec::new(8, 3, 1, 1),
                pool_kernel: 2,
                pool_stride: 2,
            },
            stages: vec![StageConfig::new(2, 16, 4, 1), StageConfig::new(1, 32, 8, 2)],
            stride_placement: StridePlacement::Spatial,
        }
    }

    /// Resolves every layer shape for `[channels, height, width]` inputs.
    pub fn plan(&self, input: [usize; 3], classes: usize) -> Result<ShapePlan> {
        let [channels, h, w] = input;
        if channels == 0 || h == 0 || w == 0 {
            return Err(ModelError::InvalidConfig(format!(
                "input shape {input:?} has an empty dimension"
            )));
        }
        if classes == 0 {
            return Err(ModelError::InvalidConfig("class count must be positive".into()));
        }
        if self.stages.is_empty() {
            return Err(ModelError::InvalidConfig("at least one stage is required".into()));
        }
        if self.stem.conv.out_channels == 0 {
            return Err(ModelError::InvalidConfig("stem needs output channels".into()));
        }
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.blocks == 0 || stage.depth == 0 || stage.bottleneck == 0 || stage.stride == 0
            {
                return Err(ModelError::InvalidConfig(format!(
                    "stage {} has a zero field: {stage:?}",
                    i + 1
                )));
            }
        }

        let stem_hw = conv_hw(&self.stem.conv, [h, w], "stem")?;
        let stem_pool = MaxPool2d::new(self.stem.pool_kernel, self.stem.pool_stride);
        let pooled_hw = pool_hw(|s| stem_pool.output_size(s), stem_hw, "stem pool")?;

        let mut blocks = Vec::new();
        let mut in_channels = self.stem.conv.out_channels;
        let mut hw = pooled_hw;
        for (s, stage) in self.stages.iter().enumerate() {
            for b in 0..stage.blocks {
                let stride = if b == 0 { stage.stride } else { 1 };
                let block = BlockPlan::new(
                    format!("stage{}/block{b}", s + 1),
                    in_channels,
                    stage,
                    stride,
                    hw,
                    self.stride_placement,
                )?;
                hw = block.output_hw;
                in_channels = block.depth;
                blocks.push(block);
            }
        }

        let head_pool = AvgPool2d::new(hw[0], 1);
        let head_hw = pool_hw(|s| head_pool.output_size(s), hw, "head pool")?;

        Ok(ShapePlan {
            input,
            classes,
            stem_hw,
            pooled_hw,
            blocks,
            final_hw: hw,
            head_hw,
            features: in_channels * head_hw[0] * head_hw[1],
        })
    }
}

fn conv_hw(spec: &ConvSpec, [h, w]: [usize; 2], layer: &str) -> Result<[usize; 2]> {
    match (spec.output_size(h), spec.output_size(w)) {
        (Some(oh), Some(ow)) => Ok([oh, ow]),
        _ => Err(ModelError::WindowTooLarge {
            layer: layer.to_string(),
            h,
            w,
        }),
    }
}

fn pool_hw(
    output_size: impl Fn(usize) -> Option<usize>,
    [h, w]: [usize; 2],
    layer: &str,
) -> Result<[usize; 2]> {
    match (output_size(h), output_size(w)) {
        (Some(oh), Some(ow)) => Ok([oh, ow]),
        _ => Err(ModelError::WindowTooLarge {
            layer: layer.to_string(),
            h,
            w,
        }),
    }
}

/// How a bottleneck block forms its shortcut operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortcutKind {
    /// Same channels, stride 1: the input itself.
    Identity,
    /// Same channels, stride > 1: 1x1 max pool with the block's stride.
    StridedPool,
    /// Channel change: strided 1x1 convolution followed by ReLU.
    Projection,
}

/// Resolved shapes of one bottleneck block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPlan {
    /// Scope-relative name, e.g. `stage2/block0`.
    pub name: String,
    pub in_channels: usize,
    pub depth: usize,
    pub bottleneck: usize,
    pub stride: usize,
    pub placement: StridePlacement,
    pub input_hw: [usize; 2],
    pub output_hw: [usize; 2],
    pub shortcut: ShortcutKind,
}

impl BlockPlan {
    fn new(
        name: String,
        in_channels: usize,
        stage: &StageConfig,
        stride: usize,
        input_hw: [usize; 2],
        placement: StridePlacement,
    ) -> Result<Self> {
        let shortcut = if in_channels == stage.depth && stride == 1 {
            ShortcutKind::Identity
        } else if in_channels == stage.depth {
            ShortcutKind::StridedPool
        } else {
            ShortcutKind::Projection
        };
        let mut plan = Self {
            name,
            in_channels,
            depth: stage.depth,
            bottleneck: stage.bottleneck,
            stride,
            placement,
            input_hw,
            output_hw: input_hw,
            shortcut,
        };

        let reduced = conv_hw(&plan.reduce_spec(), input_hw, &plan.name)?;
        let spatial = conv_hw(&plan.spatial_spec(), reduced, &plan.name)?;
        let shortcut_hw = match shortcut {
            ShortcutKind::Identity => input_hw,
            ShortcutKind::StridedPool => {
                let pool = plan.shortcut_pool();
                pool_hw(|s| pool.output_size(s), input_hw, &plan.name)?
            }
            ShortcutKind::Projection => conv_hw(&plan.projection_spec(), input_hw, &plan.name)?,
        };
        if spatial != shortcut_hw {
            return Err(ModelError::InvalidConfig(format!(
                "{}: main path {spatial:?} and shortcut {shortcut_hw:?} differ",
                plan.name
            )));
        }
        plan.output_hw = spatial;
        Ok(plan)
    }

    pub fn reduce_spec(&self) -> ConvSpec {
        match self.placement {
            StridePlacement::Spatial => ConvSpec::new(self.bottleneck, 1, 1, 0),
            StridePlacement::Reduce => ConvSpec::new(self.bottleneck, 1, self.stride, 0),
        }
    }

    pub fn spatial_spec(&self) -> ConvSpec {
        match self.placement {
            StridePlacement::Spatial => ConvSpec::new(self.bottleneck, 3, self.stride, 1),
            StridePlacement::Reduce => ConvSpec::new(self.bottleneck, 3, 1, 1),
        }
    }

    pub fn expand_spec(&self) -> ConvSpec {
        ConvSpec::new(self.depth, 1, 1, 0)
    }

    pub fn projection_spec(&self) -> ConvSpec {
        ConvSpec::new(self.depth, 1, self.stride, 0)
    }

    pub fn shortcut_pool(&self) -> MaxPool2d {
        MaxPool2d::new(1, self.stride)
    }
}

/// Every layer shape of a configured network, per image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapePlan {
    /// `[channels, height, width]` of one input image.
    pub input: [usize; 3],
    pub classes: usize,
    pub stem_hw: [usize; 2],
    pub pooled_hw: [usize; 2],
    pub blocks: Vec<BlockPlan>,
    /// Spatial size entering the head pool.
    pub final_hw: [usize; 2],
    pub head_hw: [usize; 2],
    /// Width of the flattened features feeding the classifier.
    pub features: usize,
}

impl ShapePlan {
    pub fn final_channels(&self) -> usize {
        self.blocks.last().map_or(0, |b| b.depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resnet50_plan() {
        let plan = ModelConfig::resnet50().plan([3, 224, 224], 2).unwrap();
        assert_eq!(plan.stem_hw, [112, 112]);
        assert_eq!(plan.pooled_hw, [55, 55]);
        assert_eq!(plan.blocks.len(), 16);
        assert_eq!(plan.final_hw, [7, 7]);
        assert_eq!(plan.head_hw, [1, 1]);
        assert_eq!(plan.features, 2048);
        assert_eq!(plan.final_channels(), 2048);

        let strides: Vec<usize> = plan.blocks.iter().map(|b| b.stride).collect();
        assert_eq!(strides, vec![1, 1, 1, 2, 1, 1, 1, 2, 1, 1, 1, 1, 1, 2, 1, 1]);

        // Stage openers change width and project; the rest are identity.
        let projections: Vec<usize> = plan
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.shortcut == ShortcutKind::Projection)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(projections, vec![0, 3, 7, 13]);
        assert_eq!(plan.blocks[4].name, "stage2/block1");
    }

    #[test]
    fn test_stride_placement_gives_same_sizes() {
        let spatial = ModelConfig::resnet50().plan([3, 224, 224], 2).unwrap();
        let mut config = ModelConfig::resnet50();
        config.stride_placement = StridePlacement::Reduce;
        let reduce = config.plan([3, 224, 224], 2).unwrap();
        for (a, b) in spatial.blocks.iter().zip(&reduce.blocks) {
            assert_eq!(a.output_hw, b.output_hw);
        }
    }

    #[test]
    fn test_strided_pool_shortcut_when_width_kept() {
        let mut config = ModelConfig::tiny();
        config.stages = vec![StageConfig::new(1, 8, 4, 2)];
        let plan = config.plan([3, 16, 16], 2).unwrap();
        assert_eq!(plan.blocks[0].shortcut, ShortcutKind::StridedPool);
        assert_eq!(plan.blocks[0].output_hw, [4, 4]);
    }

    #[test]
    fn test_window_too_large_fails_at_plan_time() {
        let err = ModelConfig::resnet50().plan([3, 2, 2], 2).unwrap_err();
        assert!(matches!(err, ModelError::WindowTooLarge { .. }), "{err}");

        let mut config = ModelConfig::tiny();
        config.stages[0].blocks = 0;
        assert!(matches!(
            config.plan([3, 16, 16], 2),
            Err(ModelError::InvalidConfig(_))
        ));
        assert!(ModelConfig::tiny().plan([3, 16, 16], 0).is_err());
    }

    #[test]
    fn test_non_square_head_pool() {
        let plan = ModelConfig::tiny().plan([3, 16, 24], 3).unwrap();
        assert_eq!(plan.final_hw, [4, 6]);
        assert_eq!(plan.head_hw, [1, 3]);
        assert_eq!(plan.features, 32 * 3);
    }

    #[test]
    fn test_config_toml_roundtrip_defaults() {
        let config: ModelConfig = toml::from_str("stride_placement = \"reduce\"").unwrap();
        assert_eq!(config.stride_placement, StridePlacement::Reduce);
        assert_eq!(config.stages, ModelConfig::resnet50().stages);
    }
}
