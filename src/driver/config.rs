use std::{path::Path, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid optimizer config: {0}")]
    Toml(#[from] toml::de::Error),
}

/// How hard the optimizer works.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptLevel {
    None,
    Less,
    #[default]
    Default,
    Aggressive,
}

/// The named knobs the optimizer pipeline consults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSettings {
    /// Inline nested blocks and statically resolved continuations.
    pub flatten_nested: bool,
    pub constant_fold: bool,
    pub dead_code_elim: bool,
    pub loop_unroll: bool,
    /// Upper bound on any requested unroll factor.
    pub max_unroll: u32,
    pub loop_fusion: bool,
    /// Value numbering and wait elimination.
    pub forward_dataflow: bool,
    /// Rewrite blocking instructions into immediate ones where inputs are known closed.
    pub make_immediate: bool,
    pub promote_constants: bool,
    /// Iterations of the whole pipeline.
    pub opt_passes: u32,
    /// Propagation rounds inside each constant folding pass.
    pub fold_rounds: u32,
    /// Dump the IR after every pass at debug level.
    pub log_ir: bool,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self::for_level(OptLevel::Default)
    }
}

impl OptimizerSettings {
    pub fn for_level(level: OptLevel) -> Self {
        let everything = Self {
            flatten_nested: true,
            constant_fold: true,
            dead_code_elim: true,
            loop_unroll: true,
            max_unroll: 16,
            loop_fusion: true,
            forward_dataflow: true,
            make_immediate: true,
            promote_constants: true,
            opt_passes: 3,
            fold_rounds: 3,
            log_ir: false,
        };
        match level {
            OptLevel::None => Self {
                flatten_nested: false,
                constant_fold: false,
                dead_code_elim: false,
                loop_unroll: false,
                loop_fusion: false,
                forward_dataflow: false,
                make_immediate: false,
                promote_constants: false,
                opt_passes: 1,
                fold_rounds: 0,
                ..everything
            },
            OptLevel::Less => Self {
                loop_unroll: false,
                loop_fusion: false,
                forward_dataflow: false,
                make_immediate: false,
                promote_constants: false,
                opt_passes: 1,
                fold_rounds: 1,
                ..everything
            },
            OptLevel::Default => Self {
                loop_unroll: false,
                ..everything
            },
            OptLevel::Aggressive => everything,
        }
    }
}

/// Knobs set explicitly in the `[optimizer]` table. Unset ones keep the level's preset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flatten_nested: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constant_fold: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_code_elim: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_unroll: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_unroll: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_fusion: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_dataflow: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub make_immediate: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promote_constants: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opt_passes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fold_rounds: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_ir: Option<bool>,
}

impl OptimizerOverrides {
    pub fn apply(&self, settings: &mut OptimizerSettings) {
        macro_rules! overlay {
            ($($knob:ident),* $(,)?) => {
                $(if let Some(value) = self.$knob {
                    settings.$knob = value;
                })*
            };
        }
        overlay!(
            flatten_nested,
            constant_fold,
            dead_code_elim,
            loop_unroll,
            max_unroll,
            loop_fusion,
            forward_dataflow,
            make_immediate,
            promote_constants,
            opt_passes,
            fold_rounds,
            log_ir,
        );
    }
}

/// An optimizer config file.
///
/// ```toml
/// opt_level = "aggressive"
///
/// [optimizer]
/// max_unroll = 4
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub opt_level: OptLevel,
    #[serde(default)]
    pub optimizer: OptimizerOverrides,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        text.parse()
    }

    /// The level's preset with the `[optimizer]` table laid over it.
    pub fn settings(&self) -> OptimizerSettings {
        let mut settings = OptimizerSettings::for_level(self.opt_level);
        self.optimizer.apply(&mut settings);
        settings
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(toml::from_str(s)?)
    }
}
