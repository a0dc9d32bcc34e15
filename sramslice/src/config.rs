//! Scheduler configuration.
//!
//! A [SchedulerConfig] is built once, usually from command-line flags or a set of
//! `NAME=value` pairs, and then passed by reference through every phase.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::str::FromStr;
use strum::{EnumIter, IntoEnumIterator};

pub const SRAM_SLICER_MAX_CAPACITY_BYTES: &str = "SRAM_SLICER_MAX_CAPACITY_BYTES";
pub const ENABLE_PIPELINE_MANAGEMENT: &str = "ENABLE_PIPELINE_MANAGEMENT";
pub const ENABLE_LAYERED_PIPELINE_BRAIN: &str = "ENABLE_LAYERED_PIPELINE_BRAIN";
pub const PIPELINE_MANAGEMENT_FORCE_BUNDLIZER: &str = "PIPELINE_MANAGEMENT_FORCE_BUNDLIZER";
pub const SRAM_SLICER_BUNDLE_EXPANSION_ENABLED: &str = "SRAM_SLICER_BUNDLE_EXPANSION_ENABLED";
pub const SRAM_SLICER_COST_MODEL_ENABLED: &str = "SRAM_SLICER_COST_MODEL_ENABLED";
pub const ENABLE_SRAM_MULTI_BUFFERING: &str = "ENABLE_SRAM_MULTI_BUFFERING";
pub const ENABLE_CONV_PACKING_TRAINING: &str = "ENABLE_CONV_PACKING_TRAINING";
pub const ENABLE_TPC_BUNDLES: &str = "ENABLE_TPC_BUNDLES";
pub const MIN_SCALAR_PIPE_INPUT_BYTES_FOR_SRAM_PLACEMENT: &str =
    "MIN_SCALAR_PIPE_INPUT_BYTES_FOR_SRAM_PLACEMENT";
pub const ENABLE_BGEMM_FLATTEN_TO_GEMM_FOR_SLICING: &str =
    "ENABLE_BGEMM_FLATTEN_TO_GEMM_FOR_SLICING";
pub const ENABLE_GRAD_A_RESHAPED_GRAD_B_PAIRING: &str = "ENABLE_GRAD_A_RESHAPED_GRAD_B_PAIRING";
pub const ENABLE_SLICING_BOTH_PRODUCER_CHAINS: &str = "ENABLE_SLICING_BOTH_PRODUCER_CHAINS";

/// Every flag name [SchedulerConfig::apply_var] recognizes.
pub const RECOGNIZED_VARS: [&str; 13] = [
    SRAM_SLICER_MAX_CAPACITY_BYTES,
    ENABLE_PIPELINE_MANAGEMENT,
    ENABLE_LAYERED_PIPELINE_BRAIN,
    PIPELINE_MANAGEMENT_FORCE_BUNDLIZER,
    SRAM_SLICER_BUNDLE_EXPANSION_ENABLED,
    SRAM_SLICER_COST_MODEL_ENABLED,
    ENABLE_SRAM_MULTI_BUFFERING,
    ENABLE_CONV_PACKING_TRAINING,
    ENABLE_TPC_BUNDLES,
    MIN_SCALAR_PIPE_INPUT_BYTES_FOR_SRAM_PLACEMENT,
    ENABLE_BGEMM_FLATTEN_TO_GEMM_FOR_SLICING,
    ENABLE_GRAD_A_RESHAPED_GRAD_B_PAIRING,
    ENABLE_SLICING_BOTH_PRODUCER_CHAINS,
];

/// Which bundling policy the [crate::bundlizer::Bundlizer] follows.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, EnumIter)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum BundlizerPolicy {
    /// Vision for graphs containing convolution-family nodes, otherwise Standard.
    #[default]
    Auto,
    Standard,
    Vision,
    MmeOnly,
    TpcProducerChains,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub struct SchedulerConfig {
    /// Upper bound on SRAM bytes. Zero disables SRAM residency entirely.
    pub sram_capacity_bytes: u64,
    pub pipeline_management: bool,
    pub layered_brain: bool,
    pub force_bundlizer: BundlizerPolicy,
    pub bundle_expansion: bool,
    pub cost_model: bool,
    pub multi_buffering: bool,
    pub conv_packing_training: bool,
    pub tpc_bundles: bool,
    pub min_scalar_pipe_input_bytes: u64,
    pub bgemm_flatten_to_gemm: bool,
    pub grad_pairing: bool,
    pub slice_both_producer_chains: bool,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unrecognized configuration variable {0}")]
    Unrecognized(String),
    #[error("invalid value {value:?} for {name}")]
    InvalidValue { name: String, value: String },
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            sram_capacity_bytes: u64::MAX,
            pipeline_management: true,
            layered_brain: false,
            force_bundlizer: BundlizerPolicy::Auto,
            bundle_expansion: true,
            cost_model: true,
            multi_buffering: true,
            conv_packing_training: false,
            tpc_bundles: false,
            min_scalar_pipe_input_bytes: 1 << 20,
            bgemm_flatten_to_gemm: false,
            grad_pairing: false,
            slice_both_producer_chains: false,
        }
    }
}

impl SchedulerConfig {
    /// The configuration every other configuration must agree with numerically:
    /// nothing placed in SRAM and no pipeline management.
    pub fn unsliced() -> Self {
        SchedulerConfig {
            sram_capacity_bytes: 0,
            pipeline_management: false,
            ..SchedulerConfig::default()
        }
    }

    /// Build a config from defaults and a sequence of `(NAME, value)` pairs.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = SchedulerConfig::default();
        for (name, value) in vars {
            config.apply_var(name.as_ref(), value.as_ref())?;
        }
        Ok(config)
    }

    /// Like [SchedulerConfig::from_vars], but silently skips names which aren't
    /// scheduler flags. Suitable for a process environment.
    pub fn from_env_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        SchedulerConfig::from_vars(
            vars.into_iter()
                .filter(|(name, _)| RECOGNIZED_VARS.contains(&name.as_str())),
        )
    }

    pub fn apply_var(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        match name {
            SRAM_SLICER_MAX_CAPACITY_BYTES => {
                self.sram_capacity_bytes = parse_int(name, value)?;
            }
            ENABLE_PIPELINE_MANAGEMENT => self.pipeline_management = parse_bool(name, value)?,
            ENABLE_LAYERED_PIPELINE_BRAIN => self.layered_brain = parse_bool(name, value)?,
            PIPELINE_MANAGEMENT_FORCE_BUNDLIZER => {
                self.force_bundlizer =
                    value
                        .parse()
                        .map_err(|_| ConfigError::InvalidValue {
                            name: name.to_string(),
                            value: value.to_string(),
                        })?;
            }
            SRAM_SLICER_BUNDLE_EXPANSION_ENABLED => {
                self.bundle_expansion = parse_bool(name, value)?
            }
            SRAM_SLICER_COST_MODEL_ENABLED => self.cost_model = parse_bool(name, value)?,
            ENABLE_SRAM_MULTI_BUFFERING => self.multi_buffering = parse_bool(name, value)?,
            ENABLE_CONV_PACKING_TRAINING => self.conv_packing_training = parse_bool(name, value)?,
            ENABLE_TPC_BUNDLES => self.tpc_bundles = parse_bool(name, value)?,
            MIN_SCALAR_PIPE_INPUT_BYTES_FOR_SRAM_PLACEMENT => {
                self.min_scalar_pipe_input_bytes = parse_int(name, value)?;
            }
            ENABLE_BGEMM_FLATTEN_TO_GEMM_FOR_SLICING => {
                self.bgemm_flatten_to_gemm = parse_bool(name, value)?
            }
            ENABLE_GRAD_A_RESHAPED_GRAD_B_PAIRING => self.grad_pairing = parse_bool(name, value)?,
            ENABLE_SLICING_BOTH_PRODUCER_CHAINS => {
                self.slice_both_producer_chains = parse_bool(name, value)?
            }
            _ => return Err(ConfigError::Unrecognized(name.to_string())),
        }
        Ok(())
    }

    /// Returns `true` if this configuration may place anything in SRAM.
    pub fn sram_enabled(&self) -> bool {
        self.sram_capacity_bytes != 0
    }

    /// The capacity actually available given a device with `device_bytes` of SRAM.
    pub fn effective_capacity(&self, device_bytes: u64) -> u64 {
        self.sram_capacity_bytes.min(device_bytes)
    }
}

impl Display for SchedulerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{SRAM_SLICER_MAX_CAPACITY_BYTES}={} {ENABLE_PIPELINE_MANAGEMENT}={} \
             {ENABLE_LAYERED_PIPELINE_BRAIN}={} {PIPELINE_MANAGEMENT_FORCE_BUNDLIZER}={} \
             {SRAM_SLICER_BUNDLE_EXPANSION_ENABLED}={} {SRAM_SLICER_COST_MODEL_ENABLED}={} \
             {ENABLE_SRAM_MULTI_BUFFERING}={} {ENABLE_CONV_PACKING_TRAINING}={} \
             {ENABLE_TPC_BUNDLES}={} {MIN_SCALAR_PIPE_INPUT_BYTES_FOR_SRAM_PLACEMENT}={} \
             {ENABLE_BGEMM_FLATTEN_TO_GEMM_FOR_SLICING}={} \
             {ENABLE_GRAD_A_RESHAPED_GRAD_B_PAIRING}={} \
             {ENABLE_SLICING_BOTH_PRODUCER_CHAINS}={}",
            self.sram_capacity_bytes,
            self.pipeline_management,
            self.layered_brain,
            self.force_bundlizer,
            self.bundle_expansion,
            self.cost_model,
            self.multi_buffering,
            self.conv_packing_training,
            self.tpc_bundles,
            self.min_scalar_pipe_input_bytes,
            self.bgemm_flatten_to_gemm,
            self.grad_pairing,
            self.slice_both_producer_chains,
        )
    }
}

impl BundlizerPolicy {
    fn flag_name(&self) -> &'static str {
        match self {
            BundlizerPolicy::Auto => "auto",
            BundlizerPolicy::Standard => "standard",
            BundlizerPolicy::Vision => "vision",
            BundlizerPolicy::MmeOnly => "mme-only",
            BundlizerPolicy::TpcProducerChains => "tpc-producer-chains",
        }
    }
}

impl Display for BundlizerPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.flag_name())
    }
}

impl FromStr for BundlizerPolicy {
    type Err = ();

    /// Accepts the kebab-case name or the numeric position of the policy.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase().replace('_', "-");
        if let Ok(idx) = lowered.parse::<usize>() {
            return BundlizerPolicy::iter().nth(idx).ok_or(());
        }
        BundlizerPolicy::iter()
            .find(|p| p.flag_name() == lowered)
            .ok_or(())
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_int(name: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_from_vars_sets_named_flags() {
        let config = SchedulerConfig::from_vars([
            (SRAM_SLICER_MAX_CAPACITY_BYTES, "0"),
            (SRAM_SLICER_COST_MODEL_ENABLED, "false"),
            (PIPELINE_MANAGEMENT_FORCE_BUNDLIZER, "tpc_producer_chains"),
        ])
        .unwrap();
        assert_eq!(config.sram_capacity_bytes, 0);
        assert!(!config.sram_enabled());
        assert!(!config.cost_model);
        assert_eq!(config.force_bundlizer, BundlizerPolicy::TpcProducerChains);
    }

    #[test]
    fn test_unrecognized_name_is_rejected() {
        assert_eq!(
            SchedulerConfig::from_vars([("ENABLE_NOTHING", "1")]),
            Err(ConfigError::Unrecognized("ENABLE_NOTHING".to_string()))
        );
    }

    #[test]
    fn test_env_vars_skip_unrelated_names() {
        let config = SchedulerConfig::from_env_vars([
            ("HOME".to_string(), "/root".to_string()),
            (ENABLE_TPC_BUNDLES.to_string(), "1".to_string()),
        ])
        .unwrap();
        assert!(config.tpc_bundles);
    }

    #[test]
    fn test_bad_bool_is_rejected() {
        assert!(matches!(
            SchedulerConfig::from_vars([(ENABLE_SRAM_MULTI_BUFFERING, "maybe")]),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_numeric_policy_index() {
        assert_eq!("3".parse(), Ok(BundlizerPolicy::MmeOnly));
        assert_eq!("17".parse::<BundlizerPolicy>(), Err(()));
    }

    proptest! {
        #[test]
        fn test_display_round_trips_through_from_vars(config in any::<SchedulerConfig>()) {
            let rendered = config.to_string();
            let pairs = rendered
                .split_whitespace()
                .map(|kv| {
                    let (k, v) = kv.split_once('=').unwrap();
                    (k.to_string(), v.to_string())
                })
                .collect::<Vec<_>>();
            prop_assert_eq!(SchedulerConfig::from_vars(pairs).unwrap(), config);
        }
    }
}
