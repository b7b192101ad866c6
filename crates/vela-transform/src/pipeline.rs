//! Pipeline driver and its configuration

use crate::{flatten, kernel, lifetime, materialize, targets};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, info_span};
use vela_ir::{verify, Module, Result, Target, VerifyLevel};

/// One pass of the pipeline, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    SeparateTargets,
    Lifetime,
    Flatten,
    ExtractKernels,
    Partition,
    Materialize,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::SeparateTargets,
        Stage::Lifetime,
        Stage::Flatten,
        Stage::ExtractKernels,
        Stage::Partition,
        Stage::Materialize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::SeparateTargets => "separate_targets",
            Stage::Lifetime => "lifetime",
            Stage::Flatten => "flatten",
            Stage::ExtractKernels => "extract_kernels",
            Stage::Partition => "partition",
            Stage::Materialize => "materialize",
        }
    }

    /// Strongest check the module passes once this stage has run
    pub fn verify_level(&self) -> VerifyLevel {
        match self {
            Stage::Partition => VerifyLevel::Flat,
            Stage::Materialize => VerifyLevel::Lowered,
            _ => VerifyLevel::Structure,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage `{}`", s))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid pipeline config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Pipeline settings, read from a JSON file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Check the lowering output before the first stage
    pub verify_input: bool,
    /// Check the final module
    pub verify_output: bool,
    /// Sub-module extracted kernels go to
    pub kernel_target: Target,
    /// Stages after which the module is dumped at debug level
    pub dump_after: Vec<Stage>,
    /// Last stage to run
    pub stop_after: Option<Stage>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            verify_input: true,
            verify_output: true,
            kernel_target: Target::Nvptx,
            dump_after: Vec::new(),
            stop_after: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_json(json: &str) -> std::result::Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> std::result::Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }
}

/// What a pipeline run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub stages: Vec<Stage>,
    pub moved_to_targets: usize,
    pub kernels: Vec<String>,
}

pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs every stage in order, up to `stop_after`
    pub fn run(&self, module: &mut Module) -> Result<PipelineReport> {
        let _span = info_span!("pipeline", module = %module.name).entered();
        if self.config.verify_input {
            verify::module(module, VerifyLevel::Structure)?;
        }

        let mut report = PipelineReport::default();
        for stage in Stage::ALL {
            self.run_stage(module, stage, &mut report)?;
            report.stages.push(stage);
            if self.config.dump_after.contains(&stage) {
                debug!(%stage, "module after stage:\n{}", module);
            }
            if self.config.stop_after == Some(stage) {
                break;
            }
        }

        if self.config.verify_output {
            let level = report
                .stages
                .last()
                .map(|stage| stage.verify_level())
                .unwrap_or(VerifyLevel::Structure);
            verify::module(module, level)?;
        }
        info!(
            stages = report.stages.len(),
            kernels = report.kernels.len(),
            "pipeline finished"
        );
        Ok(report)
    }

    pub fn run_stage(
        &self,
        module: &mut Module,
        stage: Stage,
        report: &mut PipelineReport,
    ) -> Result<()> {
        let _span = info_span!("stage", %stage).entered();
        match stage {
            Stage::SeparateTargets => {
                report.moved_to_targets = targets::separate_targets(module)?;
            }
            Stage::Lifetime => lifetime::insert_lifetime_calls(module)?,
            Stage::Flatten => flatten::flatten_module(module)?,
            Stage::ExtractKernels => {
                let kernels = kernel::extract_kernels(module, self.config.kernel_target)?;
                report
                    .kernels
                    .extend(kernels.into_iter().map(|k| module.name(k).to_string()));
            }
            Stage::Partition => flatten::partition_module(module)?,
            Stage::Materialize => materialize::materialize_module(module)?,
        }
        info!("stage complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vela_ir::IrBuilder;

    #[test]
    fn test_stage_names_round_trip() {
        for stage in Stage::ALL {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
        assert!("codegen".parse::<Stage>().is_err());
    }

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let config = PipelineConfig::from_json(r#"{ "kernel_target": "amdgpu" }"#).unwrap();
        assert_eq!(config.kernel_target, Target::Amdgpu);
        assert!(config.verify_input);
        assert!(config.dump_after.is_empty());

        let config =
            PipelineConfig::from_json(r#"{ "stop_after": "flatten", "dump_after": ["lifetime"] }"#)
                .unwrap();
        assert_eq!(config.stop_after, Some(Stage::Flatten));
        assert_eq!(config.dump_after, vec![Stage::Lifetime]);
    }

    #[test]
    fn test_bad_config_is_a_parse_error() {
        let err = PipelineConfig::from_json(r#"{ "kernel_target": "tpu" }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_stop_after_flatten() {
        let mut module = Module::new("test");
        let void = module.types.void();
        let f = module.create_function("main", &[], void);
        let entry = module.append_function_block(f).unwrap();
        let mut builder = IrBuilder::at_end(&mut module, entry);
        let cond = builder.const_bool(true).unwrap();
        builder.if_else(cond).unwrap();
        builder.ret_void().unwrap();

        let pipeline = Pipeline::new(PipelineConfig {
            stop_after: Some(Stage::Flatten),
            ..PipelineConfig::default()
        });
        let report = pipeline.run(&mut module).unwrap();
        assert_eq!(report.stages.last(), Some(&Stage::Flatten));
        // markers are still in the single top-level block
        assert_eq!(module.function_blocks(f).len(), 1);
    }
}
