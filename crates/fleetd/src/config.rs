//! fleetd.toml configuration parser.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use fleetgrid_compute::{BackendRegistry, StaticBackendConfig, StaticCompute};
use fleetgrid_pipeline::PipelineConfig;
use fleetgrid_placement::OfferLimits;

pub const FLEETS_PIPELINE: &str = "fleets";
pub const INSTANCES_PIPELINE: &str = "instances";
pub const GATEWAYS_PIPELINE: &str = "gateways";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetdConfig {
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub pipelines: PipelinesConfig,
    #[serde(default)]
    pub placement: PlacementConfig,
    #[serde(default)]
    pub backends: Vec<StaticBackendConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelinesConfig {
    #[serde(default)]
    pub fleets: PipelineSection,
    #[serde(default)]
    pub instances: PipelineSection,
    #[serde(default)]
    pub gateways: PipelineSection,
}

/// Overrides for one pipeline. Unset keys keep the engine defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineSection {
    pub workers: Option<usize>,
    pub lock_timeout: Option<String>,
    pub heartbeat_trigger: Option<String>,
    pub min_processing_interval: Option<String>,
    pub fetch_delay: Option<String>,
    pub queue_desired_minsize: Option<usize>,
    pub queue_lower_limit_factor: Option<f64>,
    pub queue_upper_limit_factor: Option<f64>,
    pub queue_check_delay: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementConfig {
    #[serde(default = "default_max_offers_per_fleet")]
    pub max_offers_per_fleet: usize,
    #[serde(default = "default_max_offers")]
    pub max_offers: usize,
}

fn default_max_offers_per_fleet() -> usize {
    OfferLimits::default().max_offers_per_fleet
}

fn default_max_offers() -> usize {
    OfferLimits::default().max_offers
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            max_offers_per_fleet: default_max_offers_per_fleet(),
            max_offers: default_max_offers(),
        }
    }
}

impl PlacementConfig {
    pub fn limits(&self) -> OfferLimits {
        OfferLimits {
            max_offers_per_fleet: self.max_offers_per_fleet,
            max_offers: self.max_offers,
        }
    }
}

impl PipelineSection {
    /// Engine config for the pipeline `name` with these overrides applied.
    pub fn to_pipeline_config(&self, name: &str) -> anyhow::Result<PipelineConfig> {
        let mut config = PipelineConfig::named(name);
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(size) = self.queue_desired_minsize {
            config.queue_desired_minsize = size;
        }
        if let Some(factor) = self.queue_lower_limit_factor {
            config.queue_lower_limit_factor = factor;
        }
        if let Some(factor) = self.queue_upper_limit_factor {
            config.queue_upper_limit_factor = factor;
        }
        let durations = [
            ("lock_timeout", &self.lock_timeout, &mut config.lock_timeout),
            ("heartbeat_trigger", &self.heartbeat_trigger, &mut config.heartbeat_trigger),
            (
                "min_processing_interval",
                &self.min_processing_interval,
                &mut config.min_processing_interval,
            ),
            ("fetch_delay", &self.fetch_delay, &mut config.fetch_delay),
            ("queue_check_delay", &self.queue_check_delay, &mut config.queue_check_delay),
        ];
        for (key, raw, slot) in durations {
            if let Some(raw) = raw {
                *slot = parse_duration(raw).with_context(|| format!("pipelines.{name}.{key}"))?;
            }
        }
        config.validate()?;
        Ok(config)
    }
}

impl FleetdConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: FleetdConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that need more than one field.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (i, backend) in self.backends.iter().enumerate() {
            if self.backends[..i].iter().any(|b| b.name == backend.name) {
                bail!("backend {} is configured twice", backend.name);
            }
        }
        if self.placement.max_offers == 0 || self.placement.max_offers_per_fleet == 0 {
            bail!("placement offer caps must be at least 1");
        }
        self.pipeline(FLEETS_PIPELINE)?;
        self.pipeline(INSTANCES_PIPELINE)?;
        self.pipeline(GATEWAYS_PIPELINE)?;
        Ok(())
    }

    pub fn pipeline(&self, name: &str) -> anyhow::Result<PipelineConfig> {
        let section = match name {
            FLEETS_PIPELINE => &self.pipelines.fleets,
            INSTANCES_PIPELINE => &self.pipelines.instances,
            GATEWAYS_PIPELINE => &self.pipelines.gateways,
            other => bail!("unknown pipeline {other}"),
        };
        section.to_pipeline_config(name)
    }

    pub fn registry(&self) -> BackendRegistry {
        let mut registry = BackendRegistry::new();
        for backend in &self.backends {
            registry.register(Arc::new(StaticCompute::new(backend.clone())));
        }
        registry
    }

    /// `--data-dir` wins over the file, which wins over the default.
    pub fn data_dir(&self, cli: Option<PathBuf>) -> PathBuf {
        cli.or_else(|| self.data_dir.clone())
            .unwrap_or_else(|| PathBuf::from("/var/lib/fleetgrid"))
    }
}

/// Parse a duration string like "250ms", "30s", "5m", "1h".
///
/// A unit is required; anything else is an error rather than a guess.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .with_context(|| format!("duration {s:?} has no unit"))?;
    let (value, unit) = s.split_at(split);
    let value: u64 = value
        .parse()
        .with_context(|| format!("duration {s:?} has no value"))?;
    let duration = match unit {
        "ms" => Duration::from_millis(value),
        "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        other => bail!("unknown duration unit {other:?} in {s:?}"),
    };
    Ok(duration)
}
