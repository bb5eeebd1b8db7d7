use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::sample::{ChannelMap, SampleSpec};

pub const DEFAULT_SAFETY_MARGIN_USEC: u64 = 8_000;
pub const DEFAULT_MAX_STREAMS_PER_DEVICE: usize = 256;

/// Core-wide policy and defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub default_sample_spec: SampleSpec,
    pub default_channel_map: ChannelMap,
    pub alternate_sample_rate: u32,
    pub avoid_resampling: bool,
    pub flat_volumes: bool,
    pub rescue_streams: bool,
    pub deferred_volume_safety_margin_usec: u64,
    pub deferred_volume_extra_delay_usec: i64,
    pub message_queue_capacity: usize,
    pub max_streams_per_device: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            default_sample_spec: SampleSpec::default(),
            default_channel_map: ChannelMap::stereo(),
            alternate_sample_rate: 48_000,
            avoid_resampling: false,
            flat_volumes: true,
            rescue_streams: true,
            deferred_volume_safety_margin_usec: DEFAULT_SAFETY_MARGIN_USEC,
            deferred_volume_extra_delay_usec: 0,
            message_queue_capacity: 64,
            max_streams_per_device: DEFAULT_MAX_STREAMS_PER_DEVICE,
        }
    }
}

impl CoreConfig {
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let config: CoreConfig =
            serde_json::from_str(text).context("failed to parse core configuration")?;
        if !config.default_sample_spec.is_valid() {
            anyhow::bail!("default sample spec is invalid");
        }
        if !config
            .default_channel_map
            .is_compatible(&config.default_sample_spec)
        {
            anyhow::bail!("default channel map does not match the default sample spec");
        }
        Ok(config)
    }

    pub fn with_flat_volumes(mut self, enabled: bool) -> Self {
        self.flat_volumes = enabled;
        self
    }

    pub fn with_rescue_streams(mut self, enabled: bool) -> Self {
        self.rescue_streams = enabled;
        self
    }

    pub fn with_alternate_sample_rate(mut self, rate: u32) -> Self {
        self.alternate_sample_rate = rate;
        self
    }

    pub fn with_avoid_resampling(mut self, enabled: bool) -> Self {
        self.avoid_resampling = enabled;
        self
    }

    pub fn with_safety_margin(mut self, usec: u64) -> Self {
        self.deferred_volume_safety_margin_usec = usec;
        self
    }

    pub fn with_extra_delay(mut self, usec: i64) -> Self {
        self.deferred_volume_extra_delay_usec = usec;
        self
    }

    pub fn with_max_streams_per_device(mut self, limit: usize) -> Self {
        self.max_streams_per_device = limit.max(1);
        self
    }
}
