//! Engine configuration: serde model, defaults, validation, TOML loading.

use crate::{
    error::{FusionError, Result},
    gating::AssociationConfig,
    input::{InputChannel, InputManagerConfig},
    motion_model::{parse_model_kind, MotionModelKind},
    processor::ProcessorConfig,
    types::ObjectClass,
    uncertainty::UncertaintyConfig,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path};

/// One input channel as configured.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Detection topic / stream name
    pub topic: String,
    #[serde(default = "default_true")]
    pub can_spawn_new_tracker: bool,
    /// Long name; the channel key when absent
    #[serde(default)]
    pub name: Option<String>,
    /// Short name; the first 3 characters of the key when absent
    #[serde(default)]
    pub short_name: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ChannelConfig {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            can_spawn_new_tracker: true,
            name: None,
            short_name: None,
        }
    }

    fn resolve(&self, key: &str) -> InputChannel {
        InputChannel {
            name: self.name.clone().unwrap_or_else(|| key.to_string()),
            short_name: self
                .short_name
                .clone()
                .unwrap_or_else(|| key.chars().take(3).collect()),
            can_spawn_new_tracker: self.can_spawn_new_tracker,
        }
    }
}

/// Complete engine configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Output rate (Hz)
    pub publish_rate: f64,
    /// Frame tracks are kept and published in
    pub world_frame_id: String,
    /// Ego vehicle frame
    pub ego_frame_id: String,
    /// Publish from a fast timer with extrapolation instead of per cycle
    pub enable_delay_compensation: bool,
    /// Inflate measurement covariance by the modelled ego-motion uncertainty
    pub consider_odometry_uncertainty: bool,
    /// Publish Tentative tracks to the secondary sink
    pub publish_tentative_objects: bool,
    /// Keys of `input_channels`, in channel-index order
    pub selected_input_channels: Vec<String>,
    pub input_channels: BTreeMap<String, ChannelConfig>,
    pub input: InputManagerConfig,
    /// Class label → tracker / motion-model name
    pub tracker_models: BTreeMap<ObjectClass, String>,
    pub processor: ProcessorConfig,
    pub association: AssociationConfig,
    pub uncertainty: UncertaintyConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let vehicle = "multi_vehicle_tracker";
        let vru = "pedestrian_and_bicycle_tracker";
        let tracker_models = BTreeMap::from([
            (ObjectClass::Unknown, vru.to_string()),
            (ObjectClass::Car, vehicle.to_string()),
            (ObjectClass::Truck, vehicle.to_string()),
            (ObjectClass::Bus, vehicle.to_string()),
            (ObjectClass::Trailer, vehicle.to_string()),
            (ObjectClass::Motorcycle, vehicle.to_string()),
            (ObjectClass::Bicycle, vru.to_string()),
            (ObjectClass::Pedestrian, vru.to_string()),
        ]);
        Self {
            publish_rate: 10.0,
            world_frame_id: "map".into(),
            ego_frame_id: "base_link".into(),
            enable_delay_compensation: false,
            consider_odometry_uncertainty: false,
            publish_tentative_objects: false,
            selected_input_channels: Vec::new(),
            input_channels: BTreeMap::new(),
            input: InputManagerConfig::default(),
            tracker_models,
            processor: ProcessorConfig::default(),
            association: AssociationConfig::default(),
            uncertainty: UncertaintyConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Add a channel and select it. Convenience for programmatic setup.
    pub fn with_channel(mut self, key: &str, channel: ChannelConfig) -> Self {
        self.input_channels.insert(key.to_string(), channel);
        self.selected_input_channels.push(key.to_string());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.selected_input_channels.is_empty() {
            return Err(FusionError::NoInputChannels);
        }
        for key in &self.selected_input_channels {
            if !self.input_channels.contains_key(key) {
                return Err(FusionError::InvalidConfig(format!(
                    "selected input channel '{key}' is not defined"
                )));
            }
        }
        if !(self.publish_rate > 0.0 && self.publish_rate.is_finite()) {
            return Err(FusionError::InvalidConfig(
                "publish_rate must be positive".into(),
            ));
        }
        let timeout = self.input.readiness_timeout;
        if !(timeout > 0.0 && timeout.is_finite()) || self.input.max_buffered_batches == 0 {
            return Err(FusionError::InvalidConfig(
                "input buffering parameters are out of range".into(),
            ));
        }
        self.motion_models()?;
        self.processor.validate()?;
        self.association.validate()?;
        Ok(())
    }

    /// Resolved channel descriptions in channel-index order.
    pub fn channels(&self) -> Result<Vec<InputChannel>> {
        if self.selected_input_channels.is_empty() {
            return Err(FusionError::NoInputChannels);
        }
        self.selected_input_channels
            .iter()
            .map(|key| {
                self.input_channels
                    .get(key)
                    .map(|c| c.resolve(key))
                    .ok_or_else(|| {
                        FusionError::InvalidConfig(format!("input channel '{key}' is not defined"))
                    })
            })
            .collect()
    }

    /// The class → model table with every name parsed.
    pub fn motion_models(&self) -> Result<BTreeMap<ObjectClass, MotionModelKind>> {
        self.tracker_models
            .iter()
            .map(|(class, name)| Ok((*class, parse_model_kind(name)?)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
publish_rate = 20.0
enable_delay_compensation = true
selected_input_channels = ["lidar_centerpoint", "front_radar"]

[input_channels.lidar_centerpoint]
topic = "/perception/lidar/objects"
short_name = "Lc"

[input_channels.front_radar]
topic = "/perception/radar/objects"
can_spawn_new_tracker = false

[tracker_models]
CAR = "constant_velocity"
MOTORBIKE = "pedestrian_and_bicycle_tracker"

[processor]
tracker_lifetime = 1.5

[processor.confident_count_threshold]
CAR = 2
"#;

    #[test]
    fn parses_sample_and_fills_defaults() {
        let config = EngineConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.publish_rate, 20.0);
        assert_eq!(config.world_frame_id, "map");
        assert_eq!(config.processor.tracker_lifetime, 1.5);
        assert_eq!(config.processor.confirmation_threshold(ObjectClass::Car), 2);
        assert_eq!(config.processor.confirmation_threshold(ObjectClass::Bus), 3);

        let models = config.motion_models().unwrap();
        assert_eq!(models[&ObjectClass::Car], MotionModelKind::ConstantVelocity);
        assert_eq!(
            models[&ObjectClass::Motorcycle],
            MotionModelKind::ConstantVelocity
        );
    }

    #[test]
    fn channel_names_default_from_key() {
        let channels = EngineConfig::from_toml_str(SAMPLE).unwrap().channels().unwrap();
        assert_eq!(channels[0].name, "lidar_centerpoint");
        assert_eq!(channels[0].short_name, "Lc");
        assert!(channels[0].can_spawn_new_tracker);
        assert_eq!(channels[1].short_name, "fro");
        assert!(!channels[1].can_spawn_new_tracker);
    }

    #[test]
    fn no_channels_is_rejected() {
        assert!(matches!(
            EngineConfig::default().validate(),
            Err(FusionError::NoInputChannels)
        ));
    }

    #[test]
    fn zero_readiness_timeout_is_rejected() {
        let mut config = EngineConfig::default().with_channel("lidar", ChannelConfig::new("/l"));
        config.validate().unwrap();
        config.input.readiness_timeout = 0.0;
        assert!(matches!(config.validate(), Err(FusionError::InvalidConfig(_))));
        config.input.readiness_timeout = f64::INFINITY;
        assert!(matches!(config.validate(), Err(FusionError::InvalidConfig(_))));
    }

    #[test]
    fn unknown_model_name_is_rejected() {
        let mut config = EngineConfig::default().with_channel("lidar", ChannelConfig::new("/l"));
        config
            .tracker_models
            .insert(ObjectClass::Bus, "hovercraft".into());
        assert!(matches!(
            config.validate(),
            Err(FusionError::UnknownMotionModel(_))
        ));
    }

    #[test]
    fn undefined_selected_channel_is_rejected() {
        let mut config = EngineConfig::default().with_channel("lidar", ChannelConfig::new("/l"));
        config.selected_input_channels.push("camera".into());
        assert!(matches!(
            config.validate(),
            Err(FusionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn serialises_back_to_toml() {
        let config = EngineConfig::default().with_channel("lidar", ChannelConfig::new("/l"));
        let text = toml::to_string(&config).unwrap();
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), config);
    }
}
