use serde::Deserialize;
use std::path::PathBuf;

const CONFIGURATION_DIR_ENV: &str = "APP_CONFIGURATION_DIR";

pub trait Validatable {
    fn validate(&self) -> Result<(), String>;
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default, deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    #[serde(default)]
    pub defaults: RequestDefaults,
    #[serde(default)]
    pub backend: BackendSettings,
}

impl Validatable for Settings {
    fn validate(&self) -> Result<(), String> {
        self.defaults.validate()?;
        self.backend.validate()
    }
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

/// Values used when a request leaves an optional field out.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct RequestDefaults {
    #[serde(default = "default_conf_threshold")]
    pub conf_threshold: f32,
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
    #[serde(default = "default_image_size")]
    pub image_size: u32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_conf_threshold() -> f32 {
    0.25
}

fn default_iou_threshold() -> f32 {
    0.45
}

fn default_image_size() -> u32 {
    640
}

fn default_top_k() -> usize {
    5
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            conf_threshold: default_conf_threshold(),
            iou_threshold: default_iou_threshold(),
            image_size: default_image_size(),
            top_k: default_top_k(),
        }
    }
}

impl Validatable for RequestDefaults {
    fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.conf_threshold) {
            return Err(format!(
                "defaults.conf_threshold must be within [0, 1], got {}",
                self.conf_threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(format!(
                "defaults.iou_threshold must be within [0, 1], got {}",
                self.iou_threshold
            ));
        }
        if self.image_size == 0 {
            return Err("defaults.image_size must be positive".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BackendSettings {
    #[serde(default)]
    pub intra_threads: Option<usize>,
    #[serde(default = "default_optimization_level")]
    pub optimization_level: u8,
    #[serde(default = "default_max_detections")]
    pub max_detections: usize,
    #[serde(default = "default_mask_threshold")]
    pub mask_threshold: f32,
}

fn default_optimization_level() -> u8 {
    3
}

fn default_max_detections() -> usize {
    300
}

fn default_mask_threshold() -> f32 {
    0.5
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            intra_threads: None,
            optimization_level: default_optimization_level(),
            max_detections: default_max_detections(),
            mask_threshold: default_mask_threshold(),
        }
    }
}

impl Validatable for BackendSettings {
    fn validate(&self) -> Result<(), String> {
        if self.optimization_level > 3 {
            return Err(format!(
                "backend.optimization_level must be between 0 and 3, got {}",
                self.optimization_level
            ));
        }
        if self.intra_threads == Some(0) {
            return Err("backend.intra_threads must be positive when set".to_string());
        }
        if self.max_detections == 0 {
            return Err("backend.max_detections must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.mask_threshold) {
            return Err(format!(
                "backend.mask_threshold must be within [0, 1], got {}",
                self.mask_threshold
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug`, `info` or `warn`.",
                other
            )),
        }
    }
}

pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

fn configuration_directory() -> Result<PathBuf, config::ConfigError> {
    if let Ok(dir) = std::env::var(CONFIGURATION_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }
    let base_path = std::env::current_dir().map_err(|e| {
        config::ConfigError::Message(format!("failed to determine the current directory: {}", e))
    })?;
    Ok(base_path.join("configuration"))
}

/// Layers `base.yaml`, `{APP_ENVIRONMENT}.yaml` and `VISION_*` variables.
///
/// The YAML files are optional: the host usually spawns the bridge from its
/// own working directory, and every key has a built-in default.
pub fn get_configuration() -> Result<Settings, config::ConfigError> {
    let configuration_directory = configuration_directory()?;

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let settings = config::Config::builder()
        .add_source(
            config::File::from(configuration_directory.join("base.yaml")).required(false),
        )
        .add_source(
            config::File::from(
                configuration_directory.join(format!("{}.yaml", environment.as_str())),
            )
            .required(false),
        )
        .add_source(
            config::Environment::with_prefix("VISION")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let settings = settings.try_deserialize::<Settings>()?;
    settings.validate().map_err(|e| {
        config::ConfigError::Message(format!("configuration validation failed: {}", e))
    })?;

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_yaml(yaml: &str) -> Settings {
        config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize::<Settings>()
            .unwrap()
    }

    #[test]
    fn test_empty_configuration_uses_documented_defaults() {
        let settings = from_yaml("{}");

        assert_eq!(settings.log_level, LogLevel::Info);
        assert_eq!(settings.defaults, RequestDefaults::default());
        assert_eq!(settings.defaults.conf_threshold, 0.25);
        assert_eq!(settings.defaults.iou_threshold, 0.45);
        assert_eq!(settings.defaults.image_size, 640);
        assert_eq!(settings.defaults.top_k, 5);
        assert_eq!(settings.backend, BackendSettings::default());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let settings = from_yaml(
            "log_level: DEBUG\ndefaults:\n  top_k: 3\nbackend:\n  intra_threads: 2\n",
        );

        assert_eq!(settings.log_level, LogLevel::Debug);
        assert_eq!(settings.defaults.top_k, 3);
        assert_eq!(settings.defaults.image_size, 640);
        assert_eq!(settings.backend.intra_threads, Some(2));
        assert_eq!(settings.backend.max_detections, 300);
    }

    #[test]
    fn test_validation_rejects_out_of_range_values() {
        let mut settings = Settings::default();
        settings.defaults.conf_threshold = 1.5;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.backend.optimization_level = 4;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.backend.intra_threads = Some(0);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(LogLevel::try_from("Warn".to_string()), Ok(LogLevel::Warn));
        assert!(LogLevel::try_from("trace".to_string()).is_err());
    }
}
