use super::MonitorConfig;
use std::{path::Path, str};
use thiserror::Error;
use tokio::{fs, io};
use tracing::{event, Level};

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum ConfigFormat {
  Json,
  Yaml,
  Toml,
  Auto,
}

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("Invalid config file extension when using auto format: {0}")]
  InvalidExtension(String),

  #[error("Config file does not have a file extension, and format is set to auto")]
  MissingExtension,

  #[error("Failed to parse config file")]
  ParseError(#[from] FormatError),

  #[error(transparent)]
  Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum FormatError {
  #[error(transparent)]
  JsonError(#[from] serde_json::Error),

  #[error(transparent)]
  YamlError(#[from] serde_yaml::Error),

  #[error(transparent)]
  TomlError(#[from] toml::de::Error),

  #[error("Config file is not valid UTF-8")]
  Utf8Error(#[from] str::Utf8Error),
}

trait ConfigParser {
  fn parse_config(content: &[u8]) -> Result<MonitorConfig, FormatError>;
}

struct Json;
impl ConfigParser for Json {
  fn parse_config(content: &[u8]) -> Result<MonitorConfig, FormatError> {
    Ok(serde_json::from_slice(content)?)
  }
}

struct Yaml;
impl ConfigParser for Yaml {
  fn parse_config(content: &[u8]) -> Result<MonitorConfig, FormatError> {
    Ok(serde_yaml::from_slice(content)?)
  }
}

struct Toml;
impl ConfigParser for Toml {
  fn parse_config(content: &[u8]) -> Result<MonitorConfig, FormatError> {
    Ok(toml::from_str(str::from_utf8(content)?)?)
  }
}

fn format_for(file: &Path) -> Result<ConfigFormat, ConfigError> {
  match file.extension().and_then(|e| e.to_str()) {
    Some("toml") => Ok(ConfigFormat::Toml),
    Some("yaml") | Some("yml") => Ok(ConfigFormat::Yaml),
    Some("json") => Ok(ConfigFormat::Json),
    Some(other) => Err(ConfigError::InvalidExtension(other.into())),
    None => Err(ConfigError::MissingExtension),
  }
}

pub(super) fn parse_config(content: &[u8], format: ConfigFormat) -> Result<MonitorConfig, ConfigError> {
  match format {
    ConfigFormat::Json => Ok(Json::parse_config(content)?),
    ConfigFormat::Yaml => Ok(Yaml::parse_config(content)?),
    ConfigFormat::Toml => Ok(Toml::parse_config(content)?),
    ConfigFormat::Auto => Err(ConfigError::MissingExtension),
  }
}

pub(super) async fn read_config(
  file: impl AsRef<Path>,
  format: ConfigFormat,
) -> Result<MonitorConfig, ConfigError> {
  let file = file.as_ref();
  let result: Result<MonitorConfig, ConfigError> = async {
    let format = match format {
      ConfigFormat::Auto => format_for(file)?,
      format => format,
    };
    let content = fs::read(file).await?;
    parse_config(&content, format)
  }
  .await;

  match result {
    Ok(config) => {
      event!(target: "udev-monitor", Level::INFO, ?config, file = %file.display(), "Loaded configuration");
      Ok(config)
    }
    Err(error) => {
      event!(target: "udev-monitor", Level::ERROR, ?error, file = %file.display(), "Failed to read config file");
      Err(error)
    }
  }
}
