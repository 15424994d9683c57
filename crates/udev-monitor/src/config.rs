mod parse;

use crate::{
  context::Context,
  monitor::{EventSource, Monitor, MonitorError},
};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::path::Path;

pub use parse::{ConfigError, ConfigFormat, FormatError};

/// A subsystem filter, optionally narrowed to one device type.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubsystemFilter {
  pub subsystem: String,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub device_type: Option<String>,
}

/// Declarative description of a monitor.
///
/// ```yaml
/// source: udev
/// subsystems:
///   - subsystem: block
///     deviceType: disk
/// tags: [seat]
/// receiveBufferSize: 131072
/// ```
#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MonitorConfig {
  #[serde(default)]
  pub source: EventSource,

  #[serde(default)]
  pub subsystems: SmallVec<[SubsystemFilter; 2]>,

  #[serde(default)]
  pub tags: SmallVec<[String; 2]>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub receive_buffer_size: Option<usize>,
}

impl MonitorConfig {
  pub fn parse(content: &[u8], format: ConfigFormat) -> Result<Self, ConfigError> {
    parse::parse_config(content, format)
  }

  pub async fn read(file: impl AsRef<Path>, format: ConfigFormat) -> Result<Self, ConfigError> {
    parse::read_config(file, format).await
  }

  /// Opens a monitor with every filter installed. The monitor is not
  /// started.
  pub fn build(&self, context: &Context) -> Result<Monitor, MonitorError> {
    let mut monitor = Monitor::with_source(context, self.source)?;
    for filter in &self.subsystems {
      monitor.filter_by(&filter.subsystem, filter.device_type.as_deref())?;
    }
    for tag in &self.tags {
      monitor.filter_by_tag(tag)?;
    }
    if let Some(size) = self.receive_buffer_size {
      monitor.set_receive_buffer_size(size)?;
    }
    Ok(monitor)
  }
}
