use channel::ChannelConfig;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Results buffered per query before the pull loops wait for the reader.
    pub result_buffer: usize,
    pub channel: ChannelConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            result_buffer: 1024,
            channel: ChannelConfig::default(),
        }
    }
}
