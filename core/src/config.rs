//! The per-plugin configuration value.
//!
//! Locating and parsing the configuration file is the native plugin shim's
//! job and stays outside of this crate: the search walks up from the loaded
//! plugin file until a config file is found, matches the plugin's path
//! against the file's section globs, and hands the winning section's
//! key/value table to [`Configuration::from_values`]. The resulting value is
//! also serialized over the control channel in answer to the worker's
//! [`WantsConfiguration`](crate::messages::WantsConfiguration) handshake.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// The default UI event loop rate when `frame_rate` is not set.
pub const DEFAULT_FRAME_RATE: f32 = 60.0;

/// A pre-parsed configuration value, as found in the section of the config
/// file matching this plugin. Everything here is plain data so the whole
/// object can be sent to the worker during the startup handshake.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    /// The name of the plugin group the plugin should be hosted in. When not
    /// set, the plugin gets its own worker process.
    pub group: Option<String>,

    /// Redirect the worker's STDOUT and STDERR streams to this file instead
    /// of piping them into our own logger. Some plugins misbehave when their
    /// standard streams are pipes. A bare `true` in the config maps to a
    /// default file under the temp directory.
    pub disable_pipes: Option<PathBuf>,

    /// Re-apply the embedded editor window coordinate fix after every resize.
    pub editor_coordinate_hack: bool,

    /// Refuse host-driven editor scale changes. Useful when fractional
    /// scaling makes plugins draw at the wrong size.
    pub editor_disable_host_scaling: bool,

    /// Strip drag-and-drop awareness flags from ancestor windows so drops
    /// reach the editor instead of the host's intercepting window.
    pub editor_force_dnd: bool,

    /// Use the alternate XEmbed embedding protocol instead of the default
    /// embedding method.
    pub editor_xembed: bool,

    /// The UI event loop rate in frames per second. Stored as an option so
    /// the startup message only mentions it when it was set explicitly;
    /// [`Configuration::event_loop_interval`] applies the default.
    pub frame_rate: Option<f32>,

    /// Report a stand-in host name when the plugin asks who is hosting it.
    pub hide_daw: bool,

    /// Prefer the 32-bit binary when a dual-architecture bundle contains
    /// both.
    pub vst3_prefer_32bit: bool,

    /// Options that had the wrong value type. Collected separately from
    /// `unknown_options` to avoid confusion, and surfaced at startup.
    pub invalid_options: Vec<String>,

    /// Unrecognized option keys, likely left over from a removed
    /// compatibility hack. Surfaced at startup.
    pub unknown_options: Vec<String>,
}

/// A value from the parsed configuration file section. The actual file format
/// is the shim's business; the core only distinguishes the types it accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Boolean(bool),
    Number(f64),
    String(String),
}

impl Configuration {
    /// Build a configuration from a parsed section's key/value pairs.
    /// Recognized keys with the right type are applied; everything else lands
    /// in `unknown_options` or `invalid_options`.
    pub fn from_values(values: impl IntoIterator<Item = (String, ConfigValue)>) -> Self {
        const RECOGNIZED_KEYS: &[&str] = &[
            "group",
            "disable_pipes",
            "editor_coordinate_hack",
            "editor_disable_host_scaling",
            "editor_force_dnd",
            "editor_xembed",
            "frame_rate",
            "hide_daw",
            "vst3_prefer_32bit",
        ];

        let mut config = Configuration::default();

        for (key, value) in values {
            if !RECOGNIZED_KEYS.contains(&key.as_str()) {
                config.unknown_options.push(key);
                continue;
            }

            let applied = match (key.as_str(), &value) {
                ("group", ConfigValue::String(group)) if !group.is_empty() => {
                    config.group = Some(group.clone());
                    true
                }

                ("disable_pipes", ConfigValue::Boolean(enabled)) => {
                    if *enabled {
                        config.disable_pipes = Some(
                            crate::utils::get_temporary_directory()
                                .join("plugbridge-output.log"),
                        );
                    }
                    true
                }
                ("disable_pipes", ConfigValue::String(path)) => {
                    config.disable_pipes = Some(PathBuf::from(path));
                    true
                }

                ("editor_coordinate_hack", ConfigValue::Boolean(enabled)) => {
                    config.editor_coordinate_hack = *enabled;
                    true
                }
                ("editor_disable_host_scaling", ConfigValue::Boolean(enabled)) => {
                    config.editor_disable_host_scaling = *enabled;
                    true
                }
                ("editor_force_dnd", ConfigValue::Boolean(enabled)) => {
                    config.editor_force_dnd = *enabled;
                    true
                }
                ("editor_xembed", ConfigValue::Boolean(enabled)) => {
                    config.editor_xembed = *enabled;
                    true
                }

                ("frame_rate", ConfigValue::Number(fps)) if *fps > 0.0 => {
                    config.frame_rate = Some(*fps as f32);
                    true
                }

                ("hide_daw", ConfigValue::Boolean(enabled)) => {
                    config.hide_daw = *enabled;
                    true
                }
                ("vst3_prefer_32bit", ConfigValue::Boolean(enabled)) => {
                    config.vst3_prefer_32bit = *enabled;
                    true
                }

                _ => false,
            };

            if !applied {
                config.invalid_options.push(key);
            }
        }

        config
    }

    /// The delay between event loop ticks, derived from `frame_rate`.
    pub fn event_loop_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.frame_rate.unwrap_or(DEFAULT_FRAME_RATE)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognized_options_are_applied() {
        let config = Configuration::from_values([
            ("group".to_owned(), ConfigValue::String("synths".to_owned())),
            ("editor_force_dnd".to_owned(), ConfigValue::Boolean(true)),
            ("frame_rate".to_owned(), ConfigValue::Number(30.0)),
            ("hide_daw".to_owned(), ConfigValue::Boolean(true)),
        ]);

        assert_eq!(config.group.as_deref(), Some("synths"));
        assert!(config.editor_force_dnd);
        assert!(config.hide_daw);
        assert_eq!(config.frame_rate, Some(30.0));
        assert_eq!(config.event_loop_interval(), Duration::from_secs_f64(1.0 / 30.0));
        assert!(config.unknown_options.is_empty());
        assert!(config.invalid_options.is_empty());
    }

    #[test]
    fn unknown_and_invalid_options_are_collected_separately() {
        let config = Configuration::from_values([
            ("cache_time_info".to_owned(), ConfigValue::Boolean(true)),
            ("group".to_owned(), ConfigValue::Boolean(true)),
            ("frame_rate".to_owned(), ConfigValue::String("fast".to_owned())),
        ]);

        assert_eq!(config.unknown_options, vec!["cache_time_info".to_owned()]);
        assert_eq!(config.invalid_options, vec!["group".to_owned(), "frame_rate".to_owned()]);
        assert_eq!(config.group, None);
        assert_eq!(config.frame_rate, None);
    }

    #[test]
    fn disable_pipes_accepts_a_boolean_or_a_path() {
        let as_bool = Configuration::from_values([(
            "disable_pipes".to_owned(),
            ConfigValue::Boolean(true),
        )]);
        assert!(as_bool.disable_pipes.is_some());

        let as_path = Configuration::from_values([(
            "disable_pipes".to_owned(),
            ConfigValue::String("/tmp/plugin-output.log".to_owned()),
        )]);
        assert_eq!(as_path.disable_pipes, Some(PathBuf::from("/tmp/plugin-output.log")));
    }

    #[test]
    fn default_frame_rate_applies() {
        let config = Configuration::default();
        assert_eq!(config.event_loop_interval(), Duration::from_secs_f64(1.0 / 60.0));
    }
}
