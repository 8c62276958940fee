//! TOML-based configuration for weft nodes.

use serde::Deserialize;

use weft_core::NodeName;

use crate::error::NodeError;

/// Top-level node configuration.
#[derive(Debug, Default, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub memory: MemorySection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl NodeConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<NodeConfig, NodeError> {
        Ok(toml::from_str(text)?)
    }
}

/// The `[node]` section.
#[derive(Debug, Default, Deserialize)]
pub struct NodeSection {
    /// Fixed node name as 32 hex characters. A fresh random name is
    /// generated when unset, which is what production deployments want;
    /// pinning a name is for reproducible test setups.
    pub name: Option<String>,
}

impl NodeSection {
    /// Resolve the configured name, generating one if absent.
    pub fn resolve_name(&self) -> Result<NodeName, NodeError> {
        let Some(text) = self.name.as_deref() else {
            return Ok(NodeName::generate());
        };
        let mut bytes = [0u8; 16];
        if text.len() != 32 {
            return Err(NodeError::InvalidNodeName(text.to_string()));
        }
        for (i, chunk) in text.as_bytes().chunks(2).enumerate() {
            let chunk = std::str::from_utf8(chunk)
                .map_err(|_| NodeError::InvalidNodeName(text.to_string()))?;
            bytes[i] = u8::from_str_radix(chunk, 16)
                .map_err(|_| NodeError::InvalidNodeName(text.to_string()))?;
        }
        let name = NodeName::from_bytes(bytes);
        if !name.is_valid() {
            return Err(NodeError::InvalidNodeName(text.to_string()));
        }
        Ok(name)
    }
}

/// The `[memory]` section: sizing for each node link's shared pool.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    /// Link-state fragments allocatable before the pool must grow.
    pub link_state_capacity: u64,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            link_state_capacity: 1024,
        }
    }
}

/// The `[logging]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Filter directive, e.g. `"debug"` or `"weft_router=trace"`.
    pub level: Option<String>,
    /// Emit JSON-structured output.
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = NodeConfig::default();
        assert_eq!(config.memory.link_state_capacity, 1024);
        assert!(config.node.name.is_none());
        assert!(!config.logging.json);
    }

    #[test]
    fn parses_full_config() {
        let config = NodeConfig::from_toml_str(
            r#"
            [node]
            name = "000102030405060708090a0b0c0d0e0f"

            [memory]
            link_state_capacity = 64

            [logging]
            level = "debug"
            json = true
            "#,
        )
        .expect("config parses");
        assert_eq!(config.memory.link_state_capacity, 64);
        assert_eq!(config.logging.level.as_deref(), Some("debug"));
        assert!(config.logging.json);

        let name = config.node.resolve_name().expect("name resolves");
        assert_eq!(name.as_bytes()[1], 0x01);
    }

    #[test]
    fn rejects_malformed_names() {
        let section = NodeSection {
            name: Some("zz".into()),
        };
        assert!(section.resolve_name().is_err());

        let section = NodeSection {
            name: Some("00".repeat(16)),
        };
        // All-zero is the reserved invalid name.
        assert!(section.resolve_name().is_err());
    }

    #[test]
    fn generates_name_when_unset() {
        let section = NodeSection::default();
        assert!(section.resolve_name().expect("generated").is_valid());
    }

    #[test]
    fn rejects_bad_toml() {
        assert!(NodeConfig::from_toml_str("[node\nname = 3").is_err());
    }
}
