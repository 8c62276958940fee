//! Node-level error types.

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] toml::de::Error),

    #[error("invalid node name: {0}")]
    InvalidNodeName(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_forms() {
        let err = NodeError::InvalidNodeName("xyz".into());
        assert_eq!(err.to_string(), "invalid node name: xyz");
    }
}
