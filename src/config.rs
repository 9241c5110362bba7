use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Default decode ceiling for a single PDU: 2 MiB.
pub const DEFAULT_MAX_PDU_SIZE: u32 = 2 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Codec options. All fields have conservative defaults; a zero-configuration
/// `CodecConfig::default()` accepts any well-formed RFC 4511 stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Largest accepted PDU (tag + length octets + content). Exceeding it
    /// during decode yields `DecoderError::MaxPduExceeded`.
    pub max_pdu_size: u32,
    /// Accept attribute descriptions carrying the `;binary` transfer option.
    /// When false such descriptions are rejected during decode.
    pub allow_binary_attribute_option: bool,
    /// When true, invalid UTF-8 in a string-typed field (DNs, diagnostic
    /// messages, OIDs, URIs, attribute descriptions) is a decode error
    /// instead of being replaced lossily.
    pub strict_string_validation: bool,
    /// Trim leading whitespace from matchedDN when encoding responses.
    pub trim_matched_dn: bool,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_pdu_size: DEFAULT_MAX_PDU_SIZE,
            allow_binary_attribute_option: true,
            strict_string_validation: false,
            trim_matched_dn: true,
        }
    }
}

impl CodecConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_default() {
        let config = CodecConfig::default();
        assert_eq!(config.max_pdu_size, 2 * 1024 * 1024);
        assert!(config.allow_binary_attribute_option);
        assert!(!config.strict_string_validation);
        assert!(config.trim_matched_dn);
    }

    #[test]
    fn test_config_from_str() {
        let yaml = r#"
max_pdu_size: 65536
strict_string_validation: true
"#;
        let config = CodecConfig::from_str(yaml).unwrap();
        assert_eq!(config.max_pdu_size, 65536);
        assert!(config.strict_string_validation);
        // untouched fields keep their defaults
        assert!(config.allow_binary_attribute_option);
        assert!(config.trim_matched_dn);
    }

    #[test]
    fn test_config_from_file() {
        let yaml = "max_pdu_size: 1024\ntrim_matched_dn: false\n";
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file.flush().unwrap();

        let config = CodecConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_pdu_size, 1024);
        assert!(!config.trim_matched_dn);
    }

    #[test]
    fn test_config_from_str_invalid_yaml() {
        assert!(CodecConfig::from_str("max_pdu_size: [").is_err());
    }

    #[test]
    fn test_config_from_file_nonexistent() {
        assert!(CodecConfig::from_file("/nonexistent/path/codec.yaml").is_err());
    }
}
