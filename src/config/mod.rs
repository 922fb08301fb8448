//! Configuration loading.
//!
//! The configuration file is INI-style (`bifrost.cnf`): a `[bifrost]`
//! section with global settings and one section per object, where
//! `type = server | service | listener | monitor` selects the schema.
//! All validation happens at load time; a bad file refuses startup.

mod schema;

pub use schema::{
    Config, GlobalConfig, ListenerConfig, MonitorConfig, ServerConfig, ServiceConfig, SslConfig,
};

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{ProxyError, Result};

/// One parsed INI section: ordered key/value pairs
pub(crate) type Section = BTreeMap<String, String>;

/// Load and validate a configuration file
pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let text = std::fs::read_to_string(path.as_ref())
        .map_err(|e| ProxyError::Config(format!("{}: {}", path.as_ref().display(), e)))?;
    parse_config_text(&text)
}

/// Parse and validate configuration text
pub fn parse_config_text(text: &str) -> Result<Config> {
    Config::from_sections(parse_ini(text)?)
}

/// Parse INI text into named sections. Keys are lower-cased; values keep
/// their case. `#` and `;` start comments.
pub(crate) fn parse_ini(text: &str) -> Result<Vec<(String, Section)>> {
    let mut sections: Vec<(String, Section)> = Vec::new();

    for (lineno, raw) in text.lines().enumerate() {
        let line = strip_comment(raw).trim();
        if line.is_empty() {
            continue;
        }

        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let name = name.trim();
            if name.is_empty() {
                return Err(ProxyError::Config(format!(
                    "line {}: empty section name",
                    lineno + 1
                )));
            }
            if sections.iter().any(|(n, _)| n == name) {
                return Err(ProxyError::Config(format!(
                    "line {}: duplicate section '{}'",
                    lineno + 1,
                    name
                )));
            }
            sections.push((name.to_string(), Section::new()));
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(ProxyError::Config(format!(
                "line {}: expected 'key=value', got '{}'",
                lineno + 1,
                line
            )));
        };

        let Some((_, section)) = sections.last_mut() else {
            return Err(ProxyError::Config(format!(
                "line {}: parameter outside of any section",
                lineno + 1
            )));
        };

        section.insert(
            key.trim().to_ascii_lowercase(),
            value.trim().to_string(),
        );
    }

    Ok(sections)
}

fn strip_comment(line: &str) -> &str {
    match line.find(['#', ';']) {
        Some(pos) => &line[..pos],
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sections() {
        let text = "\
[bifrost]
threads = 4

# a backend
[db1]
type=server
address = 10.0.0.1
port=3306
";
        let sections = parse_ini(text).unwrap();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].0, "bifrost");
        assert_eq!(sections[0].1.get("threads").map(String::as_str), Some("4"));
        assert_eq!(sections[1].1.get("address").map(String::as_str), Some("10.0.0.1"));
    }

    #[test]
    fn test_parameter_outside_section_rejected() {
        assert!(parse_ini("threads=4\n").is_err());
    }

    #[test]
    fn test_duplicate_section_rejected() {
        assert!(parse_ini("[a]\nx=1\n[a]\ny=2\n").is_err());
    }
}
