//! Default configuration values

use super::types::Config;

/// Default configuration file name (TOML)
pub const DEFAULT_CONFIG_TOML: &str = "blackbox.toml";

/// Default configuration file name (YAML)
pub const DEFAULT_CONFIG_YAML: &str = "blackbox.yaml";

/// Get list of config file names to search for
pub fn config_file_names() -> Vec<&'static str> {
    vec![
        DEFAULT_CONFIG_TOML,
        DEFAULT_CONFIG_YAML,
        ".blackbox.toml",
        ".blackbox.yaml",
    ]
}

/// Generate default configuration TOML
pub fn default_config_toml() -> String {
    let config = Config::default();
    toml::to_string_pretty(&config).unwrap_or_else(|_| DEFAULT_CONFIG_TEMPLATE.to_string())
}

/// Default configuration template
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# Blackbox Configuration

[session]
target = "linux_x64"
output_dir = "build/blackbox"

[compiler]
program = "konanc"
fixed_flags = ["-enable-assertions", "-g"]
mode = "one-stage"
library_extension = "klib"
executable_extension = "kexe"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_parses() {
        let config: Config = toml::from_str(DEFAULT_CONFIG_TEMPLATE).unwrap();
        assert_eq!(config.session.target, "linux_x64");
        assert_eq!(config.compiler.program, "konanc");
    }

    #[test]
    fn test_default_config_toml_round_trips() {
        let rendered = default_config_toml();
        let config: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(config.compiler.fixed_flags, Config::default().compiler.fixed_flags);
    }
}
