//! `config`: show the effective configuration.

use crate::config::default_config_path;
use evalbridge_types::config::BridgeConfig;

pub fn cmd_config_show(config: &BridgeConfig) -> anyhow::Result<()> {
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

pub fn cmd_config_path() {
    println!("{}", default_config_path().display());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shown_config_parses_back() {
        let text = toml::to_string_pretty(&BridgeConfig::default()).unwrap();
        let back = BridgeConfig::from_toml(&text).unwrap();
        assert_eq!(back.bridge.listen_addr, "127.0.0.1:7889");
        assert_eq!(back.session.max_idle_polls, 200);
    }
}
