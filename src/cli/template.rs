use anyhow::{Context, Result};

pub const CONFIG_TEMPLATE: &str = include_str!("../../templates/router-template.toml");

/// Generate configuration template
pub fn generate_config_template(output: Option<&str>) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, CONFIG_TEMPLATE)
            .with_context(|| format!("Failed to write config template to {}", path))?;
        println!("Generated configuration template: {}", path);
    } else {
        println!("{}", CONFIG_TEMPLATE);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_template_parses_and_validates() {
        let config = AppConfig::from_toml(CONFIG_TEMPLATE).unwrap();
        assert_eq!(config.router.id, 1);
        assert_eq!(config.sshd.port, 2222);
        assert!(!config.tunnel.enabled);
        assert!(config.validate().is_ok());
    }
}
