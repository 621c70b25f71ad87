use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::config::AppConfig;

/// 检查配置文件权限（仅Unix系统）
#[cfg(unix)]
pub fn check_config_file_permissions(config_path: &str) -> Result<()> {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tracing::warn;

    let metadata = fs::metadata(config_path)
        .with_context(|| format!("Failed to read metadata for config file: {}", config_path))?;
    let mode = metadata.permissions().mode();

    // 其他用户可写时，任何人都能替换信任锚路径
    if mode & 0o002 != 0 {
        warn!(
            "SECURITY WARNING: Config file '{}' is writable by others (permissions: {:o})\n\
             RECOMMENDATION: chmod 644 {}",
            config_path,
            mode & 0o777,
            config_path
        );
    }

    Ok(())
}

/// Windows系统不进行权限检查
#[cfg(not(unix))]
pub fn check_config_file_permissions(_config_path: &str) -> Result<()> {
    Ok(())
}

#[derive(Serialize)]
struct CheckResult {
    valid: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    details: serde_json::Value,
}

/// Expand path with tilde (~) and make it absolute
pub fn expand_path(path: &str) -> Result<String> {
    let expanded = shellexpand::tilde(path);
    let path_buf = PathBuf::from(expanded.as_ref());

    if path_buf.is_absolute() {
        Ok(expanded.into_owned())
    } else {
        std::env::current_dir()
            .context("Failed to get current directory")?
            .join(&path_buf)
            .to_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid path: {}", path))
    }
}

/// 收集配置中引用的文件缺失等非致命问题
fn collect_warnings(config: &AppConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    let identity = &config.identity;

    let mut files = vec![
        ("Private key", &identity.private_key_path),
        ("Trust anchor", &identity.trust_anchor_path),
    ];
    if let Some(ref cert) = identity.certificate_path {
        files.push(("Certificate", cert));
    }
    for (what, path) in files {
        if !path.exists() {
            warnings.push(format!("{} file not found: {}", what, path.display()));
        }
    }

    if !config.tunnel.enabled && !config.tunnel.ports.is_empty() {
        warnings.push("tunnel.ports is set but the tunnel is disabled".to_string());
    }
    warnings
}

fn describe(config: &AppConfig) -> serde_json::Value {
    serde_json::json!({
        "router_id": config.router.id,
        "sshd": {
            "bind_addr": config.sshd.bind_addr,
            "port": config.sshd.port,
            "inactivity_timeout_secs": config.sshd.inactivity_timeout_secs,
        },
        "identity": {
            "private_key_path": config.identity.private_key_path,
            "certificate_path": config.identity.certificate_path,
            "trust_anchor_path": config.identity.trust_anchor_path,
        },
        "tunnel": {
            "enabled": config.tunnel.enabled,
            "target": config.tunnel.target,
            "username": config.tunnel.username,
            "ports": config.tunnel.ports,
            "expose_sshd": config.tunnel.expose_sshd,
            "relay_mode": config.tunnel.relay_mode.to_string(),
            "reconnect": config.tunnel.reconnect.mode.to_string(),
        },
    })
}

/// Check configuration file format
pub fn check_config(config_path: &str, format: &str) -> Result<()> {
    let path = Path::new(config_path);

    if !path.exists() {
        if format == "json" {
            let result = CheckResult {
                valid: false,
                warnings: vec![],
                error: Some(format!("Configuration file not found: {}", config_path)),
                details: serde_json::json!({}),
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            println!("✗ Configuration file not found: {}", config_path);
        }
        anyhow::bail!("Configuration file not found: {}", config_path);
    }

    if format == "text" {
        println!("Checking configuration file: {}\n", config_path);
    }

    match AppConfig::load(path) {
        Ok(config) => {
            let warnings = collect_warnings(&config);

            if format == "json" {
                let result = CheckResult {
                    valid: true,
                    warnings,
                    error: None,
                    details: describe(&config),
                };
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("✓ Router ID: {}", config.router.id);
                println!(
                    "✓ SSH server: {}:{}",
                    config.sshd.bind_addr,
                    if config.sshd.port == 0 {
                        "<ephemeral>".to_string()
                    } else {
                        config.sshd.port.to_string()
                    }
                );
                println!(
                    "✓ Private key: {}",
                    config.identity.private_key_path.display()
                );
                if let Some(ref cert) = config.identity.certificate_path {
                    println!("✓ Certificate: {}", cert.display());
                }
                println!(
                    "✓ Trust anchor: {}",
                    config.identity.trust_anchor_path.display()
                );
                if config.tunnel.enabled {
                    println!(
                        "✓ Tunnel: {}@{} ports {:?}{} ({} relay, {} reconnect)",
                        config.tunnel.username,
                        config.tunnel.target,
                        config.tunnel.ports,
                        if config.tunnel.expose_sshd {
                            " + sshd"
                        } else {
                            ""
                        },
                        config.tunnel.relay_mode,
                        config.tunnel.reconnect.mode
                    );
                } else {
                    println!("✓ Tunnel: disabled");
                }
                for warning in &warnings {
                    println!("⚠ Warning: {}", warning);
                }
                println!("\n✓ Configuration is valid!");
            }
            Ok(())
        }
        Err(e) => {
            if format == "json" {
                let result = CheckResult {
                    valid: false,
                    warnings: vec![],
                    error: Some(format!("{:#}", e)),
                    details: serde_json::json!({}),
                };
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("✗ Configuration validation failed!");
                println!("\nError details:");
                println!("{:#}", e);

                println!("\nCommon issues:");
                println!("  1. Check TOML syntax (brackets, quotes, commas)");
                println!("  2. [identity] needs private_key_path and trust_anchor_path");
                println!("  3. With [tunnel] enabled = true, set target (host:port) and username");
                println!("  4. Ensure port numbers are valid (1-65535)");
            }

            Err(e)
        }
    }
}
