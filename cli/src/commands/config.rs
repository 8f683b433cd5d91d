// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::{Path, PathBuf};

use aegis_bridge_core::domain::bridge_config::{
    BridgeConfigManifest, ConsumerDomainConfig, ListenerConfig, ProviderDomainConfig, ServiceRouteConfig,
};

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./aegis-bridge.yaml)
        #[arg(short, long, default_value = "./aegis-bridge.yaml")]
        output: PathBuf,

        /// Include a sample listener, consumer domain and provider domain
        #[arg(long)]
        examples: bool,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, examples } => generate(&output, examples).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = BridgeConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. AEGIS_BRIDGE_CONFIG_PATH: {}",
            std::env::var("AEGIS_BRIDGE_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./aegis-bridge.yaml");
        println!("  4. ~/.aegis/bridge.yaml");
        println!("  5. /etc/aegis/bridge.yaml");
        println!();
    }

    println!("{}", "Current configuration:".bold());
    println!();
    println!("  Name: {}", config.metadata.name);
    println!();

    println!("{}", "Listeners:".bold());
    for listener in &config.spec.listeners {
        println!("  {} ({})", listener.name.bold(), listener.socket_address());
    }
    println!();

    println!("{}", "Consumer Domains:".bold());
    for domain in &config.spec.consumer_domains {
        let policy = domain.certificate_policy();
        println!("  {} on {}", domain.auth_name.bold(), domain.listener);
        println!(
            "    TLS: server certificate {}, client trust {}",
            policy.server_certificate, policy.client_trust
        );
        for route in &domain.services {
            println!("      - {} → {}", route.service_key(), route.target);
        }
    }
    println!();

    println!("{}", "Provider Domains:".bold());
    for provider in &config.spec.provider_domains {
        println!("  {} ({})", provider.name.bold(), provider.remote_endpoint());
        println!("    Auth name: {}", provider.auth_name);
        println!("    SSL type: {}", provider.ssl_type());
    }
    println!();

    println!("{}", "Transport:".bold());
    println!("  Handshake timeout: {}s", config.spec.transport.handshake_timeout_seconds);
    println!("  Exchange timeout: {}s", config.spec.transport.exchange_timeout_seconds);
    println!("  Max frame length: {} bytes", config.spec.transport.max_frame_length);
    println!();

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = BridgeConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;

    config.validate().context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: &Path, with_examples: bool) -> Result<()> {
    sample_manifest(with_examples)
        .to_yaml_file(output)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!("{}", format!("✓ Configuration generated: {}", output.display()).green());

    Ok(())
}

fn sample_manifest(with_examples: bool) -> BridgeConfigManifest {
    let mut manifest = BridgeConfigManifest::default();
    if !with_examples {
        return manifest;
    }

    manifest.spec.listeners.push(ListenerConfig {
        name: "public".to_string(),
        bind_address: "0.0.0.0".to_string(),
        port: 7600,
    });
    manifest.spec.consumer_domains.push(ConsumerDomainConfig {
        auth_name: "acme".to_string(),
        listener: "public".to_string(),
        propagate_tracing_activation: true,
        tls: None,
        services: vec![ServiceRouteConfig {
            interface_id: "Hello".to_string(),
            capability_id: "Greet".to_string(),
            instance_id: None,
            target: "hello-service".to_string(),
        }],
    });
    manifest.spec.provider_domains.push(ProviderDomainConfig {
        name: "partner".to_string(),
        auth_name: "edge".to_string(),
        remote_address: "partner.example.com".to_string(),
        port: 7600,
        tls: None,
    });
    manifest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_generated_examples_validate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aegis-bridge.yaml");

        generate(&path, true).await.unwrap();

        let loaded = BridgeConfigManifest::from_yaml_file(&path).unwrap();
        loaded.validate().unwrap();
        assert_eq!(loaded.spec.consumer_domains[0].services.len(), 1);
    }

    #[test]
    fn test_minimal_sample_is_empty() {
        let manifest = sample_manifest(false);
        assert!(manifest.spec.listeners.is_empty());
        assert!(manifest.validate().is_ok());
    }
}
