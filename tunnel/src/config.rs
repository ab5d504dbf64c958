//! tunnel client configs

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

use crate::ExposedService;

/// default relay when none is given
pub static DEFAULT_RELAY: &str = "http://127.0.0.1:4017";

#[derive(Parser, Debug)]
#[clap(author, name = "portal-tunnel", bin_name = "portal-tunnel", about, long_about = None)]
/// expose local services through a portal relay
pub struct Cli {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// register a lease and serve it over a reverse session
    Expose(ExposeArgs),
}

#[derive(Args, Debug)]
pub struct ExposeArgs {
    /// relay base url
    #[clap(long, env = "PORTAL_RELAY", default_value = DEFAULT_RELAY)]
    pub relay: String,
    /// local host:port to forward traffic to
    #[clap(long)]
    pub host: Option<String>,
    /// service name; becomes `<name>.<funnel-domain>`
    #[clap(long)]
    pub name: Option<String>,
    /// human-readable description shown in the relay admin
    #[clap(long)]
    pub description: Option<String>,
    /// comma-separated tags
    #[clap(long, value_delimiter = ',')]
    pub tags: Vec<String>,
    /// thumbnail url
    #[clap(long)]
    pub thumbnail: Option<String>,
    /// owner label
    #[clap(long)]
    pub owner: Option<String>,
    /// hide the service from public listings
    #[clap(long)]
    pub hide: bool,
    /// serve plain HTTP through the relay instead of terminating TLS here
    #[clap(long)]
    pub no_tls: bool,
    /// yaml config file describing one or more services
    #[clap(long)]
    pub config: Option<PathBuf>,
}

/// yaml schema for `--config`
#[derive(Debug, Deserialize)]
pub struct TunnelConfig {
    /// relay base url; the cli flag wins when both are set
    pub relay: Option<String>,
    /// services to expose
    pub services: Vec<ServiceConfig>,
}

/// one service entry in the yaml file
#[derive(Debug, Deserialize)]
pub struct ServiceConfig {
    /// lease name
    pub name: String,
    /// local host:port
    pub host: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    thumbnail: Option<String>,
    #[serde(default)]
    owner: Option<String>,
    #[serde(default)]
    hide: bool,
    #[serde(default)]
    no_tls: bool,
}

fn metadata(
    description: Option<&str>,
    tags: &[String],
    thumbnail: Option<&str>,
    owner: Option<&str>,
    hide: bool,
) -> serde_json::Value {
    serde_json::json!({
        "description": description,
        "tags": tags,
        "thumbnail": thumbnail,
        "owner": owner,
        "hide": hide,
    })
}

impl ServiceConfig {
    fn into_service(self) -> ExposedService {
        ExposedService {
            metadata: metadata(
                self.description.as_deref(),
                &self.tags,
                self.thumbnail.as_deref(),
                self.owner.as_deref(),
                self.hide,
            ),
            name: self.name,
            host: self.host,
            tls: !self.no_tls,
        }
    }
}

impl ExposeArgs {
    /// Resolve the relay url and service list from flags or the yaml file.
    pub fn resolve(self) -> Result<(String, Vec<ExposedService>)> {
        if let Some(path) = &self.config {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let cfg: TunnelConfig = serde_yaml::from_str(&raw)
                .with_context(|| format!("parsing {}", path.display()))?;
            if cfg.services.is_empty() {
                bail!("config lists no services");
            }
            let relay = cfg.relay.unwrap_or(self.relay);
            let services = cfg
                .services
                .into_iter()
                .map(ServiceConfig::into_service)
                .collect();
            return Ok((relay, services));
        }

        let (Some(name), Some(host)) = (self.name.clone(), self.host.clone()) else {
            bail!("--name and --host are required without --config");
        };
        let service = ExposedService {
            metadata: metadata(
                self.description.as_deref(),
                &self.tags,
                self.thumbnail.as_deref(),
                self.owner.as_deref(),
                self.hide,
            ),
            name,
            host,
            tls: !self.no_tls,
        };
        Ok((self.relay, vec![service]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_from_flags() {
        let cli = Cli::parse_from([
            "portal-tunnel",
            "expose",
            "--relay",
            "https://portal.example.com",
            "--host",
            "127.0.0.1:3000",
            "--name",
            "demo",
            "--description",
            "my demo",
            "--tags",
            "a,b",
        ]);
        let Command::Expose(args) = cli.command;
        let (relay, services) = args.resolve().unwrap();
        assert_eq!(relay, "https://portal.example.com");
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].name, "demo");
        assert!(services[0].tls);
        assert_eq!(services[0].metadata["tags"], serde_json::json!(["a", "b"]));
    }

    #[test]
    fn resolve_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunnel.yaml");
        std::fs::write(
            &path,
            r#"
relay: http://relay.local:4017
services:
  - name: web
    host: 127.0.0.1:8080
    description: website
    no_tls: true
  - name: chat
    host: 127.0.0.1:9090
    tags: [fun]
"#,
        )
        .unwrap();
        let cli = Cli::parse_from([
            "portal-tunnel",
            "expose",
            "--config",
            path.to_str().unwrap(),
        ]);
        let Command::Expose(args) = cli.command;
        let (relay, services) = args.resolve().unwrap();
        assert_eq!(relay, "http://relay.local:4017");
        assert_eq!(services.len(), 2);
        assert!(!services[0].tls);
        assert!(services[1].tls);
    }

    #[test]
    fn flags_require_name_and_host() {
        let cli = Cli::parse_from(["portal-tunnel", "expose"]);
        let Command::Expose(args) = cli.command;
        assert!(args.resolve().is_err());
    }
}
