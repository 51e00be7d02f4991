//! Ambient-only CLI and seed-file handling. The real control-plane API is
//! `Proxier::on_update` / `LoadBalancer::on_update`, called programmatically
//! by an embedder; this module exists purely to drive the demo binary and
//! integration tests from a declarative JSON starting point, the way
//! `main.rs`'s `Args` drove the teacher's YAML config.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::net::{Endpoint, Protocol, Service};

#[derive(Parser, Debug)]
#[command(name = "l4proxier")]
#[command(about = "Userspace L4 service proxy: round-robin TCP/UDP forwarding")]
#[command(version)]
pub struct Args {
    /// Local address every service listener binds to.
    #[arg(long, default_value = "0.0.0.0")]
    pub bind_address: IpAddr,

    /// Optional JSON seed file applying one `Proxier::on_update` and one
    /// `LoadBalancer::on_update` at startup.
    #[arg(long)]
    pub seed: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long)]
    pub debug: bool,
}

/// A declarative starting point for the demo binary: the desired service
/// set plus the endpoint set for each. Not a hot-reloaded configuration
/// format — applied once at startup via the same public API an external
/// controller would use.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SeedFile {
    #[serde(default)]
    pub services: Vec<SeedService>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedService {
    pub id: String,
    pub port: u16,
    pub protocol: Protocol,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

impl SeedFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read seed file: {path:?}"))?;
        serde_json::from_str(&content).with_context(|| "failed to parse seed file as JSON")
    }

    pub fn services(&self) -> Vec<Service> {
        self.services
            .iter()
            .map(|s| Service::new(s.id.clone(), s.port, s.protocol))
            .collect()
    }

    pub fn endpoints_by_service(&self) -> HashMap<String, Vec<Endpoint>> {
        self.services
            .iter()
            .map(|s| (s.id.clone(), s.endpoints.clone()))
            .collect()
    }
}
