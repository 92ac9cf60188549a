use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::request::Network;

/// A single backend RPC provider for one network.
#[derive(Clone, Debug, Deserialize)]
pub struct Upstream {
    pub id: String,
    pub endpoint: String,
    #[serde(default)]
    pub headers: Option<Vec<Header>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct NetworkSpec {
    pub id: String,
    pub upstreams: Vec<Upstream>,
}

/// One configured chain/network and the upstreams serving it, in the order
/// they are tried during failover. Upstream handles are shared; the request
/// core only ever holds clones of these `Arc`s.
#[derive(Debug)]
pub struct ChainNetwork {
    id: String,
    upstreams: Vec<Arc<Upstream>>,
}

impl ChainNetwork {
    pub fn upstreams(&self) -> &[Arc<Upstream>] {
        &self.upstreams
    }
}

impl Network for ChainNetwork {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Static network/upstream definitions loaded once at startup.
#[derive(Clone, Debug)]
pub struct Registry {
    networks: Arc<Vec<Arc<ChainNetwork>>>,
}

impl Registry {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read network registry from {}", path.display()))?;

        let specs: Vec<NetworkSpec> = serde_json::from_str(&raw).with_context(|| {
            format!(
                "failed to parse network registry JSON from {}",
                path.display()
            )
        })?;

        Self::from_specs(specs)
    }

    pub fn from_specs(specs: Vec<NetworkSpec>) -> Result<Self> {
        if specs.is_empty() {
            bail!("network registry is empty");
        }

        let mut networks = Vec::with_capacity(specs.len());
        for spec in specs {
            let id = spec.id.trim().to_string();
            if id.is_empty() {
                bail!("network id cannot be empty");
            }
            if spec.upstreams.is_empty() {
                bail!("network `{id}` has no upstreams");
            }
            let upstreams = spec
                .upstreams
                .into_iter()
                .map(|upstream| {
                    if upstream.id.trim().is_empty() {
                        bail!("upstream id cannot be empty on network `{id}`");
                    }
                    if upstream.endpoint.trim().is_empty() {
                        bail!("upstream `{}` has no endpoint", upstream.id);
                    }
                    Ok(Arc::new(upstream))
                })
                .collect::<Result<Vec<_>>>()?;
            networks.push(Arc::new(ChainNetwork { id, upstreams }));
        }

        Ok(Self {
            networks: Arc::new(networks),
        })
    }

    pub fn network(&self, id: &str) -> Option<Arc<ChainNetwork>> {
        self.networks
            .iter()
            .find(|network| network.id == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}
