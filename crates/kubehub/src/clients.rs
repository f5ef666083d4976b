//! Per-tenant API clients.
//!
//! With cluster paths enabled every tenant is reached under `/clusters/<tenant>` on
//! the base server URL and `/clusters/*` lists across all tenants. Without them all
//! tenants share the base client.

use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use kube::config::KubeConfigOptions;
use kube::{Client, Config};
use pcl_core::TenantId;
use rustc_hash::FxHashMap;
use tracing::debug;

pub const WILDCARD: &str = "*";

fn cluster_url(base: &str, segment: &str) -> String {
    format!("{}/clusters/{}", base.trim_end_matches('/'), segment)
}

pub struct TenantClients {
    base: Config,
    cluster_paths: bool,
    default: Client,
    scoped: Mutex<FxHashMap<String, Client>>,
}

impl TenantClients {
    pub fn from_config(base: Config, cluster_paths: bool) -> Result<Self> {
        let default = Client::try_from(base.clone()).context("building kube client")?;
        Ok(Self { base, cluster_paths, default, scoped: Mutex::new(FxHashMap::default()) })
    }

    /// Current kubeconfig or in-cluster config.
    pub async fn infer(cluster_paths: bool) -> Result<Self> {
        let base = Config::infer().await.context("loading kube config")?;
        Self::from_config(base, cluster_paths)
    }

    /// Named kubeconfig context.
    pub async fn from_context(context: &str, cluster_paths: bool) -> Result<Self> {
        let opts = KubeConfigOptions { context: Some(context.to_string()), ..Default::default() };
        let base = Config::from_kubeconfig(&opts).await.with_context(|| format!("loading kube context {context}"))?;
        Self::from_config(base, cluster_paths)
    }

    pub fn for_tenant(&self, tenant: &TenantId) -> Result<Client> { self.scoped(tenant.as_str()) }

    /// Client whose list/watch spans every tenant.
    pub fn wildcard(&self) -> Result<Client> { self.scoped(WILDCARD) }

    fn scoped(&self, segment: &str) -> Result<Client> {
        if !self.cluster_paths {
            return Ok(self.default.clone());
        }
        let mut scoped = self.scoped.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(c) = scoped.get(segment) {
            return Ok(c.clone());
        }
        let mut cfg = self.base.clone();
        let url = cluster_url(&cfg.cluster_url.to_string(), segment);
        cfg.cluster_url = url.parse().with_context(|| format!("invalid cluster url {url}"))?;
        let client = Client::try_from(cfg).with_context(|| format!("building client for {segment}"))?;
        debug!(cluster = %segment, "tenant client created");
        scoped.insert(segment.to_string(), client.clone());
        Ok(client)
    }
}
