//! Cloud configuration
//!
//! The provider is configured from a YAML document with a single
//! `opennebula` section. Endpoint credentials may be left empty in the file
//! and supplied through the `ONE_XMLRPC` / `ONE_AUTH` environment variables.

use std::collections::BTreeMap;
use std::io::Read;
use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const ENV_ONE_XMLRPC: &str = "ONE_XMLRPC";
pub const ENV_ONE_AUTH: &str = "ONE_AUTH";

/// Address range used for the router reservation when none is configured.
/// The parent network is expected to carry an ETHER range at this index.
pub const DEFAULT_ROUTER_AR_ID: i64 = 1;
/// Address range used for the load-balancer reservation when none is
/// configured. The parent network is expected to carry an IP range here.
pub const DEFAULT_LB_AR_ID: i64 = 0;

pub const DEFAULT_REPLICAS: u32 = 1;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub opennebula: OneConfig,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OneConfig {
    #[serde(default)]
    pub endpoint: Endpoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_router: Option<VirtualRouterConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_network: Option<NetworkConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_network: Option<NetworkConfig>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Endpoint {
    #[serde(rename = "ONE_XMLRPC", default)]
    pub xmlrpc: String,
    #[serde(rename = "ONE_AUTH", default)]
    pub auth: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualRouterConfig {
    pub template_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    /// Extra CONTEXT attributes forced onto every router instance
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_context: BTreeMap<String, String>,
}

impl VirtualRouterConfig {
    pub fn replicas(&self) -> u32 {
        self.replicas.unwrap_or(DEFAULT_REPLICAS)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    pub name: String,
    #[serde(rename = "addressRangeID", default, skip_serializing_if = "Option::is_none")]
    pub address_range_id: Option<i64>,
    #[serde(rename = "floatingIP", default, skip_serializing_if = "Option::is_none")]
    pub floating_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub floating_only: Option<bool>,
}

impl NetworkConfig {
    /// Configured address range, or `default` when unset or negative
    pub fn address_range_or(&self, default: i64) -> i64 {
        match self.address_range_id {
            Some(id) if id >= 0 => id,
            _ => default,
        }
    }

    /// The floating IP, only when it is a syntactically valid address
    pub fn valid_floating_ip(&self) -> Option<&str> {
        self.floating_ip
            .as_deref()
            .filter(|ip| ip.parse::<IpAddr>().is_ok())
    }

    pub fn is_floating_only(&self) -> bool {
        self.floating_only.unwrap_or(false)
    }
}

impl Config {
    /// Parse a YAML document
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self> {
        let mut raw = String::new();
        reader.read_to_string(&mut raw)?;
        if raw.trim().is_empty() {
            return Err(Error::ConfigError("cloud config is empty".to_string()));
        }
        let mut cfg: Config = serde_yaml::from_str(&raw)?;
        cfg.opennebula.endpoint.fill_from_env();
        Ok(cfg)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        Self::from_reader(file)
    }
}

impl Endpoint {
    fn fill_from_env(&mut self) {
        if self.xmlrpc.is_empty() {
            if let Ok(v) = std::env::var(ENV_ONE_XMLRPC) {
                self.xmlrpc = v;
            }
        }
        if self.auth.is_empty() {
            if let Ok(v) = std::env::var(ENV_ONE_AUTH) {
                self.auth = v;
            }
        }
    }
}

impl OneConfig {
    /// Check that the load balancer can be built from this configuration
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.xmlrpc.is_empty() {
            return Err(Error::ConfigError(
                "endpoint ONE_XMLRPC must not be empty".to_string(),
            ));
        }
        if self.endpoint.auth.is_empty() {
            return Err(Error::ConfigError(
                "endpoint ONE_AUTH must not be empty".to_string(),
            ));
        }
        match &self.virtual_router {
            None => {
                return Err(Error::ConfigError(
                    "virtualRouter section is required".to_string(),
                ))
            }
            Some(vr) if vr.template_name.is_empty() => {
                return Err(Error::ConfigError(
                    "virtualRouter.templateName must not be empty".to_string(),
                ))
            }
            Some(_) => {}
        }
        if self.public_network.is_none() && self.private_network.is_none() {
            return Err(Error::ConfigError("no networks defined".to_string()));
        }
        for net in [&self.public_network, &self.private_network]
            .into_iter()
            .flatten()
        {
            if net.name.is_empty() {
                return Err(Error::ConfigError(
                    "network name must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Network both reservations are carved from: public if set, else private
    pub fn primary_network(&self) -> Option<&NetworkConfig> {
        self.public_network.as_ref().or(self.private_network.as_ref())
    }
}
