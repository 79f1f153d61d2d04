//! Router appliance context codec
//!
//! The reverse-proxy sidecar inside each router instance is configured by
//! two families of CONTEXT attributes:
//!
//! - `ONEAPP_VROUTER_ETH0_VIP<i>`: mirrors address `i` of the load-balancer
//!   reservation, whether or not it carries traffic.
//! - `ONEAPP_VNF_HAPROXY_LB<i>_<FIELD>`: load-balancer entry `i`, with the
//!   fields `IP`, `PORT`, `SERVER<j>_HOST` and `SERVER<j>_PORT`.
//!
//! Indices in both families are dense and zero-based after every write.
//! Everything else in the CONTEXT vector is left untouched.

use std::collections::BTreeMap;

use crate::one::Vector;

pub const VIP_PREFIX: &str = "ONEAPP_VROUTER_ETH0_VIP";
pub const LB_PREFIX: &str = "ONEAPP_VNF_HAPROXY_LB";
pub const HAPROXY_ENABLED: &str = "ONEAPP_VNF_HAPROXY_ENABLED";

const FIELD_IP: &str = "IP";
const FIELD_PORT: &str = "PORT";
const SERVER_PREFIX: &str = "SERVER";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Backend {
    pub host: String,
    pub port: String,
}

/// One exposed port of one logical load balancer
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContextEntry {
    pub vip: String,
    pub port: String,
    pub backends: Vec<Backend>,
    /// Fields this codec does not interpret, carried through verbatim
    pub extra: BTreeMap<String, String>,
}

impl ContextEntry {
    pub fn new(vip: impl Into<String>, port: impl ToString) -> Self {
        Self {
            vip: vip.into(),
            port: port.to_string(),
            ..Default::default()
        }
    }

    pub fn with_backend(mut self, host: impl Into<String>, port: impl ToString) -> Self {
        self.backends.push(Backend {
            host: host.into(),
            port: port.to_string(),
        });
        self
    }

    /// Rebuild an entry from the fields of one `LB<i>_` group
    fn from_fields(fields: BTreeMap<String, String>) -> Self {
        let mut entry = ContextEntry::default();
        let mut servers: BTreeMap<usize, Backend> = BTreeMap::new();
        for (field, value) in fields {
            match field.as_str() {
                FIELD_IP => entry.vip = value,
                FIELD_PORT => entry.port = value,
                _ => match parse_server_field(&field) {
                    Some((j, true)) => servers.entry(j).or_default().host = value,
                    Some((j, false)) => servers.entry(j).or_default().port = value,
                    None => {
                        entry.extra.insert(field, value);
                    }
                },
            }
        }
        entry.backends = servers
            .into_values()
            .filter(|b| !b.host.is_empty())
            .collect();
        entry
    }

    /// Flatten into `(field, value)` pairs in emission order
    fn fields(&self) -> Vec<(String, String)> {
        let mut out = Vec::with_capacity(2 + 2 * self.backends.len() + self.extra.len());
        if !self.vip.is_empty() {
            out.push((FIELD_IP.to_string(), self.vip.clone()));
        }
        if !self.port.is_empty() {
            out.push((FIELD_PORT.to_string(), self.port.clone()));
        }
        for (j, b) in self.backends.iter().enumerate() {
            out.push((format!("{SERVER_PREFIX}{j}_HOST"), b.host.clone()));
            if !b.port.is_empty() {
                out.push((format!("{SERVER_PREFIX}{j}_PORT"), b.port.clone()));
            }
        }
        out.extend(self.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        out
    }
}

/// `SERVER<j>_HOST` -> `(j, true)`, `SERVER<j>_PORT` -> `(j, false)`
fn parse_server_field(field: &str) -> Option<(usize, bool)> {
    let rest = field.strip_prefix(SERVER_PREFIX)?;
    let (index, kind) = rest.split_once('_')?;
    let index = index.parse().ok()?;
    match kind {
        "HOST" => Some((index, true)),
        "PORT" => Some((index, false)),
        _ => None,
    }
}

/// Index of a `VIP<i>` key
fn vip_index(key: &str) -> Option<usize> {
    key.strip_prefix(VIP_PREFIX)?.parse().ok()
}

/// `(i, FIELD)` of an `LB<i>_FIELD` key
fn lb_key(key: &str) -> Option<(usize, &str)> {
    let (index, field) = key.strip_prefix(LB_PREFIX)?.split_once('_')?;
    if field.is_empty() {
        return None;
    }
    Some((index.parse().ok()?, field))
}

fn is_family_key(key: &str) -> bool {
    vip_index(key).is_some() || lb_key(key).is_some()
}

/// The load-balancer view of a CONTEXT vector
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LbContext {
    pub vips: Vec<String>,
    pub entries: Vec<ContextEntry>,
}

impl LbContext {
    /// Decode both families. Groups are returned in ascending index order,
    /// whatever holes or ordering the stored attributes had.
    pub fn decode(context: &Vector) -> Self {
        let mut vips: BTreeMap<usize, String> = BTreeMap::new();
        let mut groups: BTreeMap<usize, BTreeMap<String, String>> = BTreeMap::new();
        for (key, value) in context.iter() {
            if let Some(i) = vip_index(key) {
                vips.insert(i, value.to_string());
            } else if let Some((i, field)) = lb_key(key) {
                groups
                    .entry(i)
                    .or_default()
                    .insert(field.to_string(), value.to_string());
            }
        }
        Self {
            vips: vips.into_values().collect(),
            entries: groups.into_values().map(ContextEntry::from_fields).collect(),
        }
    }

    /// Replace both families in `context` with this view, densely indexed
    pub fn encode_into(&self, context: &mut Vector) {
        context.retain(|key, _| !is_family_key(key));
        for (i, vip) in self.vips.iter().enumerate() {
            context.add(format!("{VIP_PREFIX}{i}"), vip.clone());
        }
        for (i, entry) in self.entries.iter().enumerate() {
            for (field, value) in entry.fields() {
                context.add(format!("{LB_PREFIX}{i}_{field}"), value);
            }
        }
    }
}

/// Merge `update` with the surviving entries of `context` and rewrite both
/// families.
///
/// `vip` names the load balancer being reconciled and `update` holds its
/// entries; they go first and replace every existing entry for `vip`, so an
/// empty `update` drops them. Existing entries for other VIPs follow in
/// index order, minus those whose VIP is no longer in `addresses`. With no
/// `vip` the pass only garbage-collects. `addresses` is the authoritative
/// address list of the load-balancer reservation and becomes the VIP family
/// verbatim.
pub fn reindex(
    context: &mut Vector,
    vip: Option<&str>,
    update: &[ContextEntry],
    addresses: &[String],
) {
    let existing = LbContext::decode(context);

    let mut entries: Vec<ContextEntry> = update.to_vec();
    entries.extend(existing.entries.into_iter().filter(|entry| {
        Some(entry.vip.as_str()) != vip && addresses.iter().any(|a| *a == entry.vip)
    }));

    LbContext {
        vips: addresses.to_vec(),
        entries,
    }
    .encode_into(context);
}
