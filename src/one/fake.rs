//! In-memory OpenNebula used by unit tests
//!
//! Models just enough of the inventory for the load-balancer engine:
//! networks with address ranges and leases, virtual routers with their
//! instances, and VM templates. Every call is recorded so tests can assert
//! on ordering.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::Mutex;

use async_trait::async_trait;

use super::template::{Attribute, Template, Vector};
use super::types::{AddressRange, ReserveRequest, VirtualNetwork, VirtualRouter, Vm, VmTemplate};
use super::OneApi;
use crate::error::{Error, Result, ONE_NO_EXISTS};

/// Generic action failure code used for injected errors
pub const ONE_ACTION: i32 = 0x0800;

pub const PUBLIC_BASE_IP: &str = "10.2.11.200";
pub const ROUTER_TEMPLATE: &str = "vrouter-tmpl";

#[derive(Default)]
struct FakeNet {
    vnet: VirtualNetwork,
    held: BTreeSet<String>,
    /// Next free offset per address range, for parent networks
    cursor: BTreeMap<i64, u32>,
}

struct FakeRouter {
    vr: VirtualRouter,
    template: Template,
}

#[derive(Default)]
struct State {
    next_id: i64,
    networks: BTreeMap<i64, FakeNet>,
    routers: BTreeMap<i64, FakeRouter>,
    templates: BTreeMap<i64, VmTemplate>,
    vms: BTreeMap<i64, Vm>,
    calls: Vec<String>,
    failing: BTreeSet<String>,
    reserved_from: Vec<i64>,
    instantiations: Vec<Template>,
}

impl State {
    fn id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn net(&mut self, id: i64) -> Result<&mut FakeNet> {
        self.networks.get_mut(&id).ok_or_else(|| missing("virtual network", id))
    }

    fn router(&mut self, id: i64) -> Result<&mut FakeRouter> {
        self.routers.get_mut(&id).ok_or_else(|| missing("virtual router", id))
    }
}

fn missing(kind: &str, id: i64) -> Error {
    Error::OneError {
        code: ONE_NO_EXISTS,
        message: format!("Error getting {kind} [{id}]."),
    }
}

fn action(message: impl Into<String>) -> Error {
    Error::OneError {
        code: ONE_ACTION,
        message: message.into(),
    }
}

fn unique<'a>(kind: &str, name: &str, ids: impl Iterator<Item = (i64, &'a str)>) -> Result<i64> {
    let found: Vec<i64> = ids.filter(|(_, n)| *n == name).map(|(id, _)| id).collect();
    match found.as_slice() {
        [] => Err(Error::NotFound(format!("{kind} {name}"))),
        [id] => Ok(*id),
        _ => Err(Error::ConfigError(format!(
            "{} {kind} objects named {name}",
            found.len()
        ))),
    }
}

pub struct FakeOne {
    state: Mutex<State>,
}

impl Default for FakeOne {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeOne {
    /// A fresh inventory with a `public` parent network (AR 0 is an IP4
    /// range from 10.2.11.200, AR 1 an ETHER range), a `private` network and
    /// a router VM template.
    pub fn new() -> Self {
        let fake = Self {
            state: Mutex::new(State::default()),
        };
        fake.seed_network(
            "public",
            vec![
                seeded_range(0, PUBLIC_BASE_IP, 50, "IP4"),
                seeded_range(1, "", 50, "ETHER"),
            ],
        );
        fake.seed_network("private", vec![seeded_range(0, "172.20.0.10", 50, "IP4")]);

        let mut context = Vector::new();
        context.add("NETWORK", "YES");
        context.add("ONEAPP_VNF_HAPROXY_ENABLED", "NO");
        let mut template = Template::new();
        template.add_pair("CPU", "1");
        template.add_vector("CONTEXT", context);
        fake.seed_template(ROUTER_TEMPLATE, template);
        fake
    }

    pub fn seed_network(&self, name: &str, address_ranges: Vec<AddressRange>) -> i64 {
        let mut st = self.lock();
        let id = st.id();
        st.networks.insert(
            id,
            FakeNet {
                vnet: VirtualNetwork {
                    id,
                    name: name.to_string(),
                    address_ranges,
                },
                ..Default::default()
            },
        );
        id
    }

    pub fn seed_template(&self, name: &str, template: Template) -> i64 {
        let mut st = self.lock();
        let id = st.id();
        st.templates.insert(
            id,
            VmTemplate {
                id,
                name: name.to_string(),
                template,
            },
        );
        id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Record a call, failing it when a test injected an error for `method`
    fn enter(&self, method: &str) -> Result<std::sync::MutexGuard<'_, State>> {
        let mut st = self.lock();
        st.calls.push(method.to_string());
        if st.failing.contains(method) {
            return Err(action(format!("[one.{method}] injected failure")));
        }
        Ok(st)
    }

    /// Make every later call to `method` (e.g. `"vn.hold"`) fail
    pub fn fail_on(&self, method: &str) {
        self.lock().failing.insert(method.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().failing.clear();
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn count_calls(&self, method: &str) -> usize {
        self.lock().calls.iter().filter(|c| *c == method).count()
    }

    /// AR ids passed to every reservation, in call order
    pub fn reserved_from(&self) -> Vec<i64> {
        self.lock().reserved_from.clone()
    }

    pub fn network_named(&self, name: &str) -> Option<VirtualNetwork> {
        self.lock()
            .networks
            .values()
            .find(|n| n.vnet.name == name)
            .map(|n| n.vnet.clone())
    }

    pub fn is_held(&self, network: &str, ip: &str) -> bool {
        self.lock()
            .networks
            .values()
            .any(|n| n.vnet.name == network && n.held.contains(ip))
    }

    pub fn router_named(&self, name: &str) -> Option<VirtualRouter> {
        self.lock()
            .routers
            .values()
            .find(|r| r.vr.name == name)
            .map(|r| r.vr.clone())
    }

    /// Template the router was allocated with
    pub fn router_template(&self, name: &str) -> Option<Template> {
        self.lock()
            .routers
            .values()
            .find(|r| r.vr.name == name)
            .map(|r| r.template.clone())
    }

    /// Extra templates passed to every instantiation, in call order
    pub fn instantiations(&self) -> Vec<Template> {
        self.lock().instantiations.clone()
    }

    /// CONTEXT of every instance of the named router
    pub fn router_contexts(&self, name: &str) -> Vec<Vector> {
        let st = self.lock();
        let Some(router) = st.routers.values().find(|r| r.vr.name == name) else {
            return Vec::new();
        };
        router
            .vr
            .vm_ids
            .iter()
            .filter_map(|id| st.vms.get(id))
            .map(|vm| vm.template.vector("CONTEXT").cloned().unwrap_or_default())
            .collect()
    }

    /// Delete a router behind the engine's back
    pub fn remove_router(&self, name: &str) {
        let mut st = self.lock();
        let ids: Vec<i64> = st
            .routers
            .iter()
            .filter(|(_, r)| r.vr.name == name)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some(r) = st.routers.remove(&id) {
                for vm in r.vr.vm_ids {
                    st.vms.remove(&vm);
                }
            }
        }
    }
}

fn seeded_range(id: i64, ip: &str, size: u32, kind: &str) -> AddressRange {
    let mut ar = AddressRange {
        id,
        ip: ip.to_string(),
        size,
        ..Default::default()
    };
    ar.attributes.insert("TYPE".to_string(), kind.to_string());
    ar
}

fn offset_ip(base: &str, offset: u32) -> Result<String> {
    if base.is_empty() {
        return Ok(String::new());
    }
    let base: Ipv4Addr = base
        .parse()
        .map_err(|_| action(format!("bad base address {base}")))?;
    Ok(Ipv4Addr::from(u32::from(base) + offset).to_string())
}

#[async_trait]
impl OneApi for FakeOne {
    async fn vnet_by_name(&self, name: &str) -> Result<i64> {
        let st = self.enter("vnpool.info")?;
        unique(
            "virtual network",
            name,
            st.networks.values().map(|n| (n.vnet.id, n.vnet.name.as_str())),
        )
    }

    async fn vnet_info(&self, id: i64) -> Result<VirtualNetwork> {
        let mut st = self.enter("vn.info")?;
        Ok(st.net(id)?.vnet.clone())
    }

    async fn vnet_reserve(&self, parent_id: i64, request: &ReserveRequest) -> Result<i64> {
        let mut st = self.enter("vn.reserve")?;
        st.reserved_from.push(request.ar_id);

        let parent = st.net(parent_id)?;
        let source = parent
            .vnet
            .address_ranges
            .iter()
            .find(|ar| ar.id == request.ar_id)
            .cloned()
            .ok_or_else(|| action(format!("address range {} not found", request.ar_id)))?;
        let cursor = parent.cursor.entry(source.id).or_insert(0);
        if *cursor + request.size > source.size {
            return Err(action("not enough free addresses"));
        }
        let ip = offset_ip(&source.ip, *cursor)?;
        *cursor += request.size;

        let mut ar = AddressRange {
            ip,
            size: request.size,
            ..Default::default()
        };
        ar.attributes.extend(
            source
                .attributes
                .get("TYPE")
                .map(|t| ("TYPE".to_string(), t.clone())),
        );
        ar.attributes
            .insert("PARENT_NETWORK_AR_ID".to_string(), source.id.to_string());

        match request.network_id {
            Some(id) => {
                let net = st.net(id)?;
                ar.id = net.vnet.address_ranges.iter().map(|a| a.id + 1).max().unwrap_or(0);
                net.vnet.address_ranges.push(ar);
                Ok(id)
            }
            None => {
                let id = st.id();
                st.networks.insert(
                    id,
                    FakeNet {
                        vnet: VirtualNetwork {
                            id,
                            name: request.name.clone(),
                            address_ranges: vec![ar],
                        },
                        ..Default::default()
                    },
                );
                Ok(id)
            }
        }
    }

    async fn vnet_tag_address_range(
        &self,
        id: i64,
        ar_id: i64,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let mut st = self.enter("vn.update_ar")?;
        let ar = st
            .net(id)?
            .vnet
            .address_ranges
            .iter_mut()
            .find(|ar| ar.id == ar_id)
            .ok_or_else(|| action(format!("address range {ar_id} not found")))?;
        ar.attributes.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn vnet_hold(&self, id: i64, ip: &str) -> Result<()> {
        let mut st = self.enter("vn.hold")?;
        let net = st.net(id)?;
        if !net.vnet.address_ranges.iter().any(|ar| ar.ip == ip) {
            return Err(action(format!("address {ip} not in network {id}")));
        }
        if !net.held.insert(ip.to_string()) {
            return Err(action(format!("address {ip} already in use")));
        }
        Ok(())
    }

    async fn vnet_release(&self, id: i64, ip: &str) -> Result<()> {
        let mut st = self.enter("vn.release")?;
        st.net(id)?.held.remove(ip);
        Ok(())
    }

    async fn vnet_remove_address_range(&self, id: i64, ar_id: i64) -> Result<()> {
        let mut st = self.enter("vn.rm_ar")?;
        let net = st.net(id)?;
        let pos = net
            .vnet
            .address_ranges
            .iter()
            .position(|ar| ar.id == ar_id)
            .ok_or_else(|| action(format!("address range {ar_id} not found")))?;
        if net.held.contains(&net.vnet.address_ranges[pos].ip) {
            return Err(action(format!("address range {ar_id} has leases in use")));
        }
        net.vnet.address_ranges.remove(pos);
        Ok(())
    }

    async fn vnet_delete(&self, id: i64) -> Result<()> {
        let mut st = self.enter("vn.delete")?;
        let net = st.net(id)?;
        if !net.held.is_empty() {
            return Err(action(format!("network {id} has leases in use")));
        }
        let name = net.vnet.name.clone();
        let referenced = st.routers.values().any(|r| {
            r.template
                .vectors("NIC")
                .any(|nic| nic.get("NETWORK") == Some(name.as_str()))
        });
        if referenced {
            return Err(action(format!("network {name} is in use by a virtual router")));
        }
        st.networks.remove(&id);
        Ok(())
    }

    async fn vrouter_by_name(&self, name: &str) -> Result<i64> {
        let st = self.enter("vrouterpool.info")?;
        unique(
            "virtual router",
            name,
            st.routers.values().map(|r| (r.vr.id, r.vr.name.as_str())),
        )
    }

    async fn vrouter_info(&self, id: i64) -> Result<VirtualRouter> {
        let mut st = self.enter("vrouter.info")?;
        Ok(st.router(id)?.vr.clone())
    }

    async fn vrouter_allocate(&self, template: &Template) -> Result<i64> {
        let mut st = self.enter("vrouter.allocate")?;
        let name = template
            .get("NAME")
            .ok_or_else(|| action("NAME is mandatory"))?
            .to_string();
        let id = st.id();
        st.routers.insert(
            id,
            FakeRouter {
                vr: VirtualRouter {
                    id,
                    name,
                    vm_ids: Vec::new(),
                },
                template: template.clone(),
            },
        );
        Ok(id)
    }

    async fn vrouter_instantiate(
        &self,
        id: i64,
        count: u32,
        template_id: i64,
        extra: &Template,
    ) -> Result<()> {
        let mut st = self.enter("vrouter.instantiate")?;
        st.instantiations.push(extra.clone());
        st.router(id)?;
        let base = st
            .templates
            .get(&template_id)
            .ok_or_else(|| missing("template", template_id))?
            .template
            .clone();

        // Extra attributes override same-named ones in the VM template
        let mut merged = Template::new();
        for attr in base.attributes() {
            if extra.attributes().iter().any(|a| a.key() == attr.key()) {
                continue;
            }
            push_attribute(&mut merged, attr);
        }
        for attr in extra.attributes() {
            push_attribute(&mut merged, attr);
        }

        for _ in 0..count {
            let vm_id = st.id();
            st.vms.insert(
                vm_id,
                Vm {
                    id: vm_id,
                    name: String::new(),
                    template: merged.clone(),
                },
            );
            st.router(id)?.vr.vm_ids.push(vm_id);
        }
        Ok(())
    }

    async fn vrouter_delete(&self, id: i64) -> Result<()> {
        let mut st = self.enter("vrouter.delete")?;
        let router = st.routers.remove(&id).ok_or_else(|| missing("virtual router", id))?;
        for vm in router.vr.vm_ids {
            st.vms.remove(&vm);
        }
        Ok(())
    }

    async fn vm_template_by_name(&self, name: &str) -> Result<i64> {
        let st = self.enter("templatepool.info")?;
        unique(
            "template",
            name,
            st.templates.values().map(|t| (t.id, t.name.as_str())),
        )
    }

    async fn vm_template_info(&self, id: i64) -> Result<VmTemplate> {
        let st = self.enter("template.info")?;
        st.templates.get(&id).cloned().ok_or_else(|| missing("template", id))
    }

    async fn vm_info(&self, id: i64) -> Result<Vm> {
        let st = self.enter("vm.info")?;
        st.vms.get(&id).cloned().ok_or_else(|| missing("virtual machine", id))
    }

    async fn vm_update_conf(&self, id: i64, template: &Template) -> Result<()> {
        let mut st = self.enter("vm.updateconf")?;
        let vm = st.vms.get_mut(&id).ok_or_else(|| missing("virtual machine", id))?;
        if let Some(context) = template.vector("CONTEXT") {
            match vm.template.vector_mut("CONTEXT") {
                Some(existing) => *existing = context.clone(),
                None => vm.template.add_vector("CONTEXT", context.clone()),
            }
        }
        Ok(())
    }
}

fn push_attribute(template: &mut Template, attr: &Attribute) {
    match attr {
        Attribute::Single { key, value } => template.add_pair(key.clone(), value),
        Attribute::Vector { key, vector } => template.add_vector(key.clone(), vector.clone()),
    }
}
