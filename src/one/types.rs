//! Typed views of OpenNebula inventory objects

use std::collections::BTreeMap;

use super::template::{Template, Vector};
use super::xml::XmlNode;
use crate::error::{Error, Result};

/// Custom AR attribute naming the logical load balancer that owns the address
pub const LB_NAME_ATTR: &str = "LB_NAME";

/// One address range inside a virtual network
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddressRange {
    pub id: i64,
    /// First address of the range; empty for ETHER ranges
    pub ip: String,
    pub size: u32,
    /// Remaining leaf attributes, custom tags included
    pub attributes: BTreeMap<String, String>,
}

impl AddressRange {
    fn from_xml(node: &XmlNode) -> Result<Self> {
        let mut ar = AddressRange {
            id: node.child_id("AR_ID")?,
            ..Default::default()
        };
        for child in node.children.iter().filter(|c| c.is_leaf()) {
            match child.name.as_str() {
                "AR_ID" => {}
                "IP" => ar.ip = child.text.clone(),
                "SIZE" => ar.size = child.text.trim().parse().unwrap_or(0),
                _ => {
                    ar.attributes.insert(child.name.clone(), child.text.clone());
                }
            }
        }
        Ok(ar)
    }

    /// Owner tag, if the address has been claimed
    pub fn lb_name(&self) -> Option<&str> {
        self.attributes.get(LB_NAME_ATTR).map(String::as_str)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VirtualNetwork {
    pub id: i64,
    pub name: String,
    pub address_ranges: Vec<AddressRange>,
}

impl VirtualNetwork {
    pub fn from_xml(node: &XmlNode) -> Result<Self> {
        let address_ranges = match node.child("AR_POOL") {
            Some(pool) => pool
                .children_named("AR")
                .map(AddressRange::from_xml)
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };
        Ok(Self {
            id: node.child_id("ID")?,
            name: node.child_text("NAME").unwrap_or_default().to_string(),
            address_ranges,
        })
    }

    /// Addresses of every range, in range order
    pub fn addresses(&self) -> Vec<String> {
        self.address_ranges.iter().map(|ar| ar.ip.clone()).collect()
    }

    /// Position of the range tagged with `lb_name`
    pub fn position_of(&self, lb_name: &str) -> Option<usize> {
        self.address_ranges
            .iter()
            .position(|ar| ar.lb_name() == Some(lb_name))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VirtualRouter {
    pub id: i64,
    pub name: String,
    pub vm_ids: Vec<i64>,
}

impl VirtualRouter {
    pub fn from_xml(node: &XmlNode) -> Result<Self> {
        let vm_ids = match node.child("VMS") {
            Some(vms) => vms
                .children_named("ID")
                .map(|id| {
                    id.text.trim().parse().map_err(|_| {
                        Error::ProtocolError(format!("invalid VM id in router: {}", id.text))
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };
        Ok(Self {
            id: node.child_id("ID")?,
            name: node.child_text("NAME").unwrap_or_default().to_string(),
            vm_ids,
        })
    }
}

/// A VM template (`VMTEMPLATE`)
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VmTemplate {
    pub id: i64,
    pub name: String,
    pub template: Template,
}

impl VmTemplate {
    pub fn from_xml(node: &XmlNode) -> Result<Self> {
        Ok(Self {
            id: node.child_id("ID")?,
            name: node.child_text("NAME").unwrap_or_default().to_string(),
            template: node.child("TEMPLATE").map(Template::from_xml).unwrap_or_default(),
        })
    }
}

/// A running VM (`VM`)
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Vm {
    pub id: i64,
    pub name: String,
    pub template: Template,
}

impl Vm {
    pub fn from_xml(node: &XmlNode) -> Result<Self> {
        Ok(Self {
            id: node.child_id("ID")?,
            name: node.child_text("NAME").unwrap_or_default().to_string(),
            template: node.child("TEMPLATE").map(Template::from_xml).unwrap_or_default(),
        })
    }
}

/// Parameters of a reservation carved out of a parent network
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReserveRequest {
    pub name: String,
    pub size: u32,
    pub ar_id: i64,
    /// Grow this existing reservation instead of creating a new one
    pub network_id: Option<i64>,
}

impl ReserveRequest {
    pub fn to_template(&self) -> Template {
        let mut t = Template::new();
        t.add_pair("NAME", &self.name);
        t.add_pair("SIZE", self.size);
        t.add_pair("AR_ID", self.ar_id);
        if let Some(id) = self.network_id {
            t.add_pair("NETWORK_ID", id);
        }
        t
    }
}

/// `AR=[ AR_ID=..., KEY=... ]` document for `one.vn.update_ar`
pub fn address_range_update(ar_id: i64, key: &str, value: &str) -> Template {
    let mut ar = Vector::new();
    ar.add("AR_ID", ar_id.to_string());
    ar.add(key, value);
    let mut t = Template::new();
    t.add_vector("AR", ar);
    t
}

/// `LEASES=[ IP=... ]` document for hold/release calls
pub fn lease(ip: &str) -> Template {
    let mut leases = Vector::new();
    leases.add("IP", ip);
    let mut t = Template::new();
    t.add_vector("LEASES", leases);
    t
}

#[cfg(test)]
mod tests {
    use super::*;

    const VNET: &str = r#"<VNET>
  <ID>42</ID>
  <NAME>demo-lb</NAME>
  <AR_POOL>
    <AR><AR_ID>0</AR_ID><IP>10.2.11.200</IP><SIZE>1</SIZE><TYPE>IP4</TYPE><LB_NAME>demo-default-web</LB_NAME><LEASES><LEASE><IP>10.2.11.200</IP></LEASE></LEASES></AR>
    <AR><AR_ID>1</AR_ID><IP>10.2.11.201</IP><SIZE>1</SIZE><TYPE>IP4</TYPE></AR>
  </AR_POOL>
</VNET>"#;

    #[test]
    fn test_virtual_network_from_xml() {
        let vn = VirtualNetwork::from_xml(&XmlNode::parse(VNET).unwrap()).unwrap();
        assert_eq!(vn.id, 42);
        assert_eq!(vn.name, "demo-lb");
        assert_eq!(vn.addresses(), vec!["10.2.11.200", "10.2.11.201"]);
        assert_eq!(vn.address_ranges[0].lb_name(), Some("demo-default-web"));
        assert_eq!(vn.address_ranges[0].attributes.get("TYPE").unwrap(), "IP4");
        assert_eq!(vn.address_ranges[1].lb_name(), None);
        assert_eq!(vn.position_of("demo-default-web"), Some(0));
        assert_eq!(vn.position_of("demo-default-api"), None);
    }

    #[test]
    fn test_virtual_router_from_xml() {
        let node =
            XmlNode::parse("<VROUTER><ID>3</ID><NAME>demo-lb</NAME><VMS><ID>10</ID><ID>11</ID></VMS></VROUTER>")
                .unwrap();
        let vr = VirtualRouter::from_xml(&node).unwrap();
        assert_eq!(vr.vm_ids, vec![10, 11]);

        let bare = XmlNode::parse("<VROUTER><ID>3</ID><NAME>demo-lb</NAME><VMS/></VROUTER>").unwrap();
        assert!(VirtualRouter::from_xml(&bare).unwrap().vm_ids.is_empty());
    }

    #[test]
    fn test_reserve_request_template() {
        let req = ReserveRequest {
            name: "demo-lb".into(),
            size: 1,
            ar_id: 0,
            network_id: Some(42),
        };
        assert_eq!(
            req.to_template().to_string(),
            "NAME=\"demo-lb\"\nSIZE=\"1\"\nAR_ID=\"0\"\nNETWORK_ID=\"42\"\n"
        );
    }

    #[test]
    fn test_lease_documents() {
        assert_eq!(lease("10.0.0.1").to_string(), "LEASES=[\n  IP=\"10.0.0.1\" ]\n");
        assert_eq!(
            address_range_update(4, LB_NAME_ATTR, "x").to_string(),
            "AR=[\n  AR_ID=\"4\",\n  LB_NAME=\"x\" ]\n"
        );
    }
}
