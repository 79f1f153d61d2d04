//! XML-RPC transport for the OpenNebula API
//!
//! Every OpenNebula method takes the session string as its first parameter
//! and answers with an array `[success, payload, error_code, ...]`. Object
//! payloads are XML documents carried inside a string value.

use std::time::Duration;

use async_trait::async_trait;
use quick_xml::escape::escape;
use reqwest::Client;
use tracing::{debug, instrument};

use super::template::Template;
use super::types::{
    address_range_update, lease, ReserveRequest, VirtualNetwork, VirtualRouter, Vm, VmTemplate,
};
use super::xml::XmlNode;
use super::OneApi;
use crate::config::Endpoint;
use crate::error::{Error, Result};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Pool filter: every resource visible to the user
const POOL_ALL: i64 = -2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Str(String),
    Int(i64),
    Bool(bool),
    Array(Vec<Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    fn encode(&self, out: &mut String) {
        out.push_str("<value>");
        match self {
            Value::Str(s) => {
                out.push_str("<string>");
                out.push_str(&escape(s.as_str()));
                out.push_str("</string>");
            }
            Value::Int(i) => out.push_str(&format!("<i4>{i}</i4>")),
            Value::Bool(b) => out.push_str(&format!("<boolean>{}</boolean>", u8::from(*b))),
            Value::Array(items) => {
                out.push_str("<array><data>");
                for item in items {
                    item.encode(out);
                }
                out.push_str("</data></array>");
            }
        }
        out.push_str("</value>");
    }

    fn decode(node: &XmlNode) -> Result<Value> {
        let Some(typed) = node.children.first() else {
            // Untyped values default to string
            return Ok(Value::Str(node.text.clone()));
        };
        match typed.name.as_str() {
            "string" => Ok(Value::Str(typed.text.clone())),
            "i4" | "i8" | "int" => typed.text.trim().parse().map(Value::Int).map_err(|_| {
                Error::ProtocolError(format!("invalid integer value: {}", typed.text))
            }),
            "boolean" => Ok(Value::Bool(typed.text.trim() == "1")),
            "array" => typed
                .child("data")
                .map(|data| {
                    data.children_named("value")
                        .map(Value::decode)
                        .collect::<Result<Vec<_>>>()
                })
                .unwrap_or_else(|| Ok(Vec::new()))
                .map(Value::Array),
            other => Err(Error::ProtocolError(format!(
                "unsupported XML-RPC value type <{other}>"
            ))),
        }
    }
}

/// Render a `methodCall` document
pub fn encode_call(method: &str, params: &[Value]) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?><methodCall><methodName>");
    out.push_str(&escape(method));
    out.push_str("</methodName><params>");
    for p in params {
        out.push_str("<param>");
        p.encode(&mut out);
        out.push_str("</param>");
    }
    out.push_str("</params></methodCall>");
    out
}

/// Decode a `methodResponse` and unwrap the OpenNebula result convention
pub fn decode_response(body: &str) -> Result<Value> {
    let root = XmlNode::parse(body)?;
    if root.name != "methodResponse" {
        return Err(Error::ProtocolError(format!(
            "unexpected root element <{}>",
            root.name
        )));
    }
    if let Some(fault) = root.child("fault") {
        return Err(Error::ProtocolError(format!(
            "XML-RPC fault: {}",
            fault_string(fault).unwrap_or("unknown")
        )));
    }
    let value = root
        .child("params")
        .and_then(|p| p.child("param"))
        .and_then(|p| p.child("value"))
        .ok_or_else(|| Error::ProtocolError("response carries no value".to_string()))?;

    let Value::Array(items) = Value::decode(value)? else {
        return Err(Error::ProtocolError(
            "response value is not an array".to_string(),
        ));
    };
    let mut items = items.into_iter();
    match items.next() {
        Some(Value::Bool(true)) => items
            .next()
            .ok_or_else(|| Error::ProtocolError("successful response without payload".into())),
        Some(Value::Bool(false)) => {
            let message = items
                .next()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            let code = items
                .next()
                .and_then(|v| v.as_int())
                .map(|c| c as i32)
                .unwrap_or(-1);
            Err(Error::OneError { code, message })
        }
        _ => Err(Error::ProtocolError(
            "response does not start with a success flag".to_string(),
        )),
    }
}

fn fault_string(fault: &XmlNode) -> Option<&str> {
    fault
        .child("value")?
        .child("struct")?
        .children_named("member")
        .find(|m| m.child_text("name") == Some("faultString"))?
        .child("value")
        .map(|v| v.children.first().map(|c| c.text.as_str()).unwrap_or(v.text.as_str()))
}

/// OpenNebula XML-RPC client
#[derive(Clone)]
pub struct XmlRpcClient {
    http: Client,
    endpoint: String,
    session: String,
}

impl XmlRpcClient {
    pub fn new(endpoint: &str, session: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
            session: session.to_string(),
        })
    }

    pub fn from_endpoint(endpoint: &Endpoint) -> Result<Self> {
        Self::new(&endpoint.xmlrpc, &endpoint.auth, DEFAULT_TIMEOUT)
    }

    /// Invoke `method` with the session prepended to `params`
    #[instrument(level = "debug", skip(self, params))]
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let mut all = Vec::with_capacity(params.len() + 1);
        all.push(Value::Str(self.session.clone()));
        all.extend(params);

        let response = self
            .http
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "text/xml")
            .body(encode_call(method, &all))
            .send()
            .await?
            .error_for_status()?;
        let body = response.text().await?;
        decode_response(&body)
    }

    async fn call_xml(&self, method: &str, params: Vec<Value>) -> Result<XmlNode> {
        let payload = self.call(method, params).await?;
        let doc = payload.as_str().ok_or_else(|| {
            Error::ProtocolError(format!("{method} did not return an XML document"))
        })?;
        XmlNode::parse(doc)
    }

    async fn call_id(&self, method: &str, params: Vec<Value>) -> Result<i64> {
        let payload = self.call(method, params).await?;
        payload
            .as_int()
            .ok_or_else(|| Error::ProtocolError(format!("{method} did not return an id")))
    }

    async fn call_unit(&self, method: &str, params: Vec<Value>) -> Result<()> {
        self.call(method, params).await.map(|_| ())
    }

    /// Scan a pool for exactly one element named `name`
    async fn find_in_pool(&self, method: &str, item: &str, name: &str) -> Result<i64> {
        let pool = self
            .call_xml(
                method,
                vec![Value::Int(POOL_ALL), Value::Int(-1), Value::Int(-1)],
            )
            .await?;
        let matches: Vec<&XmlNode> = pool
            .children_named(item)
            .filter(|n| n.child_text("NAME") == Some(name))
            .collect();
        match matches.as_slice() {
            [] => Err(Error::NotFound(format!("{item} {name}"))),
            [one] => {
                let id = one.child_id("ID")?;
                debug!("Resolved {} {} to id {}", item, name, id);
                Ok(id)
            }
            _ => Err(Error::ConfigError(format!(
                "multiple {item} resources named {name}"
            ))),
        }
    }
}

fn tpl(t: &Template) -> Value {
    Value::Str(t.to_string())
}

#[async_trait]
impl OneApi for XmlRpcClient {
    async fn vnet_by_name(&self, name: &str) -> Result<i64> {
        self.find_in_pool("one.vnpool.info", "VNET", name).await
    }

    async fn vnet_info(&self, id: i64) -> Result<VirtualNetwork> {
        let node = self
            .call_xml("one.vn.info", vec![Value::Int(id), Value::Bool(true)])
            .await?;
        VirtualNetwork::from_xml(&node)
    }

    async fn vnet_reserve(&self, parent_id: i64, request: &ReserveRequest) -> Result<i64> {
        self.call_id(
            "one.vn.reserve",
            vec![Value::Int(parent_id), tpl(&request.to_template())],
        )
        .await
    }

    async fn vnet_tag_address_range(
        &self,
        id: i64,
        ar_id: i64,
        key: &str,
        value: &str,
    ) -> Result<()> {
        self.call_unit(
            "one.vn.update_ar",
            vec![Value::Int(id), tpl(&address_range_update(ar_id, key, value))],
        )
        .await
    }

    async fn vnet_hold(&self, id: i64, ip: &str) -> Result<()> {
        self.call_unit("one.vn.hold", vec![Value::Int(id), tpl(&lease(ip))])
            .await
    }

    async fn vnet_release(&self, id: i64, ip: &str) -> Result<()> {
        self.call_unit("one.vn.release", vec![Value::Int(id), tpl(&lease(ip))])
            .await
    }

    async fn vnet_remove_address_range(&self, id: i64, ar_id: i64) -> Result<()> {
        self.call_unit("one.vn.rm_ar", vec![Value::Int(id), Value::Int(ar_id)])
            .await
    }

    async fn vnet_delete(&self, id: i64) -> Result<()> {
        self.call_unit("one.vn.delete", vec![Value::Int(id)]).await
    }

    async fn vrouter_by_name(&self, name: &str) -> Result<i64> {
        self.find_in_pool("one.vrouterpool.info", "VROUTER", name)
            .await
    }

    async fn vrouter_info(&self, id: i64) -> Result<VirtualRouter> {
        let node = self
            .call_xml("one.vrouter.info", vec![Value::Int(id), Value::Bool(true)])
            .await?;
        VirtualRouter::from_xml(&node)
    }

    async fn vrouter_allocate(&self, template: &Template) -> Result<i64> {
        self.call_id("one.vrouter.allocate", vec![tpl(template)])
            .await
    }

    async fn vrouter_instantiate(
        &self,
        id: i64,
        count: u32,
        template_id: i64,
        extra: &Template,
    ) -> Result<()> {
        self.call_unit(
            "one.vrouter.instantiate",
            vec![
                Value::Int(id),
                Value::Int(i64::from(count)),
                Value::Int(template_id),
                Value::Str(String::new()),
                Value::Bool(false),
                tpl(extra),
            ],
        )
        .await
    }

    async fn vrouter_delete(&self, id: i64) -> Result<()> {
        self.call_unit("one.vrouter.delete", vec![Value::Int(id)])
            .await
    }

    async fn vm_template_by_name(&self, name: &str) -> Result<i64> {
        self.find_in_pool("one.templatepool.info", "VMTEMPLATE", name)
            .await
    }

    async fn vm_template_info(&self, id: i64) -> Result<VmTemplate> {
        let node = self
            .call_xml(
                "one.template.info",
                vec![Value::Int(id), Value::Bool(false), Value::Bool(true)],
            )
            .await?;
        VmTemplate::from_xml(&node)
    }

    async fn vm_info(&self, id: i64) -> Result<Vm> {
        let node = self
            .call_xml("one.vm.info", vec![Value::Int(id), Value::Bool(true)])
            .await?;
        Vm::from_xml(&node)
    }

    async fn vm_update_conf(&self, id: i64, template: &Template) -> Result<()> {
        self.call_unit("one.vm.updateconf", vec![Value::Int(id), tpl(template)])
            .await
    }
}
