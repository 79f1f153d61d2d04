//! OpenNebula attribute templates
//!
//! A template is an ordered list of attributes. Each attribute is either a
//! single `KEY="value"` pair or a vector `KEY=[ K1="v1", K2="v2" ]`. Keys may
//! repeat (several `NIC` vectors, for instance), so neither level is a plain
//! map.

use std::fmt;

use super::xml::XmlNode;

/// Ordered key/value pairs of a vector attribute
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Vector {
    pairs: Vec<(String, String)>,
}

impl Vector {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value stored under `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Append a pair, keeping any existing pair with the same key
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((key.into(), value.into()));
    }

    /// Remove every pair stored under `key`
    pub fn del(&mut self, key: &str) {
        self.pairs.retain(|(k, _)| k != key);
    }

    /// Delete-then-add, so the new value is the only one for `key`
    pub fn replace(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.del(&key);
        self.add(key, value);
    }

    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&str, &str) -> bool,
    {
        self.pairs.retain(|(k, v)| keep(k, v));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Vector {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            pairs: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Attribute {
    Single { key: String, value: String },
    Vector { key: String, vector: Vector },
}

impl Attribute {
    pub fn key(&self) -> &str {
        match self {
            Attribute::Single { key, .. } | Attribute::Vector { key, .. } => key,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Template {
    attributes: Vec<Attribute>,
}

impl Template {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a template from the children of a `<TEMPLATE>` element.
    /// Leaf children become single attributes, the rest become vectors.
    pub fn from_xml(node: &XmlNode) -> Self {
        let attributes = node
            .children
            .iter()
            .map(|child| {
                if child.is_leaf() {
                    Attribute::Single {
                        key: child.name.clone(),
                        value: child.text.clone(),
                    }
                } else {
                    Attribute::Vector {
                        key: child.name.clone(),
                        vector: child
                            .children
                            .iter()
                            .map(|p| (p.name.clone(), p.text.clone()))
                            .collect(),
                    }
                }
            })
            .collect();
        Self { attributes }
    }

    pub fn add_pair(&mut self, key: impl Into<String>, value: impl ToString) {
        self.attributes.push(Attribute::Single {
            key: key.into(),
            value: value.to_string(),
        });
    }

    pub fn add_vector(&mut self, key: impl Into<String>, vector: Vector) {
        self.attributes.push(Attribute::Vector {
            key: key.into(),
            vector,
        });
    }

    /// First single attribute stored under `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Single { key: k, value } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    pub fn vector(&self, key: &str) -> Option<&Vector> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Vector { key: k, vector } if k == key => Some(vector),
            _ => None,
        })
    }

    pub fn vector_mut(&mut self, key: &str) -> Option<&mut Vector> {
        self.attributes.iter_mut().find_map(|a| match a {
            Attribute::Vector { key: k, vector } if k == key => Some(vector),
            _ => None,
        })
    }

    pub fn vectors<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a Vector> + 'a {
        self.attributes.iter().filter_map(move |a| match a {
            Attribute::Vector { key: k, vector } if k == key => Some(vector),
            _ => None,
        })
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for attr in &self.attributes {
            match attr {
                Attribute::Single { key, value } => writeln!(f, "{key}=\"{}\"", escape(value))?,
                Attribute::Vector { key, vector } => {
                    write!(f, "{key}=[")?;
                    let mut first = true;
                    for (k, v) in vector.iter() {
                        if !first {
                            write!(f, ",")?;
                        }
                        write!(f, "\n  {k}=\"{}\"", escape(v))?;
                        first = false;
                    }
                    writeln!(f, " ]")?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_pairs_and_vectors() {
        let mut t = Template::new();
        t.add_pair("NAME", "demo-lb");
        let mut nic = Vector::new();
        nic.add("NETWORK", "demo-vr");
        nic.add("FLOATING_IP", "YES");
        t.add_vector("NIC", nic);
        assert_eq!(
            t.to_string(),
            "NAME=\"demo-lb\"\nNIC=[\n  NETWORK=\"demo-vr\",\n  FLOATING_IP=\"YES\" ]\n"
        );
    }

    #[test]
    fn test_escaping() {
        let mut t = Template::new();
        t.add_pair("SCRIPT", r#"echo "hi" \ done"#);
        assert_eq!(t.to_string(), "SCRIPT=\"echo \\\"hi\\\" \\\\ done\"\n");
    }

    #[test]
    fn test_replace_wins_over_duplicates() {
        let mut v: Vector = [("A", "1"), ("B", "2"), ("A", "3")].into_iter().collect();
        v.replace("A", "YES");
        assert_eq!(v.get("A"), Some("YES"));
        assert_eq!(v.len(), 2);
        assert_eq!(v.iter().last(), Some(("A", "YES")));
    }

    #[test]
    fn test_from_xml() {
        let node = XmlNode::parse(
            "<TEMPLATE><CPU>1</CPU><CONTEXT><NETWORK>YES</NETWORK><TOKEN>YES</TOKEN></CONTEXT><NIC><NETWORK>a</NETWORK></NIC><NIC><NETWORK>b</NETWORK></NIC></TEMPLATE>",
        )
        .unwrap();
        let t = Template::from_xml(&node);
        assert_eq!(t.get("CPU"), Some("1"));
        assert_eq!(t.vector("CONTEXT").unwrap().get("TOKEN"), Some("YES"));
        let nets: Vec<_> = t
            .vectors("NIC")
            .filter_map(|nic| nic.get("NETWORK"))
            .collect();
        assert_eq!(nets, vec!["a", "b"]);
        assert!(t.get("CONTEXT").is_none());
    }

    #[test]
    fn test_vector_outlives_lookup_key() {
        let mut t = Template::new();
        let mut context = Vector::new();
        context.add("NETWORK", "YES");
        t.add_vector("CONTEXT", context);

        let found = {
            let key = String::from("CONTEXT");
            t.vector(&key)
        };
        assert_eq!(found.and_then(|c| c.get("NETWORK")), Some("YES"));
        assert_eq!(t.vector("NIC"), None);
    }
}
