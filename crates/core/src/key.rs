//! Tenant-scoped object keys and the queue token codec.
//!
//! Token format: `<tenant>|<namespace>/<name>` for namespaced objects and
//! `<tenant>|<name>` for cluster-scoped ones.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::MalformedKeyError;

const TENANT_SEP: char = '|';
const NAMESPACE_SEP: char = '/';

/// Isolation boundary under which object names are unique (a logical cluster).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Result<Self, MalformedKeyError> {
        let id = id.into();
        if id.is_empty() {
            return Err(MalformedKeyError::new(id, "empty tenant"));
        }
        if id.contains(TENANT_SEP) {
            return Err(MalformedKeyError::new(id, "tenant contains '|'"));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// Identity of a tenant-scoped object. Immutable value type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub tenant: TenantId,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    /// Build a validated key. Names and namespaces must be non-empty and free of `/`.
    pub fn new(tenant: TenantId, namespace: Option<String>, name: impl Into<String>) -> Result<Self, MalformedKeyError> {
        let name = name.into();
        check_segment(&name, "name")?;
        if let Some(ns) = namespace.as_deref() {
            check_segment(ns, "namespace")?;
        }
        Ok(Self { tenant, namespace, name })
    }

    pub fn cluster_scoped(tenant: TenantId, name: impl Into<String>) -> Result<Self, MalformedKeyError> {
        Self::new(tenant, None, name)
    }

    /// Encode into the opaque queue token. Equal keys always yield identical tokens.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(
            self.tenant.as_str().len() + self.namespace.as_ref().map_or(0, |n| n.len() + 1) + self.name.len() + 1,
        );
        out.push_str(self.tenant.as_str());
        out.push(TENANT_SEP);
        if let Some(ns) = &self.namespace {
            out.push_str(ns);
            out.push(NAMESPACE_SEP);
        }
        out.push_str(&self.name);
        out
    }

    /// Decode a token produced by [`ObjectKey::encode`].
    pub fn decode(token: &str) -> Result<Self, MalformedKeyError> {
        let (tenant, rest) = token
            .split_once(TENANT_SEP)
            .ok_or_else(|| MalformedKeyError::new(token, "missing tenant separator"))?;
        let tenant = TenantId::new(tenant).map_err(|e| MalformedKeyError::new(token, e.reason))?;
        let (namespace, name) = match rest.split_once(NAMESPACE_SEP) {
            Some((ns, name)) => (Some(ns.to_string()), name),
            None => (None, rest),
        };
        Self::new(tenant, namespace, name).map_err(|e| MalformedKeyError::new(token, e.reason))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.encode()) }
}

fn check_segment(s: &str, what: &'static str) -> Result<(), MalformedKeyError> {
    if s.is_empty() {
        return Err(MalformedKeyError::new(s, if what == "name" { "empty name" } else { "empty namespace" }));
    }
    if s.contains(NAMESPACE_SEP) || s.contains(TENANT_SEP) {
        return Err(MalformedKeyError::new(s, if what == "name" { "name contains a separator" } else { "namespace contains a separator" }));
    }
    Ok(())
}

/// Anything that can be addressed by an [`ObjectKey`].
pub trait Keyed {
    fn object_key(&self) -> ObjectKey;
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn t(s: &str) -> TenantId { TenantId::new(s).unwrap() }

    #[test]
    fn round_trips_cluster_and_namespaced_keys() {
        let keys = [
            ObjectKey::cluster_scoped(t("root:org:ws"), "binding-a").unwrap(),
            ObjectKey::new(t("2x8hs1"), Some("default".into()), "cm").unwrap(),
            ObjectKey::new(t("a"), None, "b.c-d").unwrap(),
        ];
        for k in keys {
            assert_eq!(ObjectKey::decode(&k.encode()).unwrap(), k);
        }
    }

    fn arb_key() -> impl Strategy<Value = ObjectKey> {
        ("[a-z0-9:]{1,12}", proptest::option::of("[a-z0-9.-]{1,16}"), "[a-z0-9.-]{1,16}").prop_map(|(tenant, ns, name)| {
            ObjectKey::new(TenantId::new(tenant).unwrap(), ns, name).unwrap()
        })
    }

    proptest! {
        #[test]
        fn any_valid_key_round_trips(k in arb_key()) {
            prop_assert_eq!(ObjectKey::decode(&k.encode()).unwrap(), k);
        }

        #[test]
        fn distinct_keys_encode_to_distinct_tokens(a in arb_key(), b in arb_key()) {
            prop_assert_eq!(a == b, a.encode() == b.encode());
        }
    }

    #[test]
    fn encodes_expected_wire_format() {
        let k = ObjectKey::new(t("t1"), Some("ns".into()), "x").unwrap();
        assert_eq!(k.encode(), "t1|ns/x");
        let k = ObjectKey::cluster_scoped(t("t1"), "x").unwrap();
        assert_eq!(k.encode(), "t1|x");
    }

    #[test]
    fn namespace_changes_token() {
        let a = ObjectKey::new(t("t1"), Some("ns".into()), "x").unwrap();
        let b = ObjectKey::cluster_scoped(t("t1"), "x").unwrap();
        assert_ne!(a.encode(), b.encode());
    }

    #[test]
    fn rejects_malformed_tokens() {
        for bad in ["", "no-separator", "|name", "t1|", "t1|ns/", "t1|/name", "t1|a/b/c", "t1|a|b"] {
            let err = ObjectKey::decode(bad).unwrap_err();
            assert_eq!(err.key, bad, "error should carry the offending token");
        }
    }

    #[test]
    fn rejects_invalid_parts_on_construction() {
        assert!(TenantId::new("").is_err());
        assert!(TenantId::new("a|b").is_err());
        assert!(ObjectKey::cluster_scoped(t("a"), "").is_err());
        assert!(ObjectKey::new(t("a"), Some("x/y".into()), "n").is_err());
    }
}
