//! kstore core types: resource identity, request context, watch events and the
//! capabilities every served resource type plugs into the registry with.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod codec;
pub mod list;

pub use codec::{Codec, CodecError, JsonCodec};
pub use list::{empty_list, ConversionError, DynamicList, ObjectList};

pub mod prelude {
    pub use super::{
        Codec, EventType, FieldError, FieldErrors, GroupResource, JsonCodec, Object, ObjectKey,
        ObjectList, RequestContext, WatchEvent,
    };
}

/// Group/version/resource triple identifying one served resource type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct GroupResource {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl GroupResource {
    pub fn new(group: impl Into<String>, version: impl Into<String>, resource: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), resource: resource.into() }
    }

    /// Core ("") group resource, e.g. `v1/configmaps`.
    pub fn core(version: impl Into<String>, resource: impl Into<String>) -> Self {
        Self::new("", version, resource)
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Parse `v1/plural` or `group/v1/plural`.
    pub fn parse(key: &str) -> Option<Self> {
        let parts: Vec<&str> = key.split('/').collect();
        match parts.as_slice() {
            [version, resource] if !version.is_empty() && !resource.is_empty() => {
                Some(Self::core(*version, *resource))
            }
            [group, version, resource]
                if !group.is_empty() && !version.is_empty() && !resource.is_empty() =>
            {
                Some(Self::new(*group, *version, *resource))
            }
            _ => None,
        }
    }
}

impl fmt::Display for GroupResource {
    /// Kubernetes short form: `configmaps` or `widgets.example.com`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            f.write_str(&self.resource)
        } else {
            write!(f, "{}.{}", self.resource, self.group)
        }
    }
}

/// `(namespace, name)` identity of a stored record. `namespace` is `None` for
/// cluster-scoped resource types.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: Some(namespace.into()), name: name.into() }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self { namespace: None, name: name.into() }
    }

    /// Inverse of the `Display` rendering. Object names never contain `/`, so
    /// the first separator splits namespace from name.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('/') {
            Some((ns, name)) => Self::namespaced(ns, name),
            None => Self::cluster(raw),
        }
    }

    pub fn namespace_str(&self) -> &str {
        self.namespace.as_deref().unwrap_or("")
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Per-request context supplied by the caller (HTTP layer or CLI).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    namespace: Option<String>,
}

impl RequestContext {
    /// Context without a namespace: cluster-scoped requests and all-namespace lists.
    pub fn cluster() -> Self {
        Self { namespace: None }
    }

    pub fn namespaced(namespace: impl Into<String>) -> Self {
        Self { namespace: Some(namespace.into()) }
    }

    pub fn with_namespace(namespace: Option<String>) -> Self {
        Self { namespace }
    }

    /// The request namespace; an empty string counts as absent.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref().filter(|ns| !ns.is_empty())
    }
}

/// Anything the registry can store: must expose its own name and namespace.
pub trait Object: Clone + Send + Sync + 'static {
    fn name(&self) -> &str;
    fn namespace(&self) -> Option<&str>;
}

impl<K> Object for K
where
    K: kube::core::Resource + Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or("")
    }

    fn namespace(&self) -> Option<&str> {
        self.meta().namespace.as_deref().filter(|ns| !ns.is_empty())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventType::Added => "ADDED",
            EventType::Modified => "MODIFIED",
            EventType::Deleted => "DELETED",
        })
    }
}

/// Change notification delivered to watchers; serializes like a Kubernetes watch event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchEvent<T> {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub object: T,
}

impl<T> WatchEvent<T> {
    pub fn added(object: T) -> Self { Self { kind: EventType::Added, object } }
    pub fn modified(object: T) -> Self { Self { kind: EventType::Modified, object } }
    pub fn deleted(object: T) -> Self { Self { kind: EventType::Deleted, object } }
}

/// One failed field check, e.g. `metadata.name: must be a DNS-1123 label`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validation failures reported by a validation callback.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldErrors(pub SmallVec<[FieldError; 2]>);

impl FieldErrors {
    pub fn new() -> Self { Self::default() }

    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errs = Self::new();
        errs.push(field, message);
        errs
    }

    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.push(FieldError { field: field.into(), message: message.into() });
    }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn iter(&self) -> impl Iterator<Item = &FieldError> { self.0.iter() }

    /// `Ok(())` when nothing was recorded.
    pub fn into_result(self) -> Result<(), FieldErrors> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", e)?;
        }
        Ok(())
    }
}

impl std::error::Error for FieldErrors {}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn key_renders_and_parses() {
        let k = ObjectKey::namespaced("ns1", "a");
        assert_eq!(k.to_string(), "ns1/a");
        assert_eq!(ObjectKey::parse("ns1/a"), k);
        let c = ObjectKey::cluster("kube-system");
        assert_eq!(c.to_string(), "kube-system");
        assert_eq!(ObjectKey::parse("kube-system"), c);
        assert_eq!(c.namespace_str(), "");
    }

    #[test]
    fn group_resource_forms() {
        let gr = GroupResource::parse("example.com/v1alpha1/widgets").unwrap();
        assert_eq!(gr.to_string(), "widgets.example.com");
        assert_eq!(gr.api_version(), "example.com/v1alpha1");
        let core = GroupResource::parse("v1/configmaps").unwrap();
        assert_eq!(core.to_string(), "configmaps");
        assert_eq!(core.api_version(), "v1");
        assert!(GroupResource::parse("configmaps").is_none());
        assert!(GroupResource::parse("a//b").is_none());
    }

    #[test]
    fn empty_context_namespace_is_absent() {
        assert_eq!(RequestContext::namespaced("").namespace(), None);
        assert_eq!(RequestContext::namespaced("ns").namespace(), Some("ns"));
        assert_eq!(RequestContext::cluster().namespace(), None);
    }

    #[test]
    fn object_identity_from_metadata() {
        let cm = ConfigMap {
            metadata: ObjectMeta { name: Some("a".into()), namespace: Some("ns1".into()), ..Default::default() },
            ..Default::default()
        };
        assert_eq!(Object::name(&cm), "a");
        assert_eq!(Object::namespace(&cm), Some("ns1"));
        let ns = Namespace::default();
        assert_eq!(Object::name(&ns), "");
        assert_eq!(Object::namespace(&ns), None);
    }

    #[test]
    fn watch_event_wire_shape() {
        let ev = WatchEvent::added(serde_json::json!({"k": 1}));
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "ADDED");
        assert_eq!(v["object"]["k"], 1);
    }

    #[test]
    fn field_errors_display_and_result() {
        assert!(FieldErrors::new().into_result().is_ok());
        let mut errs = FieldErrors::single("metadata.name", "required");
        errs.push("data", "bad key");
        assert_eq!(errs.to_string(), "metadata.name: required, data: bad key");
        assert_eq!(errs.into_result().unwrap_err().len(), 2);
    }
}
