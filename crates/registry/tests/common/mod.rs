#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kstore_core::{empty_list, GroupResource, JsonCodec};
use kstore_registry::{Registry, ResourceConfig};
use kstore_store::{Backend, MemoryStore};

pub type ConfigMaps = Registry<ConfigMap, k8s_openapi::List<ConfigMap>>;
pub type Namespaces = Registry<Namespace, Vec<Namespace>>;

pub fn configmaps_on(backend: Arc<dyn Backend>, watch_buffer: usize) -> ConfigMaps {
    let cfg = ResourceConfig::new(
        GroupResource::core("v1", "configmaps"),
        true,
        ConfigMap::default,
        empty_list::<ConfigMap>,
    )
    .with_watch_buffer(watch_buffer);
    Registry::new(cfg, Arc::new(JsonCodec::new()), backend)
}

pub fn configmaps() -> ConfigMaps {
    configmaps_on(Arc::new(MemoryStore::new()), kstore_registry::DEFAULT_WATCH_BUFFER)
}

pub fn namespaces() -> Namespaces {
    let cfg = ResourceConfig::new(GroupResource::core("v1", "namespaces"), false, Namespace::default, Vec::new);
    Registry::new(cfg, Arc::new(JsonCodec::new()), Arc::new(MemoryStore::new()))
}

pub fn cm(ns: Option<&str>, name: &str, value: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: ns.map(str::to_string),
            ..Default::default()
        },
        data: Some(BTreeMap::from([("value".to_string(), value.to_string())])),
        ..Default::default()
    }
}

pub fn ns(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta { name: Some(name.to_string()), ..Default::default() },
        ..Default::default()
    }
}

pub fn value_of(cm: &ConfigMap) -> &str {
    cm.data.as_ref().and_then(|d| d.get("value")).map(String::as_str).unwrap_or("")
}

pub fn name_of(cm: &ConfigMap) -> &str {
    cm.metadata.name.as_deref().unwrap_or("")
}
