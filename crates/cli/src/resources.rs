//! Served resource types and their create/update/delete strategies.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Result};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kstore_core::{FieldErrors, GroupResource, RequestContext};
use kstore_registry::Strategy;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind, Resource, TypeMeta};
use once_cell::sync::Lazy;
use regex::Regex;

static DNS1123_LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());
static DNS1123_SUBDOMAIN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").unwrap());
static DATA_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[-._a-zA-Z0-9]+$").unwrap());

/// What the user asked for on the command line.
#[derive(Debug, Clone)]
pub enum ResourceSpec {
    ConfigMaps,
    Secrets,
    Namespaces,
    Custom { ar: ApiResource, namespaced: bool },
}

fn builtin(name: &str) -> Option<ResourceSpec> {
    match name {
        "configmaps" | "configmap" | "cm" => Some(ResourceSpec::ConfigMaps),
        "secrets" | "secret" => Some(ResourceSpec::Secrets),
        "namespaces" | "namespace" | "ns" => Some(ResourceSpec::Namespaces),
        _ => None,
    }
}

fn parse_custom(name: &str) -> Result<GroupResource> {
    GroupResource::parse(name)
        .ok_or_else(|| anyhow!("unknown resource {name:?}; expected a built-in or group/version/plural"))
}

/// Storage identity only; enough for `migrate`, which never touches objects.
pub fn group_resource_of(name: &str) -> Result<GroupResource> {
    match builtin(name) {
        Some(spec) => Ok(spec.group_resource()),
        None => parse_custom(name),
    }
}

impl ResourceSpec {
    /// `configmaps`, `secrets`, `namespaces`, or `group/version/plural` with a kind.
    pub fn parse(name: &str, kind: Option<&str>, cluster_scoped: bool) -> Result<Self> {
        if let Some(spec) = builtin(name) {
            return Ok(spec);
        }
        let gr = parse_custom(name)?;
        let Some(kind) = kind.filter(|k| !k.is_empty()) else {
            bail!("custom resource {name} needs --kind");
        };
        let gvk = GroupVersionKind::gvk(&gr.group, &gr.version, kind);
        Ok(Self::Custom { ar: ApiResource::from_gvk_with_plural(&gvk, &gr.resource), namespaced: !cluster_scoped })
    }

    pub fn group_resource(&self) -> GroupResource {
        match self {
            Self::ConfigMaps => GroupResource::core("v1", "configmaps"),
            Self::Secrets => GroupResource::core("v1", "secrets"),
            Self::Namespaces => GroupResource::core("v1", "namespaces"),
            Self::Custom { ar, .. } => GroupResource::new(&ar.group, &ar.version, &ar.plural),
        }
    }

    pub fn namespaced(&self) -> bool {
        match self {
            Self::Namespaces => false,
            Self::Custom { namespaced, .. } => *namespaced,
            _ => true,
        }
    }
}

/// Stamp uid and creationTimestamp; default the namespace from the request.
fn stamp_create(ctx: &RequestContext, meta: &mut ObjectMeta, namespaced: bool) {
    meta.uid = Some(uuid::Uuid::new_v4().to_string());
    meta.creation_timestamp = Some(Time(chrono::Utc::now()));
    meta.resource_version = None;
    if namespaced {
        if meta.namespace.as_deref().map_or(true, str::is_empty) {
            meta.namespace = ctx.namespace().map(str::to_string);
        }
    } else {
        meta.namespace = None;
    }
}

/// Server-owned fields survive a replace.
fn carry_over(new: &mut ObjectMeta, old: &ObjectMeta, namespaced: bool) {
    new.uid = old.uid.clone();
    new.creation_timestamp = old.creation_timestamp.clone();
    if namespaced && new.namespace.as_deref().map_or(true, str::is_empty) {
        new.namespace = old.namespace.clone();
    }
}

fn check_name(errs: &mut FieldErrors, meta: &ObjectMeta, label_only: bool) {
    let Some(name) = meta.name.as_deref().filter(|n| !n.is_empty()) else {
        errs.push("metadata.name", "name is required");
        return;
    };
    if label_only {
        if name.len() > 63 || !DNS1123_LABEL.is_match(name) {
            errs.push("metadata.name", format!("{name:?} must be a DNS-1123 label"));
        }
    } else if name.len() > 253 || !DNS1123_SUBDOMAIN.is_match(name) {
        errs.push("metadata.name", format!("{name:?} must be a DNS-1123 subdomain"));
    }
}

fn check_keys<'a>(errs: &mut FieldErrors, field: &str, keys: impl Iterator<Item = &'a String>) {
    for key in keys {
        if key.len() > 253 || key == "." || key == ".." || !DATA_KEY.is_match(key) {
            errs.push(format!("{field}[{key}]"), "must consist of alphanumerics, '-', '_' or '.'");
        }
    }
}

fn check_overlap<A, B>(errs: &mut FieldErrors, field: &str, a: Option<&BTreeMap<String, A>>, b: Option<&BTreeMap<String, B>>) {
    if let (Some(a), Some(b)) = (a, b) {
        for key in a.keys().filter(|k| b.contains_key(*k)) {
            errs.push(format!("{field}[{key}]"), "duplicate key");
        }
    }
}

pub struct ConfigMapStrategy;

impl Strategy<ConfigMap> for ConfigMapStrategy {
    fn prepare_for_create(&self, ctx: &RequestContext, obj: &mut ConfigMap) {
        stamp_create(ctx, &mut obj.metadata, true);
    }

    fn prepare_for_update(&self, _ctx: &RequestContext, new: &mut ConfigMap, old: &ConfigMap) {
        carry_over(&mut new.metadata, &old.metadata, true);
    }

    fn validate_create(&self, _ctx: &RequestContext, obj: &ConfigMap) -> Result<(), FieldErrors> {
        let mut errs = FieldErrors::new();
        check_name(&mut errs, &obj.metadata, false);
        check_keys(&mut errs, "data", obj.data.iter().flat_map(|d| d.keys()));
        check_keys(&mut errs, "binaryData", obj.binary_data.iter().flat_map(|d| d.keys()));
        check_overlap(&mut errs, "data", obj.data.as_ref(), obj.binary_data.as_ref());
        errs.into_result()
    }

    fn validate_update(&self, ctx: &RequestContext, new: &ConfigMap, old: &ConfigMap) -> Result<(), FieldErrors> {
        let mut errs = match self.validate_create(ctx, new) {
            Ok(()) => FieldErrors::new(),
            Err(errs) => errs,
        };
        if old.immutable == Some(true) {
            if new.immutable != Some(true) {
                errs.push("immutable", "field is immutable when `immutable` is set");
            }
            if new.data != old.data || new.binary_data != old.binary_data {
                errs.push("data", "field is immutable when `immutable` is set");
            }
        }
        errs.into_result()
    }
}

pub struct SecretStrategy;

impl Strategy<Secret> for SecretStrategy {
    fn prepare_for_create(&self, ctx: &RequestContext, obj: &mut Secret) {
        stamp_create(ctx, &mut obj.metadata, true);
        if obj.type_.as_deref().map_or(true, str::is_empty) {
            obj.type_ = Some("Opaque".to_string());
        }
    }

    fn prepare_for_update(&self, _ctx: &RequestContext, new: &mut Secret, old: &Secret) {
        carry_over(&mut new.metadata, &old.metadata, true);
        if new.type_.as_deref().map_or(true, str::is_empty) {
            new.type_ = old.type_.clone();
        }
    }

    fn validate_create(&self, _ctx: &RequestContext, obj: &Secret) -> Result<(), FieldErrors> {
        let mut errs = FieldErrors::new();
        check_name(&mut errs, &obj.metadata, false);
        check_keys(&mut errs, "data", obj.data.iter().flat_map(|d| d.keys()));
        check_keys(&mut errs, "stringData", obj.string_data.iter().flat_map(|d| d.keys()));
        errs.into_result()
    }

    fn validate_update(&self, ctx: &RequestContext, new: &Secret, old: &Secret) -> Result<(), FieldErrors> {
        let mut errs = match self.validate_create(ctx, new) {
            Ok(()) => FieldErrors::new(),
            Err(errs) => errs,
        };
        if new.type_ != old.type_ {
            errs.push("type", "field is immutable");
        }
        if old.immutable == Some(true)
            && (new.immutable != Some(true) || new.data != old.data || new.string_data.is_some())
        {
            errs.push("data", "field is immutable when `immutable` is set");
        }
        errs.into_result()
    }
}

pub struct NamespaceStrategy;

impl Strategy<Namespace> for NamespaceStrategy {
    fn prepare_for_create(&self, ctx: &RequestContext, obj: &mut Namespace) {
        stamp_create(ctx, &mut obj.metadata, false);
    }

    fn prepare_for_update(&self, _ctx: &RequestContext, new: &mut Namespace, old: &Namespace) {
        carry_over(&mut new.metadata, &old.metadata, false);
    }

    fn validate_create(&self, _ctx: &RequestContext, obj: &Namespace) -> Result<(), FieldErrors> {
        let mut errs = FieldErrors::new();
        check_name(&mut errs, &obj.metadata, true);
        errs.into_result()
    }

    fn validate_update(&self, ctx: &RequestContext, new: &Namespace, _old: &Namespace) -> Result<(), FieldErrors> {
        self.validate_create(ctx, new)
    }
}

/// Custom resources: untyped bodies, identity checked against the served kind.
pub struct CustomResourceStrategy {
    pub ar: ApiResource,
    pub namespaced: bool,
}

impl CustomResourceStrategy {
    fn check_types(&self, errs: &mut FieldErrors, obj: &DynamicObject) {
        if let Some(types) = &obj.types {
            if types.api_version != self.ar.api_version {
                errs.push("apiVersion", format!("expected {}", self.ar.api_version));
            }
            if types.kind != self.ar.kind {
                errs.push("kind", format!("expected {}", self.ar.kind));
            }
        }
    }
}

impl Strategy<DynamicObject> for CustomResourceStrategy {
    fn prepare_for_create(&self, ctx: &RequestContext, obj: &mut DynamicObject) {
        stamp_create(ctx, obj.meta_mut(), self.namespaced);
        if obj.types.is_none() {
            obj.types = Some(TypeMeta { api_version: self.ar.api_version.clone(), kind: self.ar.kind.clone() });
        }
    }

    fn prepare_for_update(&self, _ctx: &RequestContext, new: &mut DynamicObject, old: &DynamicObject) {
        carry_over(&mut new.metadata, &old.metadata, self.namespaced);
        if new.types.is_none() {
            new.types = old.types.clone();
        }
    }

    fn validate_create(&self, _ctx: &RequestContext, obj: &DynamicObject) -> Result<(), FieldErrors> {
        let mut errs = FieldErrors::new();
        check_name(&mut errs, &obj.metadata, false);
        self.check_types(&mut errs, obj);
        errs.into_result()
    }

    fn validate_update(&self, ctx: &RequestContext, new: &DynamicObject, _old: &DynamicObject) -> Result<(), FieldErrors> {
        self.validate_create(ctx, new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;

    fn cm(name: &str, keys: &[&str]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta { name: Some(name.to_string()), ..Default::default() },
            data: Some(keys.iter().map(|k| (k.to_string(), "v".to_string())).collect()),
            ..Default::default()
        }
    }

    #[test]
    fn parses_builtin_and_custom_resources() {
        assert!(matches!(ResourceSpec::parse("configmaps", None, false).unwrap(), ResourceSpec::ConfigMaps));
        assert!(!ResourceSpec::parse("ns", None, false).unwrap().namespaced());

        let spec = ResourceSpec::parse("example.com/v1/widgets", Some("Widget"), false).unwrap();
        assert!(spec.namespaced());
        assert_eq!(spec.group_resource().to_string(), "widgets.example.com");
        match spec {
            ResourceSpec::Custom { ar, .. } => {
                assert_eq!(ar.api_version, "example.com/v1");
                assert_eq!(ar.kind, "Widget");
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(ResourceSpec::parse("example.com/v1/widgets", None, false).is_err());
        assert!(ResourceSpec::parse("pods", None, false).is_err());
        assert_eq!(group_resource_of("example.com/v1/widgets").unwrap().to_string(), "widgets.example.com");
        assert_eq!(group_resource_of("cm").unwrap().api_version(), "v1");
    }

    #[test]
    fn create_stamps_server_fields() {
        let ctx = RequestContext::namespaced("ns1");
        let mut obj = cm("a", &["k"]);
        ConfigMapStrategy.prepare_for_create(&ctx, &mut obj);
        assert!(obj.metadata.uid.is_some());
        assert!(obj.metadata.creation_timestamp.is_some());
        assert_eq!(obj.metadata.namespace.as_deref(), Some("ns1"));

        let mut next = cm("a", &["k2"]);
        ConfigMapStrategy.prepare_for_update(&ctx, &mut next, &obj);
        assert_eq!(next.metadata.uid, obj.metadata.uid);
        assert_eq!(next.metadata.creation_timestamp, obj.metadata.creation_timestamp);
    }

    #[test]
    fn rejects_bad_names_and_keys() {
        let ctx = RequestContext::namespaced("ns1");
        assert!(ConfigMapStrategy.validate_create(&ctx, &cm("good.name-1", &["a.b_c-d"])).is_ok());

        let errs = ConfigMapStrategy.validate_create(&ctx, &cm("Bad_Name", &["no/slash"])).unwrap_err();
        assert_eq!(errs.len(), 2);

        let mut both = cm("a", &["k"]);
        both.binary_data = Some(BTreeMap::from([("k".to_string(), ByteString(vec![1]))]));
        let errs = ConfigMapStrategy.validate_create(&ctx, &both).unwrap_err();
        assert!(errs.to_string().contains("duplicate key"));

        let ns = Namespace {
            metadata: ObjectMeta { name: Some("has.dot".into()), ..Default::default() },
            ..Default::default()
        };
        assert!(NamespaceStrategy.validate_create(&RequestContext::cluster(), &ns).is_err());
    }

    #[test]
    fn immutable_configmap_keeps_its_data() {
        let ctx = RequestContext::namespaced("ns1");
        let mut old = cm("a", &["k"]);
        old.immutable = Some(true);
        let mut new = cm("a", &["other"]);
        new.immutable = Some(true);
        assert!(ConfigMapStrategy.validate_update(&ctx, &new, &old).is_err());
        assert!(ConfigMapStrategy.validate_update(&ctx, &old.clone(), &old).is_ok());
    }

    #[test]
    fn secret_type_is_defaulted_and_immutable() {
        let ctx = RequestContext::namespaced("ns1");
        let mut s = Secret { metadata: ObjectMeta { name: Some("s".into()), ..Default::default() }, ..Default::default() };
        SecretStrategy.prepare_for_create(&ctx, &mut s);
        assert_eq!(s.type_.as_deref(), Some("Opaque"));

        let mut changed = s.clone();
        changed.type_ = Some("kubernetes.io/tls".into());
        assert!(SecretStrategy.validate_update(&ctx, &changed, &s).is_err());
    }

    #[test]
    fn custom_resources_get_their_types() {
        let ar = ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk("example.com", "v1", "Widget"), "widgets");
        let strategy = CustomResourceStrategy { ar: ar.clone(), namespaced: true };
        let ctx = RequestContext::namespaced("ns1");

        let mut w = DynamicObject { types: None, metadata: ObjectMeta { name: Some("w1".into()), ..Default::default() }, data: serde_json::json!({}) };
        strategy.prepare_for_create(&ctx, &mut w);
        assert_eq!(w.types.as_ref().map(|t| t.kind.as_str()), Some("Widget"));
        assert!(strategy.validate_create(&ctx, &w).is_ok());

        w.types = Some(TypeMeta { api_version: "example.com/v1".into(), kind: "Gadget".into() });
        assert!(strategy.validate_create(&ctx, &w).is_err());
    }
}
