//! kstore registry: the generic storage/REST engine.
//!
//! One [`Registry`] serves one resource type. It combines a [`Backend`], a
//! [`Codec`] and a watch fan-out into the Kubernetes verb set
//! (get/list/create/update/delete/deleteCollection/watch). Mutations and watch
//! registration run under one per-registry lock: a mutation reads, writes and
//! publishes before the next one starts, so events for one identity arrive in
//! the order they were applied and a watcher's replay joins the live stream
//! without a gap.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use kstore_core::{Codec, FieldErrors, GroupResource, Object, ObjectKey, ObjectList, RequestContext, WatchEvent};
use kstore_store::{Backend, StoreError};
use metrics::{counter, histogram};
use tokio::sync::Mutex;
use tracing::{debug, info};

mod error;
pub mod strategy;
pub mod watch;

pub use error::{RegistryError, RegistryResult};
pub use strategy::{Strategy, UpdateFn, ValidateObjectFn, ValidateUpdateFn};
pub use watch::{TryRecvError, Watcher};

use watch::Watchers;

/// Pending events a watcher may hold before it is evicted.
pub const DEFAULT_WATCH_BUFFER: usize = 10;

/// Explicit per-resource-type wiring: identity, scope and constructors.
pub struct ResourceConfig<T, L> {
    pub resource: GroupResource,
    pub namespaced: bool,
    pub new_object: Arc<dyn Fn() -> T + Send + Sync>,
    pub new_list: Arc<dyn Fn() -> L + Send + Sync>,
    pub watch_buffer: usize,
}

impl<T, L> ResourceConfig<T, L> {
    pub fn new(
        resource: GroupResource,
        namespaced: bool,
        new_object: impl Fn() -> T + Send + Sync + 'static,
        new_list: impl Fn() -> L + Send + Sync + 'static,
    ) -> Self {
        Self {
            resource,
            namespaced,
            new_object: Arc::new(new_object),
            new_list: Arc::new(new_list),
            watch_buffer: DEFAULT_WATCH_BUFFER,
        }
    }

    pub fn with_watch_buffer(mut self, watch_buffer: usize) -> Self {
        self.watch_buffer = watch_buffer;
        self
    }
}

pub struct Registry<T, L> {
    config: ResourceConfig<T, L>,
    /// `configmaps`, `widgets.example.com`: used in errors, logs and metric labels.
    label: String,
    codec: Arc<dyn Codec<T>>,
    backend: Arc<dyn Backend>,
    watchers: Watchers<T>,
    /// Serializes mutations and watch registration. Never held by `get`/`list`.
    mutations: Mutex<()>,
}

impl<T, L> Registry<T, L>
where
    T: Object,
    L: ObjectList<T>,
{
    pub fn new(config: ResourceConfig<T, L>, codec: Arc<dyn Codec<T>>, backend: Arc<dyn Backend>) -> Self {
        let label = config.resource.to_string();
        let watchers = Watchers::new(label.clone(), config.watch_buffer);
        info!(resource = %label, namespaced = config.namespaced, backend = backend.backend_name(), "registry ready");
        Self { config, label, codec, backend, watchers, mutations: Mutex::new(()) }
    }

    pub fn new_object(&self) -> T { (self.config.new_object)() }
    pub fn new_list(&self) -> L { (self.config.new_list)() }
    pub fn namespace_scoped(&self) -> bool { self.config.namespaced }
    pub fn resource(&self) -> &GroupResource { &self.config.resource }
    pub fn backend_name(&self) -> &'static str { self.backend.backend_name() }
    pub fn watcher_count(&self) -> usize { self.watchers.len() }

    /// Prepare the backend schema. Idempotent.
    pub async fn migrate(&self) -> RegistryResult<()> {
        self.backend.migrate().await.map_err(|e| RegistryError::Storage {
            op: "migrate",
            resource: self.label.clone(),
            key: String::new(),
            source: e,
        })
    }

    pub async fn get(&self, ctx: &RequestContext, name: &str) -> RegistryResult<T> {
        let started = Instant::now();
        let res = self.get_inner(ctx, name).await;
        self.observe("get", started, res.is_ok());
        res
    }

    /// Every stored object, restricted to the context namespace for namespaced
    /// types when one is given. Any item that fails to decode fails the call.
    pub async fn list(&self, ctx: &RequestContext) -> RegistryResult<L> {
        let started = Instant::now();
        let res = self.list_inner(ctx).await;
        self.observe("list", started, res.is_ok());
        res
    }

    /// Store `obj` under its own name. The returned object is the one passed in.
    pub async fn create(
        &self,
        ctx: &RequestContext,
        obj: T,
        validate: Option<&ValidateObjectFn<'_, T>>,
    ) -> RegistryResult<T> {
        let started = Instant::now();
        let res = self.create_inner(ctx, obj, validate).await;
        self.observe("create", started, res.is_ok());
        res
    }

    /// Read-modify-write `name`. `update` always runs, with `None` on the create
    /// path. Returns the stored object and whether it was created. The callbacks
    /// run under the mutation lock and must not call back into this registry.
    pub async fn update(
        &self,
        ctx: &RequestContext,
        name: &str,
        update: &UpdateFn<'_, T>,
        create_validate: Option<&ValidateObjectFn<'_, T>>,
        update_validate: Option<&ValidateUpdateFn<'_, T>>,
        force_allow_create: bool,
    ) -> RegistryResult<(T, bool)> {
        let started = Instant::now();
        let res = self
            .update_inner(ctx, name, update, create_validate, update_validate, force_allow_create)
            .await;
        self.observe("update", started, res.is_ok());
        res
    }

    /// Returns the deleted object and whether deletion was immediate (always true).
    pub async fn delete(
        &self,
        ctx: &RequestContext,
        name: &str,
        validate: Option<&ValidateObjectFn<'_, T>>,
    ) -> RegistryResult<(T, bool)> {
        let started = Instant::now();
        let res = self.delete_inner(ctx, name, validate).await;
        self.observe("delete", started, res.is_ok());
        res
    }

    /// Delete every object in scope. Stops at the first failure; items deleted
    /// before it stay deleted.
    pub async fn delete_collection(
        &self,
        ctx: &RequestContext,
        validate: Option<&ValidateObjectFn<'_, T>>,
    ) -> RegistryResult<L> {
        let started = Instant::now();
        let res = self.delete_collection_inner(ctx, validate).await;
        self.observe("deletecollection", started, res.is_ok());
        res
    }

    /// Open a watch. Current objects in scope are queued as ADDED events, then
    /// the watcher is registered for live events. Mutations wait for both steps.
    pub async fn watch(&self, ctx: &RequestContext) -> RegistryResult<Watcher<T>> {
        let started = Instant::now();
        let guard = self.mutations.lock().await;
        let res = self.list_inner(ctx).await.map(|current| {
            let scope = self.scope(ctx).map(str::to_owned);
            self.watchers.register(scope, current.items().to_vec())
        });
        drop(guard);
        self.observe("watch", started, res.is_ok());
        res
    }

    async fn get_inner(&self, ctx: &RequestContext, name: &str) -> RegistryResult<T> {
        let key = self.key_for(ctx, name)?;
        let data = self.backend.read(&key).await.map_err(|e| self.store_err("read", &key, e))?;
        self.decode(&key.to_string(), &data)
    }

    async fn list_inner(&self, ctx: &RequestContext) -> RegistryResult<L> {
        let records: Vec<(String, Vec<u8>)> = match self.scope(ctx) {
            None => self
                .backend
                .list()
                .await
                .map_err(|e| self.store_err("list", &ObjectKey::cluster(""), e))?
                .into_iter()
                .map(|data| (String::new(), data))
                .collect(),
            Some(ns) => self
                .backend
                .list_with_keys()
                .await
                .map_err(|e| self.store_err("list", &ObjectKey::namespaced(ns, ""), e))?
                .into_iter()
                .filter(|(key, _)| key.namespace.as_deref() == Some(ns))
                .map(|(key, data)| (key.to_string(), data))
                .collect(),
        };
        let mut list = self.new_list();
        for (key, data) in records {
            let obj = self.decode(&key, &data)?;
            list.try_push(obj).map_err(|source| RegistryError::Conversion { resource: self.label.clone(), source })?;
        }
        debug!(resource = %self.label, count = list.len(), "listed");
        Ok(list)
    }

    async fn create_inner(
        &self,
        ctx: &RequestContext,
        obj: T,
        validate: Option<&ValidateObjectFn<'_, T>>,
    ) -> RegistryResult<T> {
        if let Some(validate) = validate {
            validate(ctx, &obj).map_err(|errors| self.invalid(obj.name(), errors))?;
        }
        let key = self.key_for_object(ctx, &obj)?;
        let data = self.encode(&key, &obj)?;
        let _guard = self.mutations.lock().await;
        self.backend.insert(&key, &data).await.map_err(|e| self.store_err("insert", &key, e))?;
        self.watchers.notify(key.namespace.as_deref(), WatchEvent::added(obj.clone()));
        debug!(resource = %self.label, key = %key, "created");
        Ok(obj)
    }

    async fn update_inner(
        &self,
        ctx: &RequestContext,
        name: &str,
        update: &UpdateFn<'_, T>,
        create_validate: Option<&ValidateObjectFn<'_, T>>,
        update_validate: Option<&ValidateUpdateFn<'_, T>>,
        force_allow_create: bool,
    ) -> RegistryResult<(T, bool)> {
        let key = self.key_for(ctx, name)?;
        let _guard = self.mutations.lock().await;
        let old = match self.backend.read(&key).await {
            Ok(data) => Some(self.decode(&key.to_string(), &data)?),
            Err(StoreError::NotFound(_)) if force_allow_create => None,
            Err(e) => return Err(self.store_err("read", &key, e)),
        };

        let obj = update(ctx, old.as_ref())?;
        self.check_identity(&key, &obj)?;

        match old {
            None => {
                if let Some(validate) = create_validate {
                    validate(ctx, &obj).map_err(|errors| self.invalid(name, errors))?;
                }
                let data = self.encode(&key, &obj)?;
                self.backend.insert(&key, &data).await.map_err(|e| self.store_err("insert", &key, e))?;
                self.watchers.notify(key.namespace.as_deref(), WatchEvent::added(obj.clone()));
                debug!(resource = %self.label, key = %key, "created via update");
                Ok((obj, true))
            }
            Some(old) => {
                if let Some(validate) = update_validate {
                    validate(ctx, &obj, &old).map_err(|errors| self.invalid(name, errors))?;
                }
                let data = self.encode(&key, &obj)?;
                // Conditional: a record deleted by another writer of the same table stays deleted.
                self.backend.replace(&key, &data).await.map_err(|e| self.store_err("replace", &key, e))?;
                self.watchers.notify(key.namespace.as_deref(), WatchEvent::modified(obj.clone()));
                debug!(resource = %self.label, key = %key, "updated");
                Ok((obj, false))
            }
        }
    }

    async fn delete_inner(
        &self,
        ctx: &RequestContext,
        name: &str,
        validate: Option<&ValidateObjectFn<'_, T>>,
    ) -> RegistryResult<(T, bool)> {
        let key = self.key_for(ctx, name)?;
        let _guard = self.mutations.lock().await;
        let data = self.backend.read(&key).await.map_err(|e| self.store_err("read", &key, e))?;
        let old = self.decode(&key.to_string(), &data)?;
        if let Some(validate) = validate {
            validate(ctx, &old).map_err(|errors| self.invalid(name, errors))?;
        }
        self.backend.delete(&key).await.map_err(|e| self.store_err("delete", &key, e))?;
        self.watchers.notify(key.namespace.as_deref(), WatchEvent::deleted(old.clone()));
        debug!(resource = %self.label, key = %key, "deleted");
        Ok((old, true))
    }

    async fn delete_collection_inner(
        &self,
        ctx: &RequestContext,
        validate: Option<&ValidateObjectFn<'_, T>>,
    ) -> RegistryResult<L> {
        let scope = self.scope(ctx);
        let _guard = self.mutations.lock().await;
        let records = self
            .backend
            .list_with_keys()
            .await
            .map_err(|e| self.store_err("list", &ObjectKey::cluster(""), e))?;
        let mut out = self.new_list();
        for (key, data) in records {
            if scope.is_some() && key.namespace.as_deref() != scope {
                continue;
            }
            let obj = self.decode(&key.to_string(), &data)?;
            if let Some(validate) = validate {
                validate(ctx, &obj).map_err(|errors| self.invalid(&key.name, errors))?;
            }
            match self.backend.delete(&key).await {
                Ok(()) => {}
                // Removed by another writer of the same table; it published the event.
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(self.store_err("delete", &key, e)),
            }
            self.watchers.notify(key.namespace.as_deref(), WatchEvent::deleted(obj.clone()));
            out.try_push(obj).map_err(|source| RegistryError::Conversion { resource: self.label.clone(), source })?;
        }
        debug!(resource = %self.label, count = out.len(), "deleted collection");
        Ok(out)
    }

    /// Namespace filter for collection verbs.
    fn scope<'a>(&self, ctx: &'a RequestContext) -> Option<&'a str> {
        if self.config.namespaced { ctx.namespace() } else { None }
    }

    /// Storage key for `name`. `/` separates namespace from name in rendered
    /// keys, so neither part may contain one.
    fn key_for(&self, ctx: &RequestContext, name: &str) -> RegistryResult<ObjectKey> {
        let key = if !self.config.namespaced {
            ObjectKey::cluster(name)
        } else {
            match ctx.namespace() {
                Some(ns) => ObjectKey::namespaced(ns, name),
                None => return Err(RegistryError::NamespaceNotFound { resource: self.label.clone() }),
            }
        };
        let mut errors = FieldErrors::new();
        if key.name.contains('/') {
            errors.push("metadata.name", "may not contain '/'");
        }
        if key.namespace.as_deref().is_some_and(|ns| ns.contains('/')) {
            errors.push("metadata.namespace", "may not contain '/'");
        }
        errors.into_result().map_err(|errors| self.invalid(&key.to_string(), errors))?;
        Ok(key)
    }

    fn key_for_object(&self, ctx: &RequestContext, obj: &T) -> RegistryResult<ObjectKey> {
        let key = self.key_for(ctx, obj.name())?;
        self.check_identity(&key, obj)?;
        Ok(key)
    }

    /// The object must carry the name it is stored under, and may not name a
    /// different namespace than the request.
    fn check_identity(&self, key: &ObjectKey, obj: &T) -> RegistryResult<()> {
        let mut errors = FieldErrors::new();
        if obj.name().is_empty() {
            errors.push("metadata.name", "name is required");
        } else if obj.name() != key.name {
            errors.push("metadata.name", format!("does not match the name in the request ({})", key.name));
        }
        if let (Some(want), Some(got)) = (key.namespace.as_deref(), obj.namespace()) {
            if want != got {
                errors.push("metadata.namespace", format!("does not match the namespace of the request ({})", want));
            }
        }
        errors.into_result().map_err(|errors| self.invalid(&key.to_string(), errors))
    }

    fn encode(&self, key: &ObjectKey, obj: &T) -> RegistryResult<Vec<u8>> {
        self.codec.encode(obj).map_err(|source| RegistryError::Encode {
            resource: self.label.clone(),
            key: key.to_string(),
            source,
        })
    }

    fn decode(&self, key: &str, data: &[u8]) -> RegistryResult<T> {
        self.codec.decode(data).map_err(|source| RegistryError::Decode {
            resource: self.label.clone(),
            key: key.to_string(),
            source,
        })
    }

    fn invalid(&self, key: &str, errors: FieldErrors) -> RegistryError {
        RegistryError::Invalid { resource: self.label.clone(), key: key.to_string(), errors }
    }

    fn store_err(&self, op: &'static str, key: &ObjectKey, err: StoreError) -> RegistryError {
        let resource = self.label.clone();
        let key = key.to_string();
        match err {
            StoreError::NotFound(_) => RegistryError::NotFound { resource, key },
            StoreError::AlreadyExists(_) => RegistryError::AlreadyExists { resource, key },
            source => RegistryError::Storage { op, resource, key, source },
        }
    }

    fn observe(&self, verb: &'static str, started: Instant, ok: bool) {
        let outcome = if ok { "ok" } else { "error" };
        counter!("registry_requests_total", 1, "resource" => self.label.clone(), "verb" => verb, "outcome" => outcome);
        histogram!("registry_request_ms", started.elapsed().as_secs_f64() * 1000.0, "resource" => self.label.clone(), "verb" => verb);
    }
}
