//! Per-call callbacks and the per-type `Strategy` capability.

use kstore_core::{FieldErrors, Object, ObjectList, RequestContext};

use crate::{Registry, RegistryError, RegistryResult};

/// `validate(ctx, new)` for create and delete.
pub type ValidateObjectFn<'a, T> = dyn Fn(&RequestContext, &T) -> Result<(), FieldErrors> + Send + Sync + 'a;

/// `validate(ctx, new, old)` for update.
pub type ValidateUpdateFn<'a, T> = dyn Fn(&RequestContext, &T, &T) -> Result<(), FieldErrors> + Send + Sync + 'a;

/// Produces the object to persist from the stored one (`None` on the create path).
pub type UpdateFn<'a, T> = dyn Fn(&RequestContext, Option<&T>) -> Result<T, RegistryError> + Send + Sync + 'a;

/// Hooks a resource type adapter implements once; the `*_with` verbs drive them.
pub trait Strategy<T>: Send + Sync {
    /// Fill server-owned fields before validation (uid, timestamps, defaults).
    fn prepare_for_create(&self, _ctx: &RequestContext, _obj: &mut T) {}

    /// Carry server-owned fields over from the stored object.
    fn prepare_for_update(&self, _ctx: &RequestContext, _new: &mut T, _old: &T) {}

    fn validate_create(&self, _ctx: &RequestContext, _obj: &T) -> Result<(), FieldErrors> {
        Ok(())
    }

    fn validate_update(&self, _ctx: &RequestContext, _new: &T, _old: &T) -> Result<(), FieldErrors> {
        Ok(())
    }

    fn validate_delete(&self, _ctx: &RequestContext, _obj: &T) -> Result<(), FieldErrors> {
        Ok(())
    }
}

impl<T, L> Registry<T, L>
where
    T: Object,
    L: ObjectList<T>,
{
    pub async fn create_with(&self, ctx: &RequestContext, mut obj: T, strategy: &dyn Strategy<T>) -> RegistryResult<T> {
        strategy.prepare_for_create(ctx, &mut obj);
        let validate = |c: &RequestContext, o: &T| strategy.validate_create(c, o);
        self.create(ctx, obj, Some(&validate)).await
    }

    /// Replace `name` with `obj`, creating it when `allow_create` is set.
    pub async fn replace_with(
        &self,
        ctx: &RequestContext,
        name: &str,
        obj: T,
        strategy: &dyn Strategy<T>,
        allow_create: bool,
    ) -> RegistryResult<(T, bool)> {
        let update = |c: &RequestContext, old: Option<&T>| {
            let mut next = obj.clone();
            match old {
                Some(old) => strategy.prepare_for_update(c, &mut next, old),
                None => strategy.prepare_for_create(c, &mut next),
            }
            Ok::<T, RegistryError>(next)
        };
        let validate_create = |c: &RequestContext, o: &T| strategy.validate_create(c, o);
        let validate_update = |c: &RequestContext, n: &T, o: &T| strategy.validate_update(c, n, o);
        self.update(ctx, name, &update, Some(&validate_create), Some(&validate_update), allow_create).await
    }

    pub async fn delete_with(&self, ctx: &RequestContext, name: &str, strategy: &dyn Strategy<T>) -> RegistryResult<(T, bool)> {
        let validate = |c: &RequestContext, o: &T| strategy.validate_delete(c, o);
        self.delete(ctx, name, Some(&validate)).await
    }

    pub async fn delete_collection_with(&self, ctx: &RequestContext, strategy: &dyn Strategy<T>) -> RegistryResult<L> {
        let validate = |c: &RequestContext, o: &T| strategy.validate_delete(c, o);
        self.delete_collection(ctx, Some(&validate)).await
    }
}
