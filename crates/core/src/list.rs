//! Typed list containers the registry materializes `list` results into.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ListMeta;
use kube::core::{ApiResource, DynamicObject};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("cannot append {found} to a list of {expected}")]
pub struct ConversionError {
    pub expected: String,
    pub found: String,
}

/// A list container with an appendable items collection.
pub trait ObjectList<T>: Send + 'static {
    /// Append one decoded item; containers that constrain their items reject mismatches.
    fn try_push(&mut self, item: T) -> Result<(), ConversionError>;
    fn items(&self) -> &[T];

    fn len(&self) -> usize { self.items().len() }
    fn is_empty(&self) -> bool { self.items().is_empty() }
}

impl<T: Send + 'static> ObjectList<T> for Vec<T> {
    fn try_push(&mut self, item: T) -> Result<(), ConversionError> {
        self.push(item);
        Ok(())
    }

    fn items(&self) -> &[T] { self }
}

impl<K> ObjectList<K> for k8s_openapi::List<K>
where
    K: k8s_openapi::ListableResource + Send + 'static,
{
    fn try_push(&mut self, item: K) -> Result<(), ConversionError> {
        self.items.push(item);
        Ok(())
    }

    fn items(&self) -> &[K] { &self.items }
}

/// Empty `k8s_openapi::List` for a built-in type.
pub fn empty_list<K: k8s_openapi::ListableResource>() -> k8s_openapi::List<K> {
    k8s_openapi::List { items: Vec::new(), metadata: ListMeta::default() }
}

/// List of custom resources. Items must carry the list's apiVersion and kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicList {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ListMeta,
    pub items: Vec<DynamicObject>,
    #[serde(skip)]
    item_kind: String,
}

impl DynamicList {
    pub fn new(ar: &ApiResource) -> Self {
        Self {
            api_version: ar.api_version.clone(),
            kind: format!("{}List", ar.kind),
            metadata: ListMeta::default(),
            items: Vec::new(),
            item_kind: ar.kind.clone(),
        }
    }

    pub fn item_kind(&self) -> &str { &self.item_kind }
}

impl ObjectList<DynamicObject> for DynamicList {
    fn try_push(&mut self, item: DynamicObject) -> Result<(), ConversionError> {
        // Untyped items are accepted; typed ones must match the list.
        if let Some(types) = &item.types {
            if types.api_version != self.api_version || types.kind != self.item_kind {
                return Err(ConversionError {
                    expected: format!("{}/{}", self.api_version, self.item_kind),
                    found: format!("{}/{}", types.api_version, types.kind),
                });
            }
        }
        self.items.push(item);
        Ok(())
    }

    fn items(&self) -> &[DynamicObject] { &self.items }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Secret;
    use kube::core::{GroupVersionKind, TypeMeta};

    fn widgets() -> ApiResource {
        ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk("example.com", "v1", "Widget"), "widgets")
    }

    #[test]
    fn dynamic_list_rejects_other_kinds() {
        let ar = widgets();
        let mut list = DynamicList::new(&ar);
        assert_eq!(list.kind, "WidgetList");
        list.try_push(DynamicObject::new("w1", &ar)).unwrap();

        let mut gadget = DynamicObject::new("g1", &ar);
        gadget.types = Some(TypeMeta { api_version: "example.com/v1".into(), kind: "Gadget".into() });
        let err = list.try_push(gadget).unwrap_err();
        assert_eq!(err.expected, "example.com/v1/Widget");
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn k8s_list_appends() {
        let mut list = empty_list::<Secret>();
        assert!(ObjectList::is_empty(&list));
        list.try_push(Secret::default()).unwrap();
        assert_eq!(ObjectList::len(&list), 1);
    }
}
