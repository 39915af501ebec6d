// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Cached resource nodes and their identity types.
//!
//! A [`Resource`] is the cache's view of a single cluster object: identity,
//! version, owner links, and an optional opaque payload. Owner references are
//! the basis for hierarchy traversal; two synthetic-ownership corrections are
//! applied when constructing owner links from a raw object (see
//! [`effective_owner_refs`]).

use std::any::Any;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use serde::{Deserialize, Serialize};

const ENDPOINTS_KIND: &str = "Endpoints";
const SECRET_KIND: &str = "Secret";
const SERVICE_KIND: &str = "Service";
const SERVICE_ACCOUNT_KIND: &str = "ServiceAccount";

const CRD_GROUP: &str = "apiextensions.k8s.io";
const CRD_KIND: &str = "CustomResourceDefinition";

const SERVICE_ACCOUNT_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";
const SERVICE_ACCOUNT_UID_ANNOTATION: &str = "kubernetes.io/service-account.uid";
const SERVICE_ACCOUNT_NAME_ANNOTATION: &str = "kubernetes.io/service-account.name";

/// A kind of cluster object, identified by API group and kind name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl GroupKind {
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
        }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            f.write_str(&self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

/// Unique identity of a cached object.
///
/// Totally ordered by lexicographic comparison of the `Display` form
/// `group/kind/namespace/name`; cluster-scoped objects use an empty
/// namespace component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(
        group: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn group_kind(&self) -> GroupKind {
        GroupKind::new(self.group.clone(), self.kind.clone())
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.group, self.kind, self.namespace, self.name
        )
    }
}

impl Ord for ResourceKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

impl PartialOrd for ResourceKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Full reference to a cluster object, including its API version and uid.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResourceRef {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl ResourceRef {
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

/// One cached cluster object.
#[derive(Clone)]
pub struct Resource {
    /// Opaque version token supplied by the server.
    pub resource_version: String,
    /// Identity of the object, including uid and API version.
    pub object_ref: ResourceRef,
    /// Owner links, after synthetic-ownership corrections.
    pub owner_refs: Vec<OwnerReference>,
    /// Opaque payload computed by the populate callback, if any.
    pub info: Option<Arc<dyn Any + Send + Sync>>,
    /// The full object, retained only when the populate callback asked for it.
    pub manifest: Option<DynamicObject>,
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("key", &self.resource_key().to_string())
            .field("resource_version", &self.resource_version)
            .field("owner_refs", &self.owner_refs.len())
            .field("cached_manifest", &self.manifest.is_some())
            .finish()
    }
}

impl Resource {
    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey::new(
            self.object_ref.group.clone(),
            self.object_ref.kind.clone(),
            self.object_ref.namespace.clone(),
            self.object_ref.name.clone(),
        )
    }

    /// Whether `child` declares this resource as an owner.
    ///
    /// An owner reference matches by uid when it carries one; references
    /// without a uid (synthetic owners) match by group, kind and name.
    pub fn is_parent_of(&self, child: &Resource) -> bool {
        child.owner_refs.iter().any(|owner| {
            if owner.uid.is_empty() {
                let (group, _) = split_api_version(&owner.api_version);
                group == self.object_ref.group
                    && owner.kind == self.object_ref.kind
                    && owner.name == self.object_ref.name
            } else {
                owner.uid == self.object_ref.uid
            }
        })
    }
}

/// Split an `apiVersion` string into its group and version parts.
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

/// Group, version and kind of a raw object, from its type metadata.
pub fn gvk_of(obj: &DynamicObject) -> GroupVersionKind {
    match &obj.types {
        Some(t) => {
            let (group, version) = split_api_version(&t.api_version);
            GroupVersionKind::gvk(group, version, &t.kind)
        }
        None => GroupVersionKind::gvk("", "", ""),
    }
}

/// Cache key of a raw object.
pub fn object_key(obj: &DynamicObject) -> ResourceKey {
    let gvk = gvk_of(obj);
    ResourceKey::new(
        gvk.group,
        gvk.kind,
        obj.metadata.namespace.clone().unwrap_or_default(),
        obj.metadata.name.clone().unwrap_or_default(),
    )
}

/// Full reference of a raw object.
pub fn object_ref(obj: &DynamicObject) -> ResourceRef {
    let gvk = gvk_of(obj);
    ResourceRef {
        group: gvk.group,
        version: gvk.version,
        kind: gvk.kind,
        namespace: obj.metadata.namespace.clone().unwrap_or_default(),
        name: obj.metadata.name.clone().unwrap_or_default(),
        uid: obj.metadata.uid.clone().unwrap_or_default(),
    }
}

/// Whether the object is a custom-resource-definition descriptor.
pub fn is_crd(obj: &DynamicObject) -> bool {
    let gvk = gvk_of(obj);
    gvk.group == CRD_GROUP && gvk.kind == CRD_KIND
}

/// The kind a CRD descriptor declares, from its spec fields.
pub fn crd_group_kind(obj: &DynamicObject) -> Option<GroupKind> {
    let group = obj.data.pointer("/spec/group")?.as_str()?;
    let kind = obj.data.pointer("/spec/names/kind")?.as_str()?;
    Some(GroupKind::new(group, kind))
}

/// Synthetic owner for auto-created service account token secrets.
///
/// Such secrets carry no owner references upstream; the annotations identify
/// the service account they belong to.
fn service_account_token_owner(obj: &DynamicObject) -> Option<OwnerReference> {
    let gvk = gvk_of(obj);
    if !gvk.group.is_empty() || gvk.kind != SECRET_KIND {
        return None;
    }
    if obj.data.get("type").and_then(|v| v.as_str()) != Some(SERVICE_ACCOUNT_TOKEN_TYPE) {
        return None;
    }
    let annotations = obj.metadata.annotations.as_ref()?;
    let uid = annotations.get(SERVICE_ACCOUNT_UID_ANNOTATION)?;
    let name = annotations.get(SERVICE_ACCOUNT_NAME_ANNOTATION)?;
    if uid.is_empty() || name.is_empty() {
        return None;
    }
    Some(OwnerReference {
        api_version: "v1".to_string(),
        kind: SERVICE_ACCOUNT_KIND.to_string(),
        name: name.clone(),
        uid: uid.clone(),
        ..Default::default()
    })
}

/// Owner references of a raw object, with synthetic-ownership corrections.
///
/// Endpoints objects are linked to their service, and service account token
/// secrets to their service account, compensating for missing upstream
/// owner references.
pub fn effective_owner_refs(obj: &DynamicObject) -> Vec<OwnerReference> {
    let mut owner_refs = obj.metadata.owner_references.clone().unwrap_or_default();
    let gvk = gvk_of(obj);
    if gvk.group.is_empty() && gvk.kind == ENDPOINTS_KIND && owner_refs.is_empty() {
        owner_refs.push(OwnerReference {
            api_version: "v1".to_string(),
            kind: SERVICE_KIND.to_string(),
            name: obj.metadata.name.clone().unwrap_or_default(),
            ..Default::default()
        });
    }
    if let Some(owner) = service_account_token_owner(obj) {
        owner_refs.push(owner);
    }
    owner_refs
}
