//! The three event-handler capability traits the core exposes to an event
//! source (spec §6.3, §9 "event handler polymorphism → capability trait").
//! The reconciler implements all three.

use crate::types::{NamespaceInfo, PodInfo, PolicyInfo};

pub trait PolicyHandler {
    fn on_policy_add(&self, namespace: &str, name: &str, curr: PolicyInfo);
    fn on_policy_update(&self, namespace: &str, name: &str, prev: PolicyInfo, curr: PolicyInfo);
    fn on_policy_delete(&self, namespace: &str, name: &str, prev: PolicyInfo);
    fn on_policy_synced(&self);
}

pub trait PodHandler {
    fn on_pod_add(&self, namespace: &str, name: &str, curr: PodInfo);
    fn on_pod_update(&self, namespace: &str, name: &str, prev: PodInfo, curr: PodInfo);
    fn on_pod_delete(&self, namespace: &str, name: &str, prev: PodInfo);
    fn on_pod_synced(&self);
}

pub trait NamespaceHandler {
    fn on_namespace_add(&self, name: &str, curr: NamespaceInfo);
    fn on_namespace_update(&self, name: &str, prev: NamespaceInfo, curr: NamespaceInfo);
    fn on_namespace_delete(&self, name: &str, prev: NamespaceInfo);
    fn on_namespace_synced(&self);
}
