//! Bridges `kube`'s watch streams for `NetworkPolicy`/`Pod`/`Namespace` into
//! the core's `{Policy,Pod,Namespace}Handler` callbacks (spec §6.3).
//!
//! `kube`'s `watcher::Event` only ever carries `Applied`/`Deleted`/`Restarted`
//! — it doesn't distinguish a create from an update the way the core's
//! handler traits do, and a `Restarted` event replaces the watcher's entire
//! view of the world after a reconnect. [`Cache`] keeps the last-seen value
//! per object so those three k8s-shaped events can be replayed as the core's
//! add/update/delete/synced calls.

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use futures::StreamExt;
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client, ResourceExt};
use netpold_core::handlers::{NamespaceHandler, PodHandler, PolicyHandler};
use netpold_core::types::{NamespaceInfo, ObjKey, PodInfo, PolicyInfo};
use netpold_k8s_api::convert;
use netpold_k8s_api::{Namespace, NetworkPolicy, Pod};
use std::time::Duration;
use tokio::time;
use tracing::{debug, warn};

/// Tracks the last-seen value per object of one kind.
struct Cache<K, V> {
    items: HashMap<K, V>,
}

impl<K, V> Default for Cache<K, V> {
    fn default() -> Self {
        Self {
            items: HashMap::default(),
        }
    }
}

enum Change<K, V> {
    Add(K, V),
    Update(K, V, V),
    Delete(K, V),
}

impl<K, V> Cache<K, V>
where
    K: std::hash::Hash + Eq + Clone,
    V: Clone,
{
    fn apply(&mut self, key: K, value: V) -> Change<K, V> {
        match self.items.insert(key.clone(), value.clone()) {
            Some(prev) => Change::Update(key, prev, value),
            None => Change::Add(key, value),
        }
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        self.items.remove(key)
    }

    /// Replays a full relist (a `Restarted` event, or a forced periodic
    /// resync): anything new is an add, anything changed is an update,
    /// anything previously cached but absent from `new_items` is a delete.
    fn reset(&mut self, new_items: Vec<(K, V)>) -> Vec<Change<K, V>> {
        let mut changes = Vec::with_capacity(new_items.len());
        let mut seen: HashSet<K> = HashSet::default();
        for (key, value) in new_items {
            seen.insert(key.clone());
            changes.push(self.apply(key, value));
        }
        let stale: Vec<K> = self
            .items
            .keys()
            .filter(|k| !seen.contains(*k))
            .cloned()
            .collect();
        for key in stale {
            if let Some(prev) = self.remove(&key) {
                changes.push(Change::Delete(key, prev));
            }
        }
        changes
    }
}

fn obj_key(meta: &impl ResourceExt) -> ObjKey {
    (meta.namespace().unwrap_or_default(), meta.name_any())
}

/// Runs the three watch loops until the process is torn down, or a watch
/// stream ends unexpectedly. `config_sync_period` forces a full relist on
/// each kind at that interval, mirroring a client-go `SharedInformer`'s
/// periodic resync on top of `kube`'s own relist-on-desync behavior.
pub async fn run<H>(client: Client, handler: H, config_sync_period: Duration) -> anyhow::Error
where
    H: PolicyHandler + PodHandler + NamespaceHandler + Send + Sync + 'static,
{
    let policy_api: Api<NetworkPolicy> = Api::all(client.clone());
    let pod_api: Api<Pod> = Api::all(client.clone());
    let ns_api: Api<Namespace> = Api::all(client);

    let mut policy_stream = watcher::watcher(policy_api.clone(), watcher::Config::default()).boxed();
    let mut pod_stream = watcher::watcher(pod_api.clone(), watcher::Config::default()).boxed();
    let mut ns_stream = watcher::watcher(ns_api.clone(), watcher::Config::default()).boxed();

    let mut policy_cache = Cache::<ObjKey, PolicyInfo>::default();
    let mut pod_cache = Cache::<ObjKey, PodInfo>::default();
    let mut ns_cache = Cache::<String, NamespaceInfo>::default();

    let mut policy_resync = Box::pin(time::sleep(config_sync_period));
    let mut pod_resync = Box::pin(time::sleep(config_sync_period));
    let mut ns_resync = Box::pin(time::sleep(config_sync_period));

    loop {
        tokio::select! {
            ev = policy_stream.next() => match ev {
                Some(Ok(event)) => apply_policy_event(&handler, &mut policy_cache, event),
                Some(Err(error)) => warn!(%error, "network policy watch error"),
                None => policy_stream = watcher::watcher(policy_api.clone(), watcher::Config::default()).boxed(),
            },

            ev = pod_stream.next() => match ev {
                Some(Ok(event)) => apply_pod_event(&handler, &mut pod_cache, event),
                Some(Err(error)) => warn!(%error, "pod watch error"),
                None => pod_stream = watcher::watcher(pod_api.clone(), watcher::Config::default()).boxed(),
            },

            ev = ns_stream.next() => match ev {
                Some(Ok(event)) => apply_namespace_event(&handler, &mut ns_cache, event),
                Some(Err(error)) => warn!(%error, "namespace watch error"),
                None => ns_stream = watcher::watcher(ns_api.clone(), watcher::Config::default()).boxed(),
            },

            _ = &mut policy_resync => {
                debug!("forcing network policy relist");
                policy_stream = watcher::watcher(policy_api.clone(), watcher::Config::default()).boxed();
                policy_resync = Box::pin(time::sleep(config_sync_period));
            },
            _ = &mut pod_resync => {
                debug!("forcing pod relist");
                pod_stream = watcher::watcher(pod_api.clone(), watcher::Config::default()).boxed();
                pod_resync = Box::pin(time::sleep(config_sync_period));
            },
            _ = &mut ns_resync => {
                debug!("forcing namespace relist");
                ns_stream = watcher::watcher(ns_api.clone(), watcher::Config::default()).boxed();
                ns_resync = Box::pin(time::sleep(config_sync_period));
            },
        }
    }
}

fn apply_policy_event<H: PolicyHandler>(
    handler: &H,
    cache: &mut Cache<ObjKey, PolicyInfo>,
    event: Event<NetworkPolicy>,
) {
    match event {
        Event::Applied(np) => {
            let key = obj_key(&np);
            match cache.apply(key.clone(), convert::policy_info(&np)) {
                Change::Add(_, curr) => handler.on_policy_add(&key.0, &key.1, curr),
                Change::Update(_, prev, curr) => handler.on_policy_update(&key.0, &key.1, prev, curr),
                Change::Delete(..) => unreachable!("apply never produces a delete"),
            }
        }
        Event::Deleted(np) => {
            let key = obj_key(&np);
            if let Some(prev) = cache.remove(&key) {
                handler.on_policy_delete(&key.0, &key.1, prev);
            }
        }
        Event::Restarted(list) => {
            let items = list.iter().map(|np| (obj_key(np), convert::policy_info(np))).collect();
            for change in cache.reset(items) {
                match change {
                    Change::Add(key, curr) => handler.on_policy_add(&key.0, &key.1, curr),
                    Change::Update(key, prev, curr) => handler.on_policy_update(&key.0, &key.1, prev, curr),
                    Change::Delete(key, prev) => handler.on_policy_delete(&key.0, &key.1, prev),
                }
            }
            handler.on_policy_synced();
        }
    }
}

fn apply_pod_event<H: PodHandler>(handler: &H, cache: &mut Cache<ObjKey, PodInfo>, event: Event<Pod>) {
    match event {
        Event::Applied(pod) => {
            let key = obj_key(&pod);
            match cache.apply(key.clone(), convert::pod_info(&pod)) {
                Change::Add(_, curr) => handler.on_pod_add(&key.0, &key.1, curr),
                Change::Update(_, prev, curr) => handler.on_pod_update(&key.0, &key.1, prev, curr),
                Change::Delete(..) => unreachable!("apply never produces a delete"),
            }
        }
        Event::Deleted(pod) => {
            let key = obj_key(&pod);
            if let Some(prev) = cache.remove(&key) {
                handler.on_pod_delete(&key.0, &key.1, prev);
            }
        }
        Event::Restarted(list) => {
            let items = list.iter().map(|p| (obj_key(p), convert::pod_info(p))).collect();
            for change in cache.reset(items) {
                match change {
                    Change::Add(key, curr) => handler.on_pod_add(&key.0, &key.1, curr),
                    Change::Update(key, prev, curr) => handler.on_pod_update(&key.0, &key.1, prev, curr),
                    Change::Delete(key, prev) => handler.on_pod_delete(&key.0, &key.1, prev),
                }
            }
            handler.on_pod_synced();
        }
    }
}

fn apply_namespace_event<H: NamespaceHandler>(
    handler: &H,
    cache: &mut Cache<String, NamespaceInfo>,
    event: Event<Namespace>,
) {
    match event {
        Event::Applied(ns) => {
            let name = ns.name_any();
            match cache.apply(name.clone(), convert::namespace_info(&ns)) {
                Change::Add(_, curr) => handler.on_namespace_add(&name, curr),
                Change::Update(_, prev, curr) => handler.on_namespace_update(&name, prev, curr),
                Change::Delete(..) => unreachable!("apply never produces a delete"),
            }
        }
        Event::Deleted(ns) => {
            let name = ns.name_any();
            if let Some(prev) = cache.remove(&name) {
                handler.on_namespace_delete(&name, prev);
            }
        }
        Event::Restarted(list) => {
            let items = list
                .iter()
                .map(|ns| (ns.name_any(), convert::namespace_info(ns)))
                .collect();
            for change in cache.reset(items) {
                match change {
                    Change::Add(name, curr) => handler.on_namespace_add(&name, curr),
                    Change::Update(name, prev, curr) => handler.on_namespace_update(&name, prev, curr),
                    Change::Delete(name, prev) => handler.on_namespace_delete(&name, prev),
                }
            }
            handler.on_namespace_synced();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_reset_produces_add_update_delete() {
        let mut cache = Cache::<String, i32>::default();
        cache.apply("a".to_string(), 1);
        cache.apply("b".to_string(), 2);

        let changes = cache.reset(vec![("a".to_string(), 1), ("c".to_string(), 3)]);
        let mut saw_b_delete = false;
        let mut saw_c_add = false;
        for change in changes {
            match change {
                Change::Delete(k, v) if k == "b" && v == 2 => saw_b_delete = true,
                Change::Add(k, v) if k == "c" && v == 3 => saw_c_add = true,
                Change::Add(k, _) if k == "a" => panic!("unchanged key must not be re-added"),
                _ => {}
            }
        }
        assert!(saw_b_delete && saw_c_add);
        assert_eq!(cache.items.len(), 2);
    }
}
