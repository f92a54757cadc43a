//! List+watch loops that turn cluster events into queue keys.

use std::fmt::Debug;

use anyhow::Result;
use futures::TryStreamExt;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::{Resource, ResourceExt};
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use steward_core::ResourceKey;
use steward_queue::WorkQueue;
use steward_schema::crd::GROUP;
use tracing::{debug, info, warn};

fn key_of<K: Resource>(obj: &K) -> Option<ResourceKey> {
    Some(ResourceKey::new(obj.namespace()?, obj.meta().name.clone()?))
}

/// Drops events that only touched status. Our own status writes would
/// otherwise re-trigger reconciliation and defeat the requeue intervals.
#[derive(Debug, Default)]
pub struct GenerationFilter {
    seen: FxHashMap<ResourceKey, Option<i64>>,
}

impl GenerationFilter {
    /// Whether an applied object should be enqueued.
    pub fn applied(&mut self, key: &ResourceKey, generation: Option<i64>) -> bool {
        match self.seen.insert(key.clone(), generation) {
            Some(prev) => prev != generation || generation.is_none(),
            None => true,
        }
    }

    pub fn deleted(&mut self, key: &ResourceKey) { self.seen.remove(key); }

    pub fn reset(&mut self) { self.seen.clear(); }
}

/// Watch a primary kind and enqueue keys on spec (generation) changes and deletions.
pub async fn watch_primary<K>(api: Api<K>, queue: WorkQueue<ResourceKey>, what: &'static str) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    let mut filter = GenerationFilter::default();
    info!(kind = what, "primary watcher started");
    while let Some(ev) = stream.try_next().await? {
        match ev {
            Event::Applied(o) => {
                let Some(key) = key_of(&o) else { continue };
                if filter.applied(&key, o.meta().generation) {
                    queue.push(key);
                }
            }
            Event::Deleted(o) => {
                let Some(key) = key_of(&o) else { continue };
                filter.deleted(&key);
                queue.push(key);
            }
            Event::Restarted(list) => {
                debug!(kind = what, count = list.len(), "watch restart");
                filter.reset();
                for o in list.iter() {
                    if let Some(key) = key_of(o) {
                        filter.applied(&key, o.meta().generation);
                        queue.push(key);
                    }
                }
            }
        }
    }
    warn!(kind = what, "primary watcher stream ended");
    Ok(())
}

/// Key of the controlling Application, if `obj` has one.
pub fn owner_key<K: Resource>(obj: &K) -> Option<ResourceKey> {
    let ns = obj.namespace()?;
    obj.owner_references()
        .iter()
        .find(|r| r.kind == "Application" && r.api_version.starts_with(GROUP) && r.controller == Some(true))
        .map(|r| ResourceKey::new(ns, r.name.clone()))
}

/// Watch a child kind and enqueue the owning Application on any change.
pub async fn watch_owned<K>(api: Api<K>, queue: WorkQueue<ResourceKey>, what: &'static str) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let cfg = watcher::Config::default().labels(&format!("app.kubernetes.io/managed-by={}", crate::FIELD_MANAGER));
    let stream = watcher::watcher(api, cfg);
    futures::pin_mut!(stream);
    info!(kind = what, "owned watcher started");
    while let Some(ev) = stream.try_next().await? {
        match ev {
            Event::Applied(o) | Event::Deleted(o) => {
                if let Some(key) = owner_key(&o) { queue.push(key); }
            }
            Event::Restarted(list) => {
                for o in list.iter() {
                    if let Some(key) = owner_key(o) { queue.push(key); }
                }
            }
        }
    }
    warn!(kind = what, "owned watcher stream ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;

    #[test]
    fn status_only_updates_are_filtered() {
        let mut f = GenerationFilter::default();
        let k = ResourceKey::new("ns", "a");
        assert!(f.applied(&k, Some(1)));
        assert!(!f.applied(&k, Some(1)));
        assert!(f.applied(&k, Some(2)));
        f.deleted(&k);
        assert!(f.applied(&k, Some(2)));
    }

    #[test]
    fn objects_without_generation_always_pass() {
        let mut f = GenerationFilter::default();
        let k = ResourceKey::new("ns", "a");
        assert!(f.applied(&k, None));
        assert!(f.applied(&k, None));
    }

    #[test]
    fn owner_key_follows_controller_reference() {
        let dep: Deployment = serde_json::from_value(serde_json::json!({
            "metadata": {
                "name": "shop",
                "namespace": "default",
                "ownerReferences": [
                    {"apiVersion": "other.io/v1", "kind": "Application", "name": "x", "uid": "1", "controller": false},
                    {"apiVersion": "steward.dev/v1beta1", "kind": "Application", "name": "shop", "uid": "2", "controller": true}
                ]
            }
        }))
        .unwrap();
        assert_eq!(owner_key(&dep), Some(ResourceKey::new("default", "shop")));
    }
}
