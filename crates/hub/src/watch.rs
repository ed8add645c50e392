//! Watcher wiring: one tokio task per kind, feeding a shared cache.

use std::fmt::Debug;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures::TryStreamExt;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::{CacheKeyed, SharedCache};

/// List+watch a typed kind into its cache. Runs until the stream ends
/// or errors; the caller owns restarts.
pub async fn run_watcher<K>(api: Api<K>, cache: Arc<SharedCache<K>>) -> Result<()>
where
    K: kube::Resource + CacheKeyed + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(cache = cache.name(), "watcher started");
    while let Some(ev) = stream.try_next().await? {
        match ev {
            Event::Applied(o) => cache.apply(o),
            Event::Deleted(o) => cache.delete(&o.cache_key()),
            Event::Restarted(list) => {
                debug!(cache = cache.name(), count = list.len(), "watch restart");
                cache.replace(list);
            }
        }
    }
    warn!(cache = cache.name(), "watcher stream ended");
    Ok(())
}

/// List+watch a dynamic (CRD) kind, shaping each object through `map`
/// before it lands in the cache. Objects the mapper rejects are logged
/// and skipped.
pub async fn run_dynamic_watcher<T, F>(
    client: Client,
    gvk_key: &str,
    cache: Arc<SharedCache<T>>,
    map: F,
) -> Result<()>
where
    T: CacheKeyed + Send + Sync + 'static,
    F: Fn(&DynamicObject) -> Option<T>,
{
    let gvk = parse_gvk_key(gvk_key)?;
    let (ar, _namespaced) = find_api_resource(client.clone(), &gvk).await?;
    let api: Api<DynamicObject> = Api::all_with(client, &ar);

    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(cache = cache.name(), gvk = %gvk_key, "dynamic watcher started");
    while let Some(ev) = stream.try_next().await? {
        match ev {
            Event::Applied(o) => match map(&o) {
                Some(t) => cache.apply(t),
                None => warn!(cache = cache.name(), name = ?o.metadata.name, "unmappable object skipped"),
            },
            Event::Deleted(o) => {
                if let Some(t) = map(&o) {
                    cache.delete(&t.cache_key());
                }
            }
            Event::Restarted(list) => {
                debug!(cache = cache.name(), count = list.len(), "watch restart");
                cache.replace(list.iter().filter_map(&map).collect());
            }
        }
    }
    warn!(cache = cache.name(), gvk = %gvk_key, "dynamic watcher stream ended");
    Ok(())
}

fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind {
            group: String::new(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        [group, version, kind] => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not served: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_key_forms() {
        let v1 = parse_gvk_key("v1/Node").unwrap();
        assert_eq!(v1.group, "");
        assert_eq!(v1.kind, "Node");
        let grouped = parse_gvk_key("networking.gke.io/v1/Network").unwrap();
        assert_eq!(grouped.group, "networking.gke.io");
        assert_eq!(grouped.version, "v1");
        assert!(parse_gvk_key("Node").is_err());
    }
}
