use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;
use kube::{
    api::Api,
    core::DynamicObject,
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
};
use pcl_core::{Delta, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::convert::{resource_from_dynamic, Tenancy};

fn convert<S, T>(obj: &DynamicObject, tenancy: &Tenancy) -> Option<Resource<S, T>>
where
    S: DeserializeOwned + Default,
    T: DeserializeOwned + Default,
{
    match resource_from_dynamic(obj, tenancy) {
        Ok(r) => Some(r),
        Err(e) => {
            warn!(name = ?obj.metadata.name, error = ?e, "skipping undecodable object");
            None
        }
    }
}

/// List+watch `api` and feed typed deltas into an informer's ingest channel. A watch
/// restart becomes one `Resynced` delta so vanished objects are dropped from the cache.
/// Returns when the stream ends or the receiver is gone.
pub async fn start_watcher<S, T>(api: Api<DynamicObject>, tenancy: Arc<Tenancy>, tx: mpsc::Sender<Delta<Resource<S, T>>>) -> Result<()>
where
    S: DeserializeOwned + Default + Send + 'static,
    T: DeserializeOwned + Default + Send + 'static,
{
    let resource = api.resource_url().to_string();
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(resource = %resource, "watcher started");
    while let Some(ev) = stream.next().await {
        let delta = match ev {
            Ok(Event::Applied(o)) => match convert(&o, &tenancy) {
                Some(r) => Delta::Applied(r),
                None => continue,
            },
            Ok(Event::Deleted(o)) => match convert(&o, &tenancy) {
                Some(r) => Delta::Deleted(r),
                None => continue,
            },
            Ok(Event::Restarted(list)) => {
                debug!(resource = %resource, count = list.len(), "watch restart");
                Delta::Resynced(list.iter().filter_map(|o| convert(o, &tenancy)).collect())
            }
            Err(e) => {
                warn!(resource = %resource, error = %e, "watch error; backing off");
                continue;
            }
        };
        if tx.send(delta).await.is_err() {
            debug!(resource = %resource, "ingest closed; stopping watcher");
            return Ok(());
        }
    }
    warn!(resource = %resource, "watcher stream ended");
    Ok(())
}
