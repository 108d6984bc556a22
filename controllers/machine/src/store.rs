//! Cache-backed view of cluster state
//!
//! One reflector store per record kind, fed by watch streams. Reconcilers
//! read exclusively from these caches and write through the apiserver; the
//! watch callbacks translate change events into work-queue keys. The caches
//! are eventually consistent, which the write paths tolerate by treating
//! duplicate creates and conflicts as soft errors.

use std::fmt::Debug;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    Node, PersistentVolume, PersistentVolumeClaim, Pod, Service,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Api;
use kube_runtime::reflector::{self, ObjectRef, Store};
use kube_runtime::{watcher, WatchStreamExt};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::warn;

use crds::{ARPTable, Credential, MachineImage, Setting, SettingName, VirtualMachine};

use crate::labels::{APP, LABEL_APP, LABEL_NAME, LABEL_ROLE, NAMESPACE, ROLE_WORKER};

/// Start a reflector for one kind. Every touched object (add, update,
/// delete, initial sync) is handed to `on_touch`, which typically enqueues
/// a work-queue key. Returns the cache reader and the pump task handle.
pub fn watch_resource<K, F>(api: Api<K>, on_touch: F) -> (Store<K>, JoinHandle<()>)
where
    K: kube::Resource<DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
    F: Fn(&K) + Send + 'static,
{
    let (reader, writer) = reflector::store();
    let handle = tokio::spawn(async move {
        let stream = reflector::reflector(
            writer,
            watcher(api, watcher::Config::default()).default_backoff(),
        )
        .touched_objects();
        futures::pin_mut!(stream);
        while let Some(event) = stream.next().await {
            match event {
                Ok(obj) => on_touch(&obj),
                Err(e) => warn!(error = %e, "watch stream error"),
            }
        }
    });
    (reader, handle)
}

/// True when the object carries every given label value.
pub fn has_labels(meta: &ObjectMeta, expected: &[(&str, &str)]) -> bool {
    match meta.labels.as_ref() {
        Some(labels) => expected
            .iter()
            .all(|(k, v)| labels.get(*k).map(String::as_str) == Some(*v)),
        None => false,
    }
}

/// Cache readers for every kind the reconcilers consume.
#[derive(Clone)]
pub struct Stores {
    pub machines: Store<VirtualMachine>,
    pub images: Store<MachineImage>,
    pub credentials: Store<Credential>,
    pub settings: Store<Setting>,
    pub arp_tables: Store<ARPTable>,
    pub pods: Store<Pod>,
    pub services: Store<Service>,
    pub jobs: Store<Job>,
    pub pvs: Store<PersistentVolume>,
    pub pvcs: Store<PersistentVolumeClaim>,
    pub nodes: Store<Node>,
}

impl Stores {
    /// Block until every cache has completed its initial sync.
    pub async fn wait_ready(&self) {
        let _ = self.machines.wait_until_ready().await;
        let _ = self.images.wait_until_ready().await;
        let _ = self.credentials.wait_until_ready().await;
        let _ = self.settings.wait_until_ready().await;
        let _ = self.arp_tables.wait_until_ready().await;
        let _ = self.pods.wait_until_ready().await;
        let _ = self.services.wait_until_ready().await;
        let _ = self.jobs.wait_until_ready().await;
        let _ = self.pvs.wait_until_ready().await;
        let _ = self.pvcs.wait_until_ready().await;
        let _ = self.nodes.wait_until_ready().await;
    }

    pub fn machine(&self, name: &str) -> Option<Arc<VirtualMachine>> {
        self.machines.get(&ObjectRef::new(name))
    }

    pub fn image(&self, name: &str) -> Option<Arc<MachineImage>> {
        self.images.get(&ObjectRef::new(name))
    }

    pub fn credential(&self, name: &str) -> Option<Arc<Credential>> {
        self.credentials.get(&ObjectRef::new(name))
    }

    pub fn setting(&self, name: SettingName) -> Option<Arc<Setting>> {
        self.settings.get(&ObjectRef::new(name.as_str()))
    }

    /// Setting value with fall-through to the bundled default.
    pub fn setting_value(&self, name: SettingName) -> String {
        self.setting(name)
            .map(|s| s.spec.value.clone())
            .unwrap_or_else(|| name.default_value().to_string())
    }

    pub fn pod(&self, name: &str) -> Option<Arc<Pod>> {
        self.pods.get(&ObjectRef::new(name).within(NAMESPACE))
    }

    pub fn service(&self, name: &str) -> Option<Arc<Service>> {
        self.services.get(&ObjectRef::new(name).within(NAMESPACE))
    }

    pub fn job(&self, name: &str) -> Option<Arc<Job>> {
        self.jobs.get(&ObjectRef::new(name).within(NAMESPACE))
    }

    pub fn pv(&self, name: &str) -> Option<Arc<PersistentVolume>> {
        self.pvs.get(&ObjectRef::new(name))
    }

    pub fn pvc(&self, name: &str) -> Option<Arc<PersistentVolumeClaim>> {
        self.pvcs.get(&ObjectRef::new(name).within(NAMESPACE))
    }

    /// All worker pods of one machine, alive or not.
    pub fn worker_pods(&self, machine: &str) -> Vec<Arc<Pod>> {
        self.pods
            .state()
            .into_iter()
            .filter(|pod| {
                has_labels(
                    &pod.metadata,
                    &[
                        (LABEL_APP, APP),
                        (LABEL_ROLE, ROLE_WORKER),
                        (LABEL_NAME, machine),
                    ],
                )
            })
            .collect()
    }

    /// Names of machines that boot from the given image.
    pub fn machines_for_image(&self, image: &str) -> Vec<String> {
        self.machines
            .state()
            .into_iter()
            .filter(|m| m.spec.machine_image == image)
            .filter_map(|m| m.metadata.name.clone())
            .collect()
    }

    /// Search every host ARP table for the given MAC address.
    pub fn arp_ip_for_mac(&self, mac: &str) -> Option<String> {
        self.arp_tables
            .state()
            .into_iter()
            .find_map(|table| table.spec.table.get(mac).map(|entry| entry.ip.clone()))
    }
}
