//! Controller wiring
//!
//! Builds the caches, queues and workers for one leadership session.
//! Watch events land in per-kind queues (directly for the operator's own
//! records, through the routers for pods and jobs), and a fixed pool of
//! workers drains each queue through the reconciler. Losing the lease or
//! receiving a stop signal shuts the queues down and ends the session.

use std::future::Future;
use std::sync::Arc;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    Node, PersistentVolume, PersistentVolumeClaim, Pod, Service,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Api, Client};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crds::{ARPTable, Credential, MachineImage, Setting, VirtualMachine};

use crate::config::Options;
use crate::error::ControllerError;
use crate::labels::NAMESPACE;
use crate::leader::{leader_identity, LeaderElector};
use crate::queue::WorkQueue;
use crate::reconciler::Reconciler;
use crate::routers::{route_job, route_pod, RouteTarget};
use crate::store::{watch_resource, Stores};

pub struct Controller {
    client: Client,
    options: Options,
}

enum SessionEnd {
    LostLease,
    Shutdown,
}

fn enqueue_meta(queue: &WorkQueue, meta: &ObjectMeta) {
    if let Some(name) = meta.name.as_deref() {
        queue.add(name);
    }
}

impl Controller {
    pub async fn new(options: Options) -> Result<Self, ControllerError> {
        let client = Client::try_default().await?;
        Ok(Self { client, options })
    }

    /// Join the election, run while leading, and rejoin on lease loss.
    /// Only a stop signal ends the loop.
    pub async fn run(&self) -> Result<(), ControllerError> {
        let identity = leader_identity();
        info!(%identity, workers = self.options.workers, "starting machine controller");

        loop {
            let elector = LeaderElector::new(&self.client, identity.clone());
            elector.acquire().await?;

            match self.run_leader_session(&elector).await? {
                SessionEnd::Shutdown => {
                    elector.release().await;
                    info!("machine controller stopped");
                    return Ok(());
                }
                SessionEnd::LostLease => {
                    warn!("leadership lost, rejoining the election");
                }
            }
        }
    }

    async fn run_leader_session(
        &self,
        elector: &LeaderElector,
    ) -> Result<SessionEnd, ControllerError> {
        let machine_queue = WorkQueue::new("virtualmachine");
        let image_queue = WorkQueue::new("machineimage");
        let setting_queue = WorkQueue::new("setting");
        let mut watchers: Vec<JoinHandle<()>> = Vec::new();

        // Own records enqueue themselves.
        let (machines, handle) = watch_resource(Api::<VirtualMachine>::all(self.client.clone()), {
            let queue = machine_queue.clone();
            move |m: &VirtualMachine| enqueue_meta(&queue, &m.metadata)
        });
        watchers.push(handle);

        let (images, handle) = watch_resource(Api::<MachineImage>::all(self.client.clone()), {
            let queue = image_queue.clone();
            move |i: &MachineImage| enqueue_meta(&queue, &i.metadata)
        });
        watchers.push(handle);

        let (settings, handle) = watch_resource(Api::<Setting>::all(self.client.clone()), {
            let queue = setting_queue.clone();
            move |s: &Setting| enqueue_meta(&queue, &s.metadata)
        });
        watchers.push(handle);

        let (credentials, handle) =
            watch_resource(Api::<Credential>::all(self.client.clone()), |_: &Credential| {});
        watchers.push(handle);

        // A changed host ARP table may resolve guest IPs: wake the machines
        // whose MAC shows up in it.
        let (arp_tables, handle) = watch_resource(Api::<ARPTable>::all(self.client.clone()), {
            let machines = machines.clone();
            let queue = machine_queue.clone();
            move |table: &ARPTable| {
                for machine in machines.state() {
                    let mac = machine
                        .status
                        .as_ref()
                        .map(|s| s.mac.clone())
                        .unwrap_or_default();
                    if !mac.is_empty() && table.spec.table.contains_key(&mac) {
                        enqueue_meta(&queue, &machine.metadata);
                    }
                }
            }
        });
        watchers.push(handle);

        // Pod and job events route to their owning record.
        let (pods, handle) = watch_resource(
            Api::<Pod>::namespaced(self.client.clone(), NAMESPACE),
            {
                let machine_queue = machine_queue.clone();
                let image_queue = image_queue.clone();
                move |pod: &Pod| match route_pod(pod) {
                    Some(RouteTarget::Machine(name)) => machine_queue.add(&name),
                    Some(RouteTarget::Image(name)) => image_queue.add(&name),
                    None => {}
                }
            },
        );
        watchers.push(handle);

        let (jobs, handle) = watch_resource(
            Api::<Job>::namespaced(self.client.clone(), NAMESPACE),
            {
                let machine_queue = machine_queue.clone();
                let image_queue = image_queue.clone();
                move |job: &Job| match route_job(job) {
                    Some(RouteTarget::Machine(name)) => machine_queue.add(&name),
                    Some(RouteTarget::Image(name)) => image_queue.add(&name),
                    None => {}
                }
            },
        );
        watchers.push(handle);

        let (services, handle) = watch_resource(
            Api::<Service>::namespaced(self.client.clone(), NAMESPACE),
            |_: &Service| {},
        );
        watchers.push(handle);

        let (pvs, handle) = watch_resource(
            Api::<PersistentVolume>::all(self.client.clone()),
            |_: &PersistentVolume| {},
        );
        watchers.push(handle);

        let (pvcs, handle) = watch_resource(
            Api::<PersistentVolumeClaim>::namespaced(self.client.clone(), NAMESPACE),
            |_: &PersistentVolumeClaim| {},
        );
        watchers.push(handle);

        // Node set changes re-evaluate the readiness of every image.
        let (nodes, handle) = watch_resource(Api::<Node>::all(self.client.clone()), {
            let images = images.clone();
            let queue = image_queue.clone();
            move |_: &Node| {
                for image in images.state() {
                    enqueue_meta(&queue, &image.metadata);
                }
            }
        });
        watchers.push(handle);

        let stores = Stores {
            machines,
            images,
            credentials,
            settings,
            arp_tables,
            pods,
            services,
            jobs,
            pvs,
            pvcs,
            nodes,
        };

        info!("waiting for caches to sync");
        stores.wait_ready().await;
        info!("caches synced");

        let reconciler = Arc::new(Reconciler::new(
            &self.client,
            stores,
            machine_queue.clone(),
            image_queue.clone(),
            self.options.clone(),
        ));

        if let Err(e) = reconciler.initialize_settings().await {
            warn!(error = %e, "settings bootstrap failed, continuing");
        }
        if let Err(e) = reconciler.rebuild_storage_client().await {
            warn!(error = %e, "storage client not available yet");
        }

        let mut workers = Vec::new();
        for _ in 0..self.options.workers {
            let queue = machine_queue.clone();
            let reconciler = reconciler.clone();
            workers.push(tokio::spawn(run_worker(queue, move |key| {
                let reconciler = reconciler.clone();
                async move { reconciler.reconcile_machine(&key).await }
            })));
        }
        {
            let queue = image_queue.clone();
            let reconciler = reconciler.clone();
            workers.push(tokio::spawn(run_worker(queue, move |key| {
                let reconciler = reconciler.clone();
                async move { reconciler.reconcile_machine_image(&key).await }
            })));
        }
        {
            let queue = setting_queue.clone();
            let reconciler = reconciler.clone();
            workers.push(tokio::spawn(run_worker(queue, move |key| {
                let reconciler = reconciler.clone();
                async move { reconciler.reconcile_setting(&key).await }
            })));
        }

        let end = tokio::select! {
            _ = elector.keep_renewed() => SessionEnd::LostLease,
            _ = tokio::signal::ctrl_c() => {
                info!("received stop signal, attempting graceful termination");
                SessionEnd::Shutdown
            }
        };

        machine_queue.shut_down();
        image_queue.shut_down();
        setting_queue.shut_down();
        for watcher in watchers {
            watcher.abort();
        }
        for worker in workers {
            let _ = worker.await;
        }

        Ok(end)
    }
}

/// Drain one queue until shutdown: process, release the lease, requeue
/// failures with back-off.
async fn run_worker<F, Fut>(queue: Arc<WorkQueue>, reconcile: F)
where
    F: Fn(String) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), ControllerError>> + Send,
{
    while let Some(key) = queue.get().await {
        match reconcile(key.clone()).await {
            Ok(()) => queue.forget(&key),
            Err(e) => {
                warn!(queue = queue.name(), key = %key, error = %e, "reconcile failed, requeueing");
                queue.add_rate_limited(&key);
            }
        }
        queue.done(&key);
    }
    info!(queue = queue.name(), "worker queue shut down");
}
