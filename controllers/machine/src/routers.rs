//! Event routers
//!
//! Pod and Job events do not get their own reconcilers; they translate into
//! Machine or MachineImage queue keys by deriving the owner from labels.
//! Worker and console pods route to their machine, pull and publish pods to
//! their image, and migration pods are skipped because the job events
//! already cover that flow.

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::labels::{
    APP, LABEL_APP, LABEL_NAME, LABEL_ROLE, ROLE_CONSOLE, ROLE_IMAGE, ROLE_MIGRATE, ROLE_WORKER,
};

/// Queue a derived owner key belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    Machine(String),
    Image(String),
}

fn owned_labels(meta: &ObjectMeta) -> Option<(&str, &str)> {
    let labels = meta.labels.as_ref()?;
    if labels.get(LABEL_APP).map(String::as_str) != Some(APP) {
        return None;
    }
    let role = labels.get(LABEL_ROLE)?.as_str();
    let owner = labels.get(LABEL_NAME)?.as_str();
    Some((role, owner))
}

/// Owner key for a pod event, if the pod belongs to this operator.
pub fn route_pod(pod: &Pod) -> Option<RouteTarget> {
    let (role, owner) = owned_labels(&pod.metadata)?;
    match role {
        ROLE_WORKER | ROLE_CONSOLE => Some(RouteTarget::Machine(owner.to_string())),
        ROLE_IMAGE => Some(RouteTarget::Image(owner.to_string())),
        // migration pod events arrive through their job
        ROLE_MIGRATE => None,
        _ => None,
    }
}

/// Owner key for a job event, if the job belongs to this operator.
pub fn route_job(job: &Job) -> Option<RouteTarget> {
    let (role, owner) = owned_labels(&job.metadata)?;
    match role {
        ROLE_MIGRATE => Some(RouteTarget::Machine(owner.to_string())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(labels: serde_json::Value) -> Pod {
        serde_json::from_value(json!({ "metadata": { "name": "p", "labels": labels } })).unwrap()
    }

    fn job(labels: serde_json::Value) -> Job {
        serde_json::from_value(json!({ "metadata": { "name": "j", "labels": labels } })).unwrap()
    }

    #[test]
    fn worker_pod_routes_to_its_machine() {
        let pod = pod(json!({ "app": APP, "role": "worker", "name": "m1" }));
        assert_eq!(route_pod(&pod), Some(RouteTarget::Machine("m1".to_string())));
    }

    #[test]
    fn console_pod_routes_to_its_machine() {
        let pod = pod(json!({ "app": APP, "role": "console", "name": "m1" }));
        assert_eq!(route_pod(&pod), Some(RouteTarget::Machine("m1".to_string())));
    }

    #[test]
    fn pull_and_publish_pods_route_to_their_image() {
        let pod = pod(json!({ "app": APP, "role": "image", "name": "ubuntu" }));
        assert_eq!(route_pod(&pod), Some(RouteTarget::Image("ubuntu".to_string())));
    }

    #[test]
    fn migration_pods_are_left_to_the_job_router() {
        let pod = pod(json!({ "app": APP, "role": "migrate", "name": "m1" }));
        assert_eq!(route_pod(&pod), None);
    }

    #[test]
    fn foreign_pods_are_ignored() {
        let pod = pod(json!({ "app": "unrelated", "role": "worker", "name": "m1" }));
        assert_eq!(route_pod(&pod), None);

        let unlabeled: Pod =
            serde_json::from_value(json!({ "metadata": { "name": "p" } })).unwrap();
        assert_eq!(route_pod(&unlabeled), None);
    }

    #[test]
    fn migration_job_routes_to_its_machine() {
        let job = job(json!({ "app": APP, "role": "migrate", "name": "m1" }));
        assert_eq!(route_job(&job), Some(RouteTarget::Machine("m1".to_string())));
    }

    #[test]
    fn foreign_jobs_are_ignored() {
        let job = job(json!({ "app": "unrelated", "role": "migrate", "name": "m1" }));
        assert_eq!(route_job(&job), None);
    }
}
