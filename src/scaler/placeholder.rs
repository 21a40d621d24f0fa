//! Placeholder pod lifecycle.
//!
//! A Pending placeholder reserves capacity the cluster autoscaler must
//! provision a node for; once Scheduled it pins that node until scale-down
//! releases it. The pause image keeps the pod Running at near-zero cost.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{
    Affinity, Container, Pod, PodAffinityTerm, PodAntiAffinity, PodSpec, Toleration,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, DeleteParams, PostParams};
use log::{debug, error, info};
use rand::Rng;

use crate::config::{PLACEHOLDER_APP_LABEL, RUNNER_NODE_LABEL, RUNNER_TAINT_KEY};

const PAUSE_IMAGE: &str = "rancher/pause:3.6";

/// Manages placeholder pods in the provider namespace.
pub struct PlaceholderPods {
    pods: Api<Pod>,
}

impl PlaceholderPods {
    pub fn new(client: kube::Client, namespace: &str) -> Self {
        Self {
            pods: Api::namespaced(client, namespace),
        }
    }

    fn random_suffix() -> String {
        const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
        let mut rng = rand::thread_rng();
        (0..8)
            .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
            .collect()
    }

    /// Build the placeholder pod spec. The required anti-affinity spreads
    /// placeholders one per node, so each Pending placeholder forces the
    /// cluster autoscaler to add a node.
    fn build_pod(name: &str) -> Pod {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), PLACEHOLDER_APP_LABEL.to_string());

        let anti_affinity = PodAntiAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                label_selector: Some(LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                }),
                topology_key: "kubernetes.io/hostname".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let mut node_selector = BTreeMap::new();
        node_selector.insert(RUNNER_NODE_LABEL.to_string(), "true".to_string());

        let toleration = Toleration {
            key: Some(RUNNER_TAINT_KEY.to_string()),
            operator: Some("Equal".to_string()),
            value: Some("true".to_string()),
            effect: Some("NoExecute".to_string()),
            ..Default::default()
        };

        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "pause".to_string(),
                    image: Some(PAUSE_IMAGE.to_string()),
                    ..Default::default()
                }],
                affinity: Some(Affinity {
                    pod_anti_affinity: Some(anti_affinity),
                    ..Default::default()
                }),
                node_selector: Some(node_selector),
                tolerations: Some(vec![toleration]),
                restart_policy: Some("Never".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Create one placeholder pod under a fresh random name.
    pub async fn create(&self) -> Result<String> {
        let name = format!("{PLACEHOLDER_APP_LABEL}-{}", Self::random_suffix());
        let pod = Self::build_pod(&name);
        self.pods
            .create(&PostParams::default(), &pod)
            .await
            .with_context(|| format!("creating placeholder pod {name}"))?;
        Ok(name)
    }

    /// Create a batch, logging failures without aborting. Returns how many
    /// were actually created.
    pub async fn create_batch(&self, count: u32) -> u32 {
        let mut created = 0;
        for _ in 0..count {
            match self.create().await {
                Ok(name) => {
                    info!("created placeholder pod {name}");
                    created += 1;
                }
                Err(err) => error!("failed to create placeholder pod: {err:#}"),
            }
        }
        created
    }

    /// Delete one placeholder by name. NotFound means a previous tick or a
    /// node drain already removed it.
    pub async fn delete(&self, name: &str) {
        match self.pods.delete(name, &DeleteParams::default()).await {
            Ok(_) => info!("deleted placeholder pod {name}"),
            Err(kube::Error::Api(response)) if response.code == 404 => {
                debug!("placeholder pod {name} already gone");
            }
            Err(err) => error!("failed to delete placeholder pod {name}: {err}"),
        }
    }

    pub async fn delete_batch(&self, names: &[String]) {
        for name in names {
            self.delete(name).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_is_eight_lowercase_alphanumerics() {
        for _ in 0..32 {
            let suffix = PlaceholderPods::random_suffix();
            assert_eq!(suffix.len(), 8);
            assert!(
                suffix
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            );
        }
    }

    #[test]
    fn pod_spec_reserves_a_full_node() {
        let pod = PlaceholderPods::build_pod("runner-placeholder-a1b2c3d4");
        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels.get("app").unwrap(), PLACEHOLDER_APP_LABEL);

        let spec = pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(
            spec.node_selector.unwrap().get(RUNNER_NODE_LABEL).unwrap(),
            "true"
        );

        let toleration = &spec.tolerations.unwrap()[0];
        assert_eq!(toleration.key.as_deref(), Some(RUNNER_TAINT_KEY));
        assert_eq!(toleration.effect.as_deref(), Some("NoExecute"));

        let terms = spec
            .affinity
            .unwrap()
            .pod_anti_affinity
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .unwrap();
        assert_eq!(terms[0].topology_key, "kubernetes.io/hostname");

        assert_eq!(spec.containers[0].image.as_deref(), Some(PAUSE_IMAGE));
    }
}
