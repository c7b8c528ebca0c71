/*
 * Copyright 2024 Google LLC All Rights Reserved.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use k8s_openapi::apimachinery::pkg::{apis::meta::v1::Time, util::intstr::IntOrString};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::fleet::{FleetSpec, FleetStatus};

/// Periodically resizes a [`Fleet`](super::Fleet) from demand signals, with
/// either a buffer of ready servers or an external webhook deciding the
/// target.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "autoscaling.agones.dev",
    version = "v1",
    kind = "FleetAutoscaler",
    plural = "fleetautoscalers",
    singular = "fleetautoscaler",
    namespaced,
    status = "FleetAutoscalerStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct FleetAutoscalerSpec {
    /// The Fleet, in the same namespace, this autoscaler resizes.
    pub fleet_name: String,
    pub policy: FleetAutoscalerPolicy,
}

/// Tagged policy variants, discriminated on `type`; each carries its own
/// parameter record.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FleetAutoscalerPolicy {
    #[serde(rename = "type", default)]
    pub type_: FleetAutoscalerPolicyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer: Option<BufferPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookPolicy>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum FleetAutoscalerPolicyType {
    #[default]
    Buffer,
    Webhook,
}

/// Maintain `bufferSize` ready servers on top of the allocated count,
/// clamped to `[minReplicas, maxReplicas]`.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BufferPolicy {
    /// An absolute count, or a percentage of the current replica total.
    pub buffer_size: IntOrString,
    #[serde(default)]
    pub min_replicas: i32,
    pub max_replicas: i32,
}

/// Delegate the target computation to an external HTTP endpoint.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPolicy {
    /// Absolute URL of the endpoint. Mutually exclusive with `service`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<WebhookService>,
    /// PEM CA bundle (base64, as stored in Kubernetes) used to verify the
    /// endpoint's certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookService {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

impl WebhookPolicy {
    /// The URL to POST reviews to, however the policy names the endpoint.
    pub fn endpoint(&self) -> Result<String, String> {
        if let Some(url) = &self.url {
            return Ok(url.clone());
        }
        let service = self
            .service
            .as_ref()
            .ok_or_else(|| "webhook policy requires either url or service".to_owned())?;
        let port = service.port.unwrap_or(8000);
        let path = service
            .path
            .as_deref()
            .unwrap_or_default()
            .trim_start_matches('/');
        Ok(format!(
            "https://{}.{}.svc:{port}/{path}",
            service.name, service.namespace
        ))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FleetAutoscalerStatus {
    #[serde(default)]
    pub current_replicas: i32,
    #[serde(default)]
    pub desired_replicas: i32,
    /// Only moves when a sync actually changed the fleet's replica target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scale_time: Option<Time>,
    /// Whether the target fleet exists and the policy evaluated cleanly.
    #[serde(default)]
    pub able_to_scale: bool,
    /// Whether the computed target hit the policy's clamp.
    #[serde(default)]
    pub scaling_limited: bool,
}

/// Request wire shape POSTed to a webhook policy's endpoint.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetAutoscaleReview {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<FleetAutoscaleRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<FleetAutoscaleResponse>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetAutoscaleRequest {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub spec: FleetSpec,
    pub status: FleetStatus,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetAutoscaleResponse {
    #[serde(default)]
    pub uid: String,
    /// `false` means the endpoint declined to scale; the sync is a no-op.
    pub scale: bool,
    pub replicas: i32,
}

impl FleetAutoscaler {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = vec![];
        match self.spec.policy.type_ {
            FleetAutoscalerPolicyType::Buffer => match &self.spec.policy.buffer {
                None => errors.push("buffer policy requires spec.policy.buffer".to_owned()),
                Some(buffer) => {
                    if buffer.min_replicas < 0 || buffer.max_replicas < buffer.min_replicas {
                        errors.push(
                            "spec.policy.buffer: requires 0 <= minReplicas <= maxReplicas"
                                .to_owned(),
                        );
                    }
                }
            },
            FleetAutoscalerPolicyType::Webhook => match &self.spec.policy.webhook {
                None => errors.push("webhook policy requires spec.policy.webhook".to_owned()),
                Some(webhook) => {
                    if let Err(err) = webhook.endpoint() {
                        errors.push(format!("spec.policy.webhook: {err}"));
                    }
                }
            },
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_endpoint_resolution() {
        let policy = WebhookPolicy {
            url: Some("https://scaler.example.com/scale".into()),
            ..Default::default()
        };
        assert_eq!(policy.endpoint().unwrap(), "https://scaler.example.com/scale");

        let policy = WebhookPolicy {
            service: Some(WebhookService {
                name: "scaler".into(),
                namespace: "default".into(),
                path: Some("/scale".into()),
                port: None,
            }),
            ..Default::default()
        };
        assert_eq!(policy.endpoint().unwrap(), "https://scaler.default.svc:8000/scale");

        assert!(WebhookPolicy::default().endpoint().is_err());
    }

    #[test]
    fn validation_requires_matching_parameter_record() {
        let mut fas = FleetAutoscaler::new(
            "scaler",
            FleetAutoscalerSpec {
                fleet_name: "simple".into(),
                policy: FleetAutoscalerPolicy::default(),
            },
        );
        assert!(!fas.validate().is_empty());

        fas.spec.policy.buffer = Some(BufferPolicy {
            buffer_size: IntOrString::Int(2),
            min_replicas: 0,
            max_replicas: 10,
        });
        assert!(fas.validate().is_empty());

        fas.spec.policy.buffer.as_mut().unwrap().max_replicas = -1;
        assert!(!fas.validate().is_empty());
    }

    #[test]
    fn review_wire_shape() {
        let review = FleetAutoscaleReview {
            request: Some(FleetAutoscaleRequest {
                uid: "abc".into(),
                name: "simple".into(),
                namespace: "default".into(),
                spec: FleetSpec {
                    replicas: 2,
                    strategy: Default::default(),
                    scheduling: Default::default(),
                    template: Default::default(),
                },
                status: FleetStatus {
                    replicas: 2,
                    ready_replicas: 0,
                    allocated_replicas: 2,
                    reserved_replicas: 0,
                },
            }),
            response: None,
        };
        let value = serde_json::to_value(&review).unwrap();
        assert_eq!(value["request"]["status"]["allocatedReplicas"], 2);

        let response: FleetAutoscaleResponse =
            serde_json::from_value(serde_json::json!({"uid": "abc", "scale": true, "replicas": 4}))
                .unwrap();
        assert!(response.scale);
        assert_eq!(response.replicas, 4);
    }
}
