//! Podwatch kubehub: Kubernetes pod source (list + watch) and client wiring.

#![forbid(unsafe_code)]

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams, WatchEvent, WatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::ErrorResponse,
    Client, Config,
};
use podwatch_core::{Listing, PodObject, ResourceKey, ResourceVersion, SourceClient, SourceError, SourceEvent, WatchStream};
use tracing::{debug, info, warn};

/// Server-side watch timeout; the peer closes the stream after this and the reflector re-watches.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Build a client from an explicit kubeconfig file, or infer one: the local
/// kubeconfig (`KUBECONFIG` or `~/.kube/config`) when present, otherwise the
/// in-cluster service account. A context without a file selects from the
/// default kubeconfig.
pub async fn client(kubeconfig: Option<&Path>, context: Option<&str>) -> Result<Client> {
    let opts = KubeConfigOptions { context: context.map(|s| s.to_string()), ..Default::default() };
    let config = match (kubeconfig, context) {
        (Some(path), _) => {
            let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kc, &opts).await.context("building config from kubeconfig")?
        }
        (None, Some(ctx)) => {
            Config::from_kubeconfig(&opts).await.with_context(|| format!("loading kubeconfig context {}", ctx))?
        }
        (None, None) => Config::infer().await.context("inferring kube config")?,
    };
    info!(cluster = %config.cluster_url, ns = %config.default_namespace, "kube config loaded");
    Client::try_from(config).context("creating kube client")
}

/// Pods in one namespace or across all namespaces.
#[derive(Clone)]
pub struct KubePodSource {
    api: Api<Pod>,
    scope: String,
    page_size: u32,
}

impl KubePodSource {
    /// `namespace` of `None` (or empty) watches every namespace.
    pub fn new(client: Client, namespace: Option<&str>) -> Self {
        match namespace.filter(|ns| !ns.is_empty()) {
            Some(ns) => Self { api: Api::namespaced(client, ns), scope: ns.to_string(), page_size: 500 },
            None => Self { api: Api::all(client), scope: "(all)".to_string(), page_size: 500 },
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

impl std::fmt::Debug for KubePodSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubePodSource").field("scope", &self.scope).field("page_size", &self.page_size).finish()
    }
}

#[async_trait]
impl SourceClient for KubePodSource {
    async fn list(&self) -> Result<Listing, SourceError> {
        let mut items = Vec::new();
        let mut params = ListParams::default().limit(self.page_size);
        let mut pages = 0u32;
        let version = loop {
            let page = self.api.list(&params).await.map_err(source_error)?;
            pages += 1;
            metrics::counter!("kube_list_pages_total", 1u64);
            for pod in page.items.iter() {
                match pod_object(pod) {
                    Ok(obj) => items.push(obj),
                    Err(e) => warn!(error = %e, "skipping undecodable pod in listing"),
                }
            }
            match page.metadata.continue_.as_deref().filter(|t| !t.is_empty()) {
                Some(token) => params = params.continue_token(token),
                None => break page.metadata.resource_version.clone(),
            }
        };
        let version = version
            .as_deref()
            .ok_or_else(|| SourceError::Decode("pod list without resourceVersion".into()))?
            .parse::<ResourceVersion>()?;
        debug!(scope = %self.scope, pages, objects = items.len(), version = %version, "pods listed");
        Ok(Listing { items, version })
    }

    async fn watch(&self, since: ResourceVersion) -> Result<WatchStream, SourceError> {
        let wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        let stream = self.api.watch(&wp, &since.to_string()).await.map_err(source_error)?;
        debug!(scope = %self.scope, since = %since, "pod watch opened");
        Ok(stream.map_err(source_error).map(|r| r.and_then(source_event)).boxed())
    }
}

fn source_event(ev: WatchEvent<Pod>) -> Result<SourceEvent, SourceError> {
    Ok(match ev {
        WatchEvent::Added(p) => SourceEvent::Added(pod_object(&p)?),
        WatchEvent::Modified(p) => SourceEvent::Updated(pod_object(&p)?),
        WatchEvent::Deleted(p) => SourceEvent::Deleted(pod_object(&p)?),
        WatchEvent::Bookmark(b) => SourceEvent::Bookmark(b.metadata.resource_version.parse()?),
        WatchEvent::Error(resp) => SourceEvent::Error(from_response(&resp)),
    })
}

/// Project the fields the handlers display out of a full pod.
pub fn pod_object(pod: &Pod) -> Result<PodObject, SourceError> {
    let meta = &pod.metadata;
    let name = meta.name.clone().ok_or_else(|| SourceError::Decode("pod without metadata.name".into()))?;
    let version = meta
        .resource_version
        .as_deref()
        .ok_or_else(|| SourceError::Decode(format!("pod {} without resourceVersion", name)))?
        .parse::<ResourceVersion>()?;
    let status = pod.status.as_ref();
    Ok(PodObject {
        key: ResourceKey::new(meta.namespace.clone().unwrap_or_default(), name),
        uid: meta.uid.clone().unwrap_or_default(),
        version,
        ip: status.and_then(|s| s.pod_ip.clone()).unwrap_or_default(),
        phase: status.and_then(|s| s.phase.clone()).unwrap_or_default(),
        node: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
    })
}

fn from_response(resp: &ErrorResponse) -> SourceError {
    let msg = format!("{} ({}): {}", resp.code, resp.reason, resp.message);
    match resp.code {
        410 => SourceError::VersionTooOld(msg),
        401 | 403 => SourceError::Unauthorized(msg),
        _ if resp.reason == "Expired" || resp.reason == "Gone" => SourceError::VersionTooOld(msg),
        _ => SourceError::Transient(msg),
    }
}

/// Classify client errors into the engine's retry taxonomy.
pub fn source_error(e: kube::Error) -> SourceError {
    match e {
        kube::Error::Api(resp) => from_response(&resp),
        kube::Error::Auth(err) => SourceError::Unauthorized(err.to_string()),
        other => SourceError::Transient(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodSpec, PodStatus};
    use kube::api::ObjectMeta;

    fn pod(rv: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("web-0".into()),
                namespace: Some("default".into()),
                uid: Some("1234".into()),
                resource_version: rv.map(|s| s.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec { node_name: Some("node-a".into()), ..Default::default() }),
            status: Some(PodStatus {
                pod_ip: Some("10.0.0.1".into()),
                phase: Some("Running".into()),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn pod_projection_keeps_display_fields() {
        let obj = pod_object(&pod(Some("42"))).unwrap();
        assert_eq!(obj.key, ResourceKey::new("default", "web-0"));
        assert_eq!(obj.version, ResourceVersion(42));
        assert_eq!(obj.ip, "10.0.0.1");
        assert_eq!(obj.phase, "Running");
        assert_eq!(obj.node.as_deref(), Some("node-a"));
    }

    #[test]
    fn pod_without_version_is_a_decode_error() {
        assert!(matches!(pod_object(&pod(None)), Err(SourceError::Decode(_))));
    }

    #[test]
    fn api_errors_map_to_taxonomy() {
        let resp = |code: u16, reason: &str| ErrorResponse {
            status: "Failure".into(),
            message: "m".into(),
            reason: reason.into(),
            code,
        };
        assert!(source_error(kube::Error::Api(resp(410, "Gone"))).is_too_old());
        assert!(source_error(kube::Error::Api(resp(500, "Expired"))).is_too_old());
        assert!(source_error(kube::Error::Api(resp(403, "Forbidden"))).is_fatal());
        assert!(matches!(source_error(kube::Error::Api(resp(500, "InternalError"))), SourceError::Transient(_)));
    }

    #[test]
    fn watch_error_event_is_in_band() {
        let ev = WatchEvent::<Pod>::Error(ErrorResponse {
            status: "Failure".into(),
            message: "too old resource version".into(),
            reason: "Expired".into(),
            code: 410,
        });
        assert!(matches!(source_event(ev), Ok(SourceEvent::Error(SourceError::VersionTooOld(_)))));
    }
}
