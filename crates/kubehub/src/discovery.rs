//! Schema discovery and schema -> kube `ApiResource` mapping.

use kube::{
    api::ApiResource,
    core::GroupVersionKind,
    discovery::{Discovery, Scope},
    Client,
};
use tracing::{debug, info};

use ranch_core::{ApiSchema, ProxyError, ProxyResult};

use crate::client::map_kube_err;

/// Parse `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> ProxyResult<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() })
        }
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() })
        }
        _ => Err(ProxyError::BadRequest(format!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key))),
    }
}

pub fn api_resource(schema: &ApiSchema) -> ApiResource {
    ApiResource {
        group: schema.group.clone(),
        version: schema.version.clone(),
        api_version: schema.api_version(),
        kind: schema.kind.clone(),
        plural: schema.resource.clone(),
    }
}

/// Every served resource at its preferred version, without grants.
pub async fn discover_schemas(client: Client) -> ProxyResult<Vec<ApiSchema>> {
    let t0 = std::time::Instant::now();
    let discovery = Discovery::new(client).run().await.map_err(map_kube_err)?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            let namespaced = matches!(caps.scope, Scope::Namespaced);
            out.push(ApiSchema::new(ar.group, ar.version, ar.plural, ar.kind, namespaced));
        }
    }
    out.sort_by(|a, b| a.id.cmp(&b.id).then(a.version.cmp(&b.version)));
    info!(schemas = out.len(), took_ms = %t0.elapsed().as_millis(), "discovery: ok");
    Ok(out)
}

/// Resolve one `group/version/Kind` key to a schema.
pub async fn find_schema(client: Client, gvk_key: &str) -> ProxyResult<ApiSchema> {
    let gvk = parse_gvk_key(gvk_key)?;
    let discovery = Discovery::new(client).run().await.map_err(map_kube_err)?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                debug!(gvk = %gvk_key, plural = %ar.plural, "discovery: resolved");
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok(ApiSchema::new(ar.group, ar.version, ar.plural, ar.kind, namespaced));
            }
        }
    }
    Err(ProxyError::NotFound(format!("GVK not served: {}", gvk_key)))
}
