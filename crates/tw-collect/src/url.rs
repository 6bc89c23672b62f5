//! Endpoint resolution for selector-based metrics.
//!
//! An explicit URL on the metric always wins. Otherwise the engine lists
//! services matching the metric's selector and this module picks the cluster
//! address, mapping a named port to its number when needed.

use tw_types::{Metric, PortRef};

use crate::CaptureError;

/// A service port as advertised by the workspace.
#[derive(Debug, Clone, PartialEq)]
pub struct ServicePort {
    pub name: String,
    pub port: u16,
}

/// The reachable address of one matching service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceEndpoint {
    /// Cluster-internal host name or IP.
    pub cluster_address: String,
    pub ports: Vec<ServicePort>,
}

/// Resolve the endpoint URL for a metric.
pub fn resolve_url(
    metric: &Metric,
    services: &[ServiceEndpoint],
) -> Result<String, CaptureError> {
    if let Some(url) = &metric.url {
        return Ok(url.clone());
    }

    let service = services.first().ok_or_else(|| {
        CaptureError::permanent(format!(
            "no service matches the selector of metric {}",
            metric.name
        ))
    })?;

    let port = match &metric.port {
        Some(PortRef::Number(n)) => Some(*n),
        Some(PortRef::Name(name)) => Some(
            service
                .ports
                .iter()
                .find(|p| &p.name == name)
                .map(|p| p.port)
                .ok_or_else(|| {
                    CaptureError::permanent(format!(
                        "service {} has no port named {name}",
                        service.cluster_address
                    ))
                })?,
        ),
        None => service.ports.first().map(|p| p.port),
    };

    Ok(match port {
        Some(port) => format!("http://{}:{}", service.cluster_address, port),
        None => format!("http://{}", service.cluster_address),
    })
}
