//! Tracking of the resources created by one execution.
//!
//! `kubectl create -o json` prints one JSON document per created object (or
//! a single `List`). Each is reduced to a [`ClusterResource`].

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::types::ClusterResource;

/// How resource names and namespaces are stored.
///
/// Kinds are always lower-cased.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NameNormalization {
    #[default]
    Preserve,
    Lowercase,
}

impl NameNormalization {
    fn apply(self, value: String) -> String {
        match self {
            NameNormalization::Preserve => value,
            NameNormalization::Lowercase => value.to_lowercase(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreatedObject {
    kind: Option<String>,
    metadata: Option<ObjectMeta>,
    #[serde(default)]
    items: Vec<CreatedObject>,
}

/// Decode every object reported by a creation call, in output order.
pub fn parse_created(output: &str, policy: NameNormalization) -> Result<Vec<ClusterResource>> {
    let mut resources = Vec::new();
    for object in serde_json::Deserializer::from_str(output).into_iter::<CreatedObject>() {
        let object = object.map_err(|e| Error::parse(format!("invalid JSON: {}", e)))?;
        collect(object, policy, &mut resources)?;
    }
    Ok(resources)
}

/// Decode a single object.
pub fn parse_one(output: &str, policy: NameNormalization) -> Result<ClusterResource> {
    let mut resources = parse_created(output, policy)?;
    if resources.len() > 1 {
        debug!(
            count = resources.len(),
            "Expected one object in kubectl output, keeping the first"
        );
    }
    if resources.is_empty() {
        return Err(Error::parse("no object in kubectl output"));
    }
    Ok(resources.swap_remove(0))
}

fn collect(
    object: CreatedObject,
    policy: NameNormalization,
    out: &mut Vec<ClusterResource>,
) -> Result<()> {
    if object
        .kind
        .as_deref()
        .is_some_and(|k| k.eq_ignore_ascii_case("list"))
    {
        for item in object.items {
            collect(item, policy, out)?;
        }
        return Ok(());
    }

    let kind = object
        .kind
        .ok_or_else(|| Error::parse("object has no 'kind'"))?
        .to_lowercase();
    let metadata = object
        .metadata
        .ok_or_else(|| Error::parse(format!("{} has no 'metadata'", kind)))?;
    let name = metadata
        .name
        .ok_or_else(|| Error::parse(format!("{} has no 'metadata.name'", kind)))?;
    let namespace = metadata
        .namespace
        .ok_or_else(|| Error::parse(format!("{}/{} has no 'metadata.namespace'", kind, name)))?;

    out.push(ClusterResource::new(
        kind,
        policy.apply(name),
        policy.apply(namespace),
    ));
    Ok(())
}

/// Resources created in the current execution, in creation order.
#[derive(Debug, Default, Clone)]
pub struct ResourceRegistry {
    resources: Vec<ClusterResource>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, resource: ClusterResource) {
        info!(
            "Successfully created K8S resource: {} in namespace {}.",
            resource.kind_name(),
            resource.namespace
        );
        self.resources.push(resource);
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn resources(&self) -> &[ClusterResource] {
        &self.resources
    }

    pub fn log_streamable(&self) -> Vec<&ClusterResource> {
        self.resources
            .iter()
            .filter(|r| r.is_log_streamable())
            .collect()
    }

    /// Pick the resource whose logs are streamed.
    ///
    /// An explicit target wins and is not checked against the registry.
    /// Otherwise the first log-streamable resource in creation order is used.
    pub fn select_for_streaming(
        &self,
        explicit: Option<&ClusterResource>,
    ) -> Result<ClusterResource> {
        if self.is_empty() {
            return Err(Error::NoResourcesCreated);
        }
        if let Some(target) = explicit {
            info!("Resource to stream was specified, using {}", target);
            return Ok(target.clone());
        }

        let streamable = self.log_streamable();
        info!("Found {} log-streamable resources.", streamable.len());
        match streamable.as_slice() {
            [] => Err(Error::NoStreamableResource(self.len())),
            [only] => Ok((*only).clone()),
            [first, ..] => {
                info!(
                    "More than one resource is log-streamable; selecting the first one: {}",
                    first.kind_name()
                );
                Ok((*first).clone())
            }
        }
    }

    pub fn clear(&mut self) {
        self.resources.clear();
    }
}
