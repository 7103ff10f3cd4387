//! `UpgradeConfig` validation.
//!
//! A rejected config is a [`ValidatorResult`] value, not an error. Errors are
//! reserved for collaborators that could not be reached.

use std::cmp::Ordering;
use std::fmt;

use anyhow::Result;
use semver::Version;
use tracing::info;

use crate::cluster::{ClusterVersionState, UpdateGraph, current_version};
use crate::crd::UpgradeConfig;
use crate::error::MuoError;
use crate::gates::{parse_upgrade_at, parse_version};

/// Outcome of validating an `UpgradeConfig` against the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatorResult {
    /// Semantically and syntactically valid.
    pub is_valid: bool,
    /// Valid and worth acting on.
    pub is_available_update: bool,
    pub message: String,
}

impl ValidatorResult {
    fn passed() -> Self {
        Self {
            is_valid: true,
            is_available_update: true,
            message: "Upgrade config is valid".to_string(),
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            is_available_update: false,
            message: message.into(),
        }
    }

    /// Valid, but there is nothing to upgrade to.
    fn unavailable(message: impl Into<String>) -> Self {
        Self {
            is_valid: true,
            is_available_update: false,
            message: message.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionComparison {
    Downgrade,
    Equal,
    Upgrade,
}

pub fn compare_versions(desired: &Version, current: &Version) -> VersionComparison {
    match desired.cmp(current) {
        Ordering::Less => VersionComparison::Downgrade,
        Ordering::Equal => VersionComparison::Equal,
        Ordering::Greater => VersionComparison::Upgrade,
    }
}

/// A parsed image pull spec: `[registry/][namespace/]name[:tag][@digest]`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub namespace: String,
    pub name: String,
    pub tag: String,
    pub id: String,
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for part in [&self.registry, &self.namespace] {
            if !part.is_empty() {
                write!(f, "{part}/")?;
            }
        }
        write!(f, "{}", self.name)?;
        if !self.tag.is_empty() {
            write!(f, ":{}", self.tag)?;
        }
        if !self.id.is_empty() {
            write!(f, "@{}", self.id)?;
        }
        Ok(())
    }
}

/// The first path component is a registry when it looks like a host.
fn is_registry(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

pub fn parse_image_reference(image: &str) -> Result<ImageReference, MuoError> {
    let malformed = |reason: &str| MuoError::InvalidConfig(format!("failed to parse image {image}: {reason}"));

    let (path, id) = match image.split_once('@') {
        Some((path, digest)) => {
            let valid_digest = digest
                .split_once(':')
                .is_some_and(|(algo, hex)| !algo.is_empty() && !hex.is_empty());
            if !valid_digest {
                return Err(malformed("invalid digest"));
            }
            (path, digest.to_string())
        }
        None => (image, String::new()),
    };
    if path.is_empty() || path.split('/').any(str::is_empty) {
        return Err(malformed("invalid reference format"));
    }

    let mut components: Vec<&str> = path.split('/').collect();
    let registry = if components.len() > 1 && is_registry(components[0]) {
        components.remove(0).to_string()
    } else {
        String::new()
    };
    let last = components.pop().unwrap_or_default();
    let (name, tag) = match last.split_once(':') {
        Some((name, tag)) => (name.to_string(), tag.to_string()),
        None => (last.to_string(), String::new()),
    };

    Ok(ImageReference {
        registry,
        namespace: components.join("/"),
        name,
        tag,
        id,
    })
}

/// A release image must be pinned by digest in a named repository.
fn image_validation(image: &str) -> Result<(), String> {
    let reference = parse_image_reference(image)
        .map_err(|e| format!("{e}: must be a valid image pull spec"))?;
    let missing = if reference.registry.is_empty() {
        Some("no registry specified")
    } else if reference.namespace.is_empty() {
        Some("no repository specified")
    } else if reference.name.is_empty() {
        Some("no image name specified")
    } else if reference.id.is_empty() {
        Some("no image digest specified")
    } else {
        None
    };
    match missing {
        Some(reason) => Err(format!(
            "failed to parse image:{image} must be a valid image pull spec: {reason}"
        )),
        None => Ok(()),
    }
}

/// Check that the desired version is a forward edge from the current one.
fn version_validation(desired: &str, cv: &ClusterVersionState) -> Option<ValidatorResult> {
    let desired_version = match parse_version(desired) {
        Ok(v) => v,
        Err(e) => {
            return Some(ValidatorResult::invalid(format!(
                "failed to parse upgrade config desired version {desired} as semver: {e}"
            )));
        }
    };
    let Some(current) = current_version(cv) else {
        return Some(ValidatorResult::invalid(
            "failed to get current cluster version during validation",
        ));
    };
    let current_version = match parse_version(current) {
        Ok(v) => v,
        Err(e) => {
            return Some(ValidatorResult::invalid(format!(
                "failed to parse current cluster version {current} as semver: {e}"
            )));
        }
    };

    match compare_versions(&desired_version, &current_version) {
        VersionComparison::Downgrade => Some(ValidatorResult::unavailable(format!(
            "downgrades to desired version {desired} from {current} are unsupported"
        ))),
        VersionComparison::Equal => Some(ValidatorResult::unavailable(format!(
            "desired version {desired} matches the current version {current}"
        ))),
        VersionComparison::Upgrade => {
            info!("Desired version {desired} validated as greater than current version {current}");
            None
        }
    }
}

/// Validate `uc` against the live cluster version.
///
/// `update_graph` enables the update service check for channel changes.
pub async fn validate_upgrade_config(
    uc: &UpgradeConfig,
    cv: &ClusterVersionState,
    update_graph: Option<&dyn UpdateGraph>,
) -> Result<ValidatorResult> {
    let spec = &uc.spec;
    if parse_upgrade_at(&spec.upgrade_at).is_err() {
        return Ok(ValidatorResult::invalid(format!(
            "Failed to parse upgradeAt:{} during validation",
            spec.upgrade_at
        )));
    }

    let desired = &spec.desired;
    if !desired.image.is_empty() {
        return Ok(match image_validation(&desired.image) {
            Ok(()) => ValidatorResult::passed(),
            Err(message) => ValidatorResult::invalid(message),
        });
    }

    if desired.version.is_empty() && desired.channel.is_empty() {
        return Ok(ValidatorResult::invalid(
            "Not able to validate the upgrade config, either image or (channel + version) needs to be provided",
        ));
    }

    if let Some(result) = version_validation(&desired.version, cv) {
        return Ok(result);
    }

    if desired.channel != cv.channel {
        if let Some(graph) = update_graph {
            let from = current_version(cv).unwrap_or_default();
            let updates = graph
                .available_updates(&cv.upstream, &desired.channel, from)
                .await?;
            if updates.is_empty() {
                return Ok(ValidatorResult::invalid(format!(
                    "no available upgrade for the given clusterversion {from}"
                )));
            }
            if !updates.iter().any(|v| *v == desired.version) {
                info!(
                    "Failed to find the desired version {} in channel {}",
                    desired.version, desired.channel
                );
                return Ok(ValidatorResult::invalid(format!(
                    "cannot find version {} in available updates",
                    desired.version
                )));
            }
        }
    } else {
        let offered = cv
            .available_updates
            .iter()
            .chain(&cv.conditional_updates)
            .any(|r| r.version == desired.version);
        if !offered {
            return Ok(ValidatorResult::invalid(format!(
                "version {} not found in clusterversion available or conditional updates",
                desired.version
            )));
        }
    }

    Ok(ValidatorResult::passed())
}
