//! Resource construction.
//!
//! The resource identifies the emitting process and is attached once to each
//! provider. It is built from the configured service identity, the machine
//! host name and any free-form attributes.

use crate::config::ResourceConfig;
use crate::error::HarnessError;
use opentelemetry::KeyValue;
use opentelemetry_resource_detectors::{
    HostResourceDetector, OsResourceDetector, ProcessResourceDetector,
};
use opentelemetry_sdk::Resource;
use opentelemetry_semantic_conventions::resource::{
    HOST_NAME, SERVICE_INSTANCE_ID, SERVICE_NAME, SERVICE_VERSION,
};

/// Builds the resource descriptor for a service.
///
/// `instance_id` falls back to the machine host name, and `host.name` is
/// filled from the host unless `extra_attributes` already sets it. Service
/// identity always wins over a clashing extra attribute.
///
/// # Errors
///
/// Returns [`HarnessError::EmptyServiceName`] if `service_name` is blank.
///
/// # Example
///
/// ```
/// use telemetry_harness::configure_resource;
///
/// let resource = configure_resource(
///     "checkout",
///     Some("1.4.0"),
///     Some("checkout-7f9c"),
///     [("environment", "staging")],
/// )?;
/// assert!(!resource.is_empty());
/// # Ok::<(), telemetry_harness::HarnessError>(())
/// ```
pub fn configure_resource<K, V>(
    service_name: &str,
    version: Option<&str>,
    instance_id: Option<&str>,
    extra_attributes: impl IntoIterator<Item = (K, V)>,
) -> Result<Resource, HarnessError>
where
    K: Into<String>,
    V: Into<String>,
{
    let attributes = identity_attributes(service_name, version, instance_id, extra_attributes)?;
    Ok(Resource::builder().with_attributes(attributes).build())
}

/// Builds the resource from configuration, running detectors if asked to.
pub(crate) fn resource_from_config(config: &ResourceConfig) -> Result<Resource, HarnessError> {
    let attributes = identity_attributes(
        &config.service_name,
        config.service_version.as_deref(),
        config.service_instance_id.as_deref(),
        config.attributes.iter().map(|(k, v)| (k.clone(), v.clone())),
    )?;

    let mut builder = Resource::builder();
    if config.detect {
        builder = builder
            .with_detector(Box::new(HostResourceDetector::default()))
            .with_detector(Box::new(OsResourceDetector))
            .with_detector(Box::new(ProcessResourceDetector));
    }

    Ok(builder.with_attributes(attributes).build())
}

fn identity_attributes<K, V>(
    service_name: &str,
    version: Option<&str>,
    instance_id: Option<&str>,
    extra_attributes: impl IntoIterator<Item = (K, V)>,
) -> Result<Vec<KeyValue>, HarnessError>
where
    K: Into<String>,
    V: Into<String>,
{
    let service_name = service_name.trim();
    if service_name.is_empty() {
        return Err(HarnessError::EmptyServiceName);
    }

    let mut attributes: Vec<KeyValue> = extra_attributes
        .into_iter()
        .map(|(k, v)| KeyValue::new(Into::<String>::into(k), Into::<String>::into(v)))
        .collect();

    let host = machine_name();
    if !attributes.iter().any(|kv| kv.key.as_str() == HOST_NAME) {
        attributes.push(KeyValue::new(HOST_NAME, host.clone()));
    }

    attributes.push(KeyValue::new(SERVICE_NAME, service_name.to_string()));
    if let Some(version) = version {
        attributes.push(KeyValue::new(SERVICE_VERSION, version.to_string()));
    }
    attributes.push(KeyValue::new(
        SERVICE_INSTANCE_ID,
        instance_id.map_or(host, str::to_string),
    ));

    Ok(attributes)
}

/// Host name of the machine, or `unknown-host` if the OS will not say.
pub(crate) fn machine_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown-host".to_string())
}
