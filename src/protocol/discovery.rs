//! Home Assistant style auto-discovery documents
//!
//! A monitor declares a [`DiscoveryDescriptor`] per value it reports. The
//! functions here turn a descriptor into the retained JSON document an
//! automation platform reads to create the matching entity. Building is pure;
//! transmission belongs to the broker connection.

use crate::platform::MachineIdentity;
use serde::{Deserialize, Serialize};

/// Integration name used in discovery config topics
pub const DISCOVERY_NODE_ID: &str = "iotlink";

/// Kind of entity a descriptor announces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Sensor,
    BinarySensor,
    Camera,
    Switch,
    Light,
}

impl Component {
    /// Topic segment for this component, e.g. `binary_sensor`
    pub fn topic_name(&self) -> &'static str {
        match self {
            Component::Sensor => "sensor",
            Component::BinarySensor => "binary_sensor",
            Component::Camera => "camera",
            Component::Switch => "switch",
            Component::Light => "light",
        }
    }
}

/// Entity metadata declared by a monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryDescriptor {
    /// Entity id, unique within its monitor
    pub id: String,
    pub name: String,
    pub component: Component,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub value_template: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub device_class: Option<String>,
    #[serde(default)]
    pub payload_on: Option<String>,
    #[serde(default)]
    pub payload_off: Option<String>,
}

impl DiscoveryDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>, component: Component) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            component,
            unit: None,
            value_template: None,
            icon: None,
            device_class: None,
            payload_on: None,
            payload_off: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_value_template(mut self, template: impl Into<String>) -> Self {
        self.value_template = Some(template.into());
        self
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    pub fn with_device_class(mut self, device_class: impl Into<String>) -> Self {
        self.device_class = Some(device_class.into());
        self
    }

    pub fn with_payloads(mut self, on: impl Into<String>, off: impl Into<String>) -> Self {
        self.payload_on = Some(on.into());
        self.payload_off = Some(off.into());
        self
    }
}

/// Device block shared by every entity of one monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryDevice {
    pub identifiers: Vec<String>,
    pub manufacturer: String,
    pub model: String,
    pub name: String,
}

/// JSON document published to the discovery namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    pub name: String,
    pub unique_id: String,
    /// Raw topic, used by camera entities only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_on: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_off: Option<String>,
    pub device: DiscoveryDevice,
}

/// A document together with the topic it is published on
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryAnnouncement {
    pub config_topic: String,
    pub document: DiscoveryDocument,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.is_empty()).cloned()
}

/// `"{fullMachine}_{monitorKey}_{entityId}"`, lower-cased with spaces as underscores
pub fn unique_id(identity: &MachineIdentity, monitor_key: &str, entity_id: &str) -> String {
    format!("{}_{}_{}", identity.full_name, monitor_key, entity_id)
        .replace(' ', "_")
        .to_lowercase()
}

/// `{discoveryPrefix}/{component}/iotlink/{uniqueId}/config`
pub fn config_topic(discovery_prefix: &str, component: Component, unique_id: &str) -> String {
    format!(
        "{}/{}/{}/{}/config",
        discovery_prefix.trim_end_matches('/'),
        component.topic_name(),
        DISCOVERY_NODE_ID,
        unique_id
    )
}

/// Build the announcement for one monitored value.
///
/// `state_topic` must already be fully qualified. Only non-empty optional fields
/// are carried into the document.
pub fn build_announcement(
    identity: &MachineIdentity,
    domain_prefix: bool,
    discovery_prefix: &str,
    monitor_key: &str,
    state_topic: &str,
    descriptor: &DiscoveryDescriptor,
) -> DiscoveryAnnouncement {
    let machine_name = identity.display_name(domain_prefix);
    let machine_id = machine_name.replace(' ', "_");
    let unique_id = unique_id(identity, monitor_key, &descriptor.id);

    let (topic, state_topic) = match descriptor.component {
        Component::Camera => (Some(state_topic.to_string()), None),
        _ => (None, Some(state_topic.to_string())),
    };

    let document = DiscoveryDocument {
        name: format!("{machine_name} {}", descriptor.name),
        unique_id: unique_id.clone(),
        topic,
        state_topic,
        unit_of_measurement: non_empty(&descriptor.unit),
        value_template: non_empty(&descriptor.value_template),
        icon: non_empty(&descriptor.icon),
        device_class: non_empty(&descriptor.device_class),
        payload_on: non_empty(&descriptor.payload_on),
        payload_off: non_empty(&descriptor.payload_off),
        device: DiscoveryDevice {
            identifiers: vec![format!("{machine_id}_{monitor_key}")],
            manufacturer: format!("IOTLink {}", env!("CARGO_PKG_VERSION")),
            model: identity.domain_name.clone(),
            name: format!("{machine_name} {monitor_key}"),
        },
    };

    DiscoveryAnnouncement {
        config_topic: config_topic(discovery_prefix, descriptor.component, &unique_id),
        document,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn identity() -> MachineIdentity {
        MachineIdentity::new("DESKTOP-01", "WORKGROUP")
    }

    fn battery() -> DiscoveryDescriptor {
        DiscoveryDescriptor::new("Remaining", "Battery Remaining", Component::Sensor)
            .with_unit("%")
            .with_device_class("battery")
    }

    #[test]
    fn test_unique_id_format() {
        assert_eq!(
            unique_id(&identity(), "Power", "Battery Status"),
            "workgroup_desktop-01_power_battery_status"
        );
    }

    #[test]
    fn test_sensor_announcement() {
        let announcement = build_announcement(
            &identity(),
            false,
            "homeassistant",
            "Power",
            "iotlink/desktop/stats/battery/remaining",
            &battery(),
        );

        assert_eq!(
            announcement.config_topic,
            "homeassistant/sensor/iotlink/workgroup_desktop-01_power_remaining/config"
        );
        let doc = &announcement.document;
        assert_eq!(doc.name, "DESKTOP-01 Battery Remaining");
        assert_eq!(doc.state_topic.as_deref(), Some("iotlink/desktop/stats/battery/remaining"));
        assert!(doc.topic.is_none());
        assert_eq!(doc.device.identifiers, vec!["DESKTOP-01_Power".to_string()]);
        assert_eq!(doc.device.name, "DESKTOP-01 Power");
        assert_eq!(doc.device.model, "WORKGROUP");
    }

    #[test]
    fn test_domain_prefix_changes_names() {
        let announcement = build_announcement(
            &identity(),
            true,
            "homeassistant",
            "Power",
            "t",
            &battery(),
        );
        assert_eq!(announcement.document.name, "WORKGROUP DESKTOP-01 Battery Remaining");
        assert_eq!(
            announcement.document.device.identifiers,
            vec!["WORKGROUP_DESKTOP-01_Power".to_string()]
        );
    }

    #[test]
    fn test_camera_uses_raw_topic() {
        let descriptor = DiscoveryDescriptor::new("Screen", "Screenshot", Component::Camera);
        let announcement =
            build_announcement(&identity(), false, "homeassistant", "Display", "iotlink/s", &descriptor);

        assert_eq!(announcement.document.topic.as_deref(), Some("iotlink/s"));
        assert!(announcement.document.state_topic.is_none());
        assert!(announcement.config_topic.starts_with("homeassistant/camera/iotlink/"));
    }

    #[test]
    fn test_empty_optionals_are_omitted() {
        let mut descriptor = DiscoveryDescriptor::new("Status", "Power Status", Component::BinarySensor)
            .with_payloads("Online", "Offline");
        descriptor.icon = Some(String::new());

        let announcement =
            build_announcement(&identity(), false, "homeassistant", "Power", "t", &descriptor);
        let json: Value = serde_json::to_value(&announcement.document).unwrap();
        let object = json.as_object().unwrap();

        assert!(!object.contains_key("icon"));
        assert!(!object.contains_key("unit_of_measurement"));
        assert!(!object.contains_key("topic"));
        assert!(object.values().all(|v| !v.is_null()));
        assert_eq!(object["payload_on"], "Online");
        assert_eq!(object["payload_off"], "Offline");
        assert!(announcement.config_topic.contains("/binary_sensor/"));
    }
}
