//! Broker message envelopes
//!
//! [`OutboundMessage`] is what the bridge hands to the broker client;
//! [`BrokerMessage`] is what subscribers receive for every inbound publish.

use crate::config::MessageSettings;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::QoS;
use tracing::warn;

/// Map a configured QoS level onto the transport's QoS, defaulting to 0
pub fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        other => {
            warn!("Wrong QoS configuration ({}), defaulting to 0", other);
            QoS::AtMostOnce
        }
    }
}

/// A fully-built message ready to publish
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Fully-qualified topic
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
    pub qos: QoS,
}

impl OutboundMessage {
    /// Build a message from a fully-qualified topic and delivery settings
    pub fn build(topic: impl Into<String>, payload: impl Into<Bytes>, settings: &MessageSettings) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: settings.retain,
            qos: qos_from_level(settings.qos),
        }
    }

    /// Discovery documents are always retained
    pub fn retained(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::build(
            topic,
            payload,
            &MessageSettings {
                qos: 0,
                retain: true,
            },
        )
    }
}

/// A message received from the broker
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    /// Topic as published on the broker
    pub full_topic: String,
    /// Topic with the machine or global prefix removed
    pub topic: String,
    pub payload: Bytes,
    pub content_type: Option<String>,
    pub retain: bool,
}

impl BrokerMessage {
    /// Payload as UTF-8 text, lossy
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Whether this is the remote re-synchronization request
    pub fn is_refresh(&self) -> bool {
        self.topic.eq_ignore_ascii_case("refresh")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_mapping() {
        assert_eq!(qos_from_level(0), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_level(2), QoS::ExactlyOnce);
        assert_eq!(qos_from_level(7), QoS::AtMostOnce);
    }

    #[test]
    fn test_build_applies_settings() {
        let message = OutboundMessage::build(
            "iotlink/desktop/stats/cpu",
            b"42".to_vec(),
            &MessageSettings { qos: 1, retain: true },
        );
        assert_eq!(message.topic, "iotlink/desktop/stats/cpu");
        assert_eq!(message.payload, Bytes::from_static(b"42"));
        assert_eq!(message.qos, QoS::AtLeastOnce);
        assert!(message.retain);
    }

    #[test]
    fn test_retained_forces_retain() {
        let message = OutboundMessage::retained("homeassistant/sensor/x/config", "{}");
        assert!(message.retain);
    }

    #[test]
    fn test_refresh_detection_is_case_insensitive() {
        let mut message = BrokerMessage {
            full_topic: "iotlink/desktop/Refresh".to_string(),
            topic: "Refresh".to_string(),
            payload: Bytes::new(),
            content_type: None,
            retain: false,
        };
        assert!(message.is_refresh());

        message.topic = "REFRESH".to_string();
        assert!(message.is_refresh());

        message.topic = "refresh/now".to_string();
        assert!(!message.is_refresh());
    }
}
