//! Pure message routing and processing logic for MQTT events
//!
//! This module contains pure functions for classifying transport events and
//! turning inbound publishes into [`BrokerMessage`]s.

use super::message::BrokerMessage;
use crate::protocol::strip_topic_prefixes;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::Event;
use rumqttc::Outgoing;

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.clone(),
                    content_type: publish
                        .properties
                        .as_ref()
                        .and_then(|props| props.content_type.clone()),
                    retain: publish.retain,
                },
                Packet::Disconnect(_) => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::Disconnected,
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Build the subscriber-facing message for an inbound publish
    pub fn to_broker_message(
        topic: &str,
        payload: Bytes,
        content_type: Option<String>,
        retain: bool,
        prefix: &str,
        global_prefix: &str,
    ) -> BrokerMessage {
        BrokerMessage {
            full_topic: topic.to_string(),
            topic: strip_topic_prefixes(topic, prefix, global_prefix),
            payload,
            content_type,
            retain,
        }
    }

    /// Decide what to do with an inbound message
    pub fn classify(message: &BrokerMessage) -> InboundAction {
        if message.is_refresh() {
            InboundAction::Refresh
        } else {
            InboundAction::Deliver
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Message received on subscribed topic
    MessageReceived {
        topic: String,
        payload: Bytes,
        content_type: Option<String>,
        retain: bool,
    },
    /// Broker disconnected us, or we sent a disconnect
    Disconnected,
    SubscriptionConfirmed { packet_id: u16 },
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

/// What an inbound broker message triggers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundAction {
    /// Re-announce the connected state and raise a refresh request
    Refresh,
    /// Forward to ordinary subscribers
    Deliver,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::v5::mqttbytes::v5::{
        ConnAck, ConnectReturnCode, Disconnect, DisconnectReasonCode, Publish, PublishProperties,
    };
    use rumqttc::v5::mqttbytes::QoS;

    #[test]
    fn test_route_mqtt_event() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged
        ));

        let disconnect = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: DisconnectReasonCode::NormalDisconnection,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&disconnect),
            EventRoute::Disconnected
        ));

        let outgoing = Event::Outgoing(Outgoing::Disconnect);
        assert!(matches!(
            MessageHandler::route_mqtt_event(&outgoing),
            EventRoute::Disconnected
        ));

        let ping = Event::Outgoing(Outgoing::PingReq);
        assert!(matches!(
            MessageHandler::route_mqtt_event(&ping),
            EventRoute::OutgoingEvent
        ));
    }

    #[test]
    fn test_route_publish_with_content_type() {
        let publish = Event::Incoming(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: true,
            topic: Bytes::from("iotlink/desktop/commands/notify"),
            pkid: 1,
            payload: Bytes::from("{}"),
            properties: Some(PublishProperties {
                content_type: Some("application/json".to_string()),
                ..Default::default()
            }),
        }));

        match MessageHandler::route_mqtt_event(&publish) {
            EventRoute::MessageReceived {
                topic,
                payload,
                content_type,
                retain,
            } => {
                assert_eq!(topic, "iotlink/desktop/commands/notify");
                assert_eq!(payload, Bytes::from("{}"));
                assert_eq!(content_type.as_deref(), Some("application/json"));
                assert!(retain);
            }
            other => panic!("Expected MessageReceived route, got {other:?}"),
        }
    }

    #[test]
    fn test_to_broker_message_strips_prefixes() {
        let message = MessageHandler::to_broker_message(
            "iotlink/all/refresh",
            Bytes::new(),
            None,
            false,
            "iotlink/desktop",
            "iotlink/all",
        );
        assert_eq!(message.full_topic, "iotlink/all/refresh");
        assert_eq!(message.topic, "refresh");
        assert_eq!(MessageHandler::classify(&message), InboundAction::Refresh);
    }

    #[test]
    fn test_classify_ordinary_message() {
        let message = MessageHandler::to_broker_message(
            "iotlink/desktop/commands/refreshment",
            Bytes::from("x"),
            None,
            false,
            "iotlink/desktop",
            "iotlink/all",
        );
        assert_eq!(MessageHandler::classify(&message), InboundAction::Deliver);
    }

    #[test]
    fn test_global_refresh_with_default_prefixes() {
        let defaults = crate::config::MqttSection::default();
        let message = MessageHandler::to_broker_message(
            "iotlink/all/Refresh",
            Bytes::new(),
            None,
            false,
            &defaults.prefix,
            &defaults.global_prefix,
        );
        assert_eq!(message.topic, "Refresh");
        assert_eq!(MessageHandler::classify(&message), InboundAction::Refresh);
    }
}
