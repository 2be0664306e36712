use crate::{
    packets::Publish,
    properties::{PropertiesExt, Property},
    topic, ProtocolError, QoS,
};
use bytes::Bytes;

/// A message as seen by the application, independent of any packet identifier or connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,

    /// Publication properties. Only transmitted with MQTT v5.
    pub properties: Vec<Property>,
}

impl ApplicationMessage {
    /// Construct a message for a topic with default delivery options.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
            properties: Vec::new(),
        }
    }

    /// The message expiry interval in seconds, if one was specified.
    pub fn message_expiry_interval(&self) -> Option<u32> {
        self.properties.message_expiry_interval()
    }

    /// Build the PUBLISH packet carrying the message. No packet identifier is assigned.
    pub fn to_publish(&self) -> Publish {
        Publish {
            topic: self.topic.clone(),
            packet_id: None,
            payload: self.payload.clone(),
            qos: self.qos,
            retain: self.retain,
            dup: false,
            properties: self.properties.clone(),
        }
    }
}

impl From<Publish> for ApplicationMessage {
    fn from(publish: Publish) -> Self {
        Self {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
            // Topic aliases and subscription identifiers only describe a single hop.
            properties: publish
                .properties
                .into_iter()
                .filter(|prop| {
                    !matches!(
                        prop,
                        Property::TopicAlias(_) | Property::SubscriptionIdentifier(_)
                    )
                })
                .collect(),
        }
    }
}

/// Builds an [ApplicationMessage].
///
/// A new publication is sent at [QoS::AtMostOnce], is not retained and carries no properties.
/// A topic must be set before [Publication::finish], either with [Publication::topic] or taken
/// from the [Property::ResponseTopic] of a request through [Publication::reply].
pub struct Publication {
    topic: Option<String>,
    properties: Vec<Property>,
    qos: QoS,
    payload: Bytes,
    retain: bool,
}

impl Publication {
    /// Start a publication of `payload`.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            topic: None,
            properties: Vec::new(),
            retain: false,
        }
    }

    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Ask the broker to keep the message as the retained message of its topic.
    pub fn retain(mut self) -> Self {
        self.retain = true;
        self
    }

    /// Set the topic, replacing a response topic picked up by [Publication::reply].
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic.replace(topic.into());
        self
    }

    /// Replace the properties. Correlation data that was already attached is kept.
    pub fn properties(mut self, properties: &[Property]) -> Self {
        let correlation = self.correlation_data();
        self.properties = properties.to_vec();
        if let Some(data) = correlation {
            self = self.correlate(&data);
        }
        self
    }

    fn correlation_data(&self) -> Option<Vec<u8>> {
        self.properties.iter().find_map(|prop| match prop {
            Property::CorrelationData(data) => Some(data.clone()),
            _ => None,
        })
    }

    /// Address the publication as the response to a request carrying `request` properties.
    ///
    /// The [Property::ResponseTopic] of the request becomes the topic and its
    /// [Property::CorrelationData] is echoed back.
    pub fn reply(mut self, request: &[Property]) -> Self {
        for property in request {
            match property {
                Property::ResponseTopic(topic) => self.topic = Some(topic.clone()),
                Property::CorrelationData(data) => self = self.correlate(data),
                _ => {}
            }
        }
        self
    }

    /// Attach correlation data, replacing any attached before.
    pub fn correlate(mut self, data: &[u8]) -> Self {
        self.properties
            .retain(|prop| !matches!(prop, Property::CorrelationData(_)));
        self.properties.push(Property::CorrelationData(data.to_vec()));
        self
    }

    /// Validate the topic and properties and produce the message.
    ///
    /// # Returns
    /// [ProtocolError::NoTopic] if no topic was set.
    pub fn finish(self) -> Result<ApplicationMessage, ProtocolError> {
        let topic = self.topic.ok_or(ProtocolError::NoTopic)?;
        topic::validate_topic_name(&topic)?;

        if !self.properties.iter().all(|prop| {
            prop.allowed_in(crate::MessageType::Publish)
                && !matches!(prop, Property::SubscriptionIdentifier(_))
        }) {
            return Err(ProtocolError::PropertyNotAllowed);
        }

        Ok(ApplicationMessage {
            topic,
            payload: self.payload,
            qos: self.qos,
            retain: self.retain,
            properties: self.properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_topic() {
        assert_eq!(
            Publication::new("data").finish(),
            Err(ProtocolError::NoTopic)
        );
        assert_eq!(
            Publication::new("data").topic("a/+").finish(),
            Err(ProtocolError::InvalidTopicName)
        );
    }

    #[test]
    fn reply_uses_response_topic() {
        let request = [
            Property::ResponseTopic("replies/1".into()),
            Property::CorrelationData(vec![1, 2, 3]),
        ];

        let message = Publication::new("pong")
            .topic("ignored")
            .reply(&request)
            .properties(&[Property::ContentType("text/plain".into())])
            .qos(QoS::AtLeastOnce)
            .retain()
            .finish()
            .unwrap();

        assert_eq!(message.topic, "replies/1");
        assert_eq!(message.qos, QoS::AtLeastOnce);
        assert!(message.retain);
        assert_eq!(
            message.properties,
            vec![
                Property::ContentType("text/plain".into()),
                Property::CorrelationData(vec![1, 2, 3]),
            ]
        );
    }

    #[test]
    fn rejects_subscription_identifier() {
        let result = Publication::new("x")
            .topic("a")
            .properties(&[Property::SubscriptionIdentifier(3)])
            .finish();
        assert_eq!(result, Err(ProtocolError::PropertyNotAllowed));
    }

    #[test]
    fn strips_single_hop_properties() {
        let mut publish = Publish::new("a/b", "data");
        publish.properties = vec![
            Property::TopicAlias(3),
            Property::SubscriptionIdentifier(9),
            Property::MessageExpiryInterval(30),
        ];

        let message = ApplicationMessage::from(publish);
        assert_eq!(message.properties, vec![Property::MessageExpiryInterval(30)]);
        assert_eq!(message.message_expiry_interval(), Some(30));
    }
}
