use crate::{properties::Property, topic, ProtocolError, QoS};
use bytes::Bytes;

/// A message the broker publishes on behalf of a client that disconnects abnormally.
#[derive(Debug, Clone, PartialEq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,

    /// Will properties. Only transmitted with MQTT v5.
    pub properties: Vec<Property>,
}

impl Will {
    /// A will published at QoS 0 without retain.
    ///
    /// Fails if the topic is not a valid topic name or a property may not appear in a will.
    pub fn new(
        topic: impl Into<String>,
        data: impl Into<Bytes>,
        properties: &[Property],
    ) -> Result<Self, ProtocolError> {
        let will = Self {
            topic: topic.into(),
            payload: data.into(),
            qos: QoS::AtMostOnce,
            retain: false,
            properties: properties.to_vec(),
        };

        will.validate()?;
        Ok(will)
    }

    pub fn retained(mut self, retained: bool) -> Self {
        self.retain = retained;
        self
    }

    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// The delay in seconds before the will is published after a connection is lost.
    pub fn delay_interval(&self) -> u32 {
        self.properties
            .iter()
            .find_map(|prop| match prop {
                Property::WillDelayInterval(delay) => Some(*delay),
                _ => None,
            })
            .unwrap_or(0)
    }

    pub(crate) fn validate(&self) -> Result<(), ProtocolError> {
        if !self.properties.iter().all(Property::allowed_in_will) {
            return Err(ProtocolError::PropertyNotAllowed);
        }

        topic::validate_topic_name(&self.topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_foreign_properties() {
        assert_eq!(
            Will::new("status", "gone", &[Property::TopicAlias(1)]),
            Err(ProtocolError::PropertyNotAllowed)
        );
    }

    #[test]
    fn delay_interval() {
        let will = Will::new("status", "gone", &[Property::WillDelayInterval(30)])
            .unwrap()
            .qos(QoS::AtLeastOnce)
            .retained(true);
        assert_eq!(will.delay_interval(), 30);
        assert!(will.retain);
        assert_eq!(Will::new("a/#", "x", &[]), Err(ProtocolError::InvalidTopicName));
    }
}
