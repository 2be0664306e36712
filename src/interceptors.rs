//! Interception points of the broker.
//!
//! A [BrokerInterceptor] is consulted at exactly one point of the handling of CONNECT, PUBLISH,
//! SUBSCRIBE, UNSUBSCRIBE and AUTH packets. It receives a mutable context, and the broker acts
//! solely on the flags and reason code left in that context.
use crate::{
    publication::ApplicationMessage, reason_codes::ReasonCode, types::TopicSubscription,
    ProtocolVersion,
};

/// Context of an incoming CONNECT.
#[derive(Debug, Clone)]
pub struct ConnectionValidationContext {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub protocol_version: ProtocolVersion,
    pub clean_session: bool,
    pub authentication_method: Option<String>,
    pub authentication_data: Option<Vec<u8>>,
    pub user_properties: Vec<(String, String)>,

    /// Any failure code refuses the connection with that code.
    pub reason_code: ReasonCode,
}

/// Context of a publication received from a client.
#[derive(Debug, Clone)]
pub struct PublishInterceptionContext {
    pub client_id: String,

    /// The message as it will be routed. It may be modified.
    pub message: ApplicationMessage,

    /// False drops the message without routing it.
    pub process: bool,

    /// True closes the connection of the publisher.
    pub close_connection: bool,

    /// Reported to MQTT v5 publishers in PUBACK.
    pub reason_code: ReasonCode,
}

/// Context of one filter of a SUBSCRIBE.
#[derive(Debug, Clone)]
pub struct SubscriptionInterceptionContext {
    pub client_id: String,

    /// The requested subscription. It may be modified.
    pub subscription: TopicSubscription,

    /// False refuses the subscription with `reason_code`.
    pub process: bool,
    pub close_connection: bool,
    pub reason_code: ReasonCode,
}

/// Context of one filter of an UNSUBSCRIBE.
#[derive(Debug, Clone)]
pub struct UnsubscriptionInterceptionContext {
    pub client_id: String,
    pub filter: String,

    /// False keeps the subscription and reports `reason_code`.
    pub process: bool,
    pub close_connection: bool,
    pub reason_code: ReasonCode,
}

/// Context of an MQTT v5 re-authentication.
#[derive(Debug, Clone)]
pub struct AuthenticationContext {
    pub client_id: String,
    pub method: Option<String>,
    pub data: Option<Vec<u8>>,

    /// Data returned to the client in the AUTH response.
    pub response_data: Option<Vec<u8>>,

    /// [ReasonCode::Success] accepts, [ReasonCode::ContinueAuthentication] asks for another
    /// round and any failure code disconnects the client.
    pub reason_code: ReasonCode,
}

/// Hooks into the packet handling of the broker. Every hook defaults to accepting.
pub trait BrokerInterceptor: Send + Sync {
    fn validate_connection(&self, _context: &mut ConnectionValidationContext) {}

    fn intercept_publish(&self, _context: &mut PublishInterceptionContext) {}

    fn intercept_subscription(&self, _context: &mut SubscriptionInterceptionContext) {}

    fn intercept_unsubscription(&self, _context: &mut UnsubscriptionInterceptionContext) {}

    /// Re-authentication is refused unless this hook is implemented.
    fn authenticate(&self, context: &mut AuthenticationContext) {
        context.reason_code = ReasonCode::BadAuthMethod;
    }
}

/// Accepts everything.
#[derive(Debug, Default, Copy, Clone)]
pub struct AcceptAll;

impl BrokerInterceptor for AcceptAll {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{types::SubscriptionOptions, QoS};

    struct DenyPrivate;

    impl BrokerInterceptor for DenyPrivate {
        fn intercept_subscription(&self, context: &mut SubscriptionInterceptionContext) {
            if context.subscription.filter.starts_with("private/") {
                context.process = false;
                context.reason_code = ReasonCode::NotAuthorized;
            }
        }
    }

    fn subscription(filter: &str) -> SubscriptionInterceptionContext {
        SubscriptionInterceptionContext {
            client_id: "client".into(),
            subscription: TopicSubscription::new(filter, SubscriptionOptions::new(QoS::AtMostOnce)),
            process: true,
            close_connection: false,
            reason_code: ReasonCode::Success,
        }
    }

    #[test]
    fn hooks_default_to_accept() {
        let mut context = subscription("private/a");
        AcceptAll.intercept_subscription(&mut context);
        assert!(context.process);

        let mut auth = AuthenticationContext {
            client_id: "client".into(),
            method: None,
            data: None,
            response_data: None,
            reason_code: ReasonCode::Success,
        };
        AcceptAll.authenticate(&mut auth);
        assert_eq!(auth.reason_code, ReasonCode::BadAuthMethod);
    }

    #[test]
    fn custom_hook() {
        let mut context = subscription("private/a");
        DenyPrivate.intercept_subscription(&mut context);
        assert!(!context.process);
        assert_eq!(context.reason_code, ReasonCode::NotAuthorized);

        let mut context = subscription("public/a");
        DenyPrivate.intercept_subscription(&mut context);
        assert!(context.process);
    }
}
