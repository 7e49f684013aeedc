//! Numeric topic identifiers multiplexed over the single connection
//!
//! The server publishes using the short numeric ids. The long path names
//! are accepted too since some gateways rewrite topics to their names.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicId {
    /// Push notification delivery
    MessageDelivery,
    /// Registration request (outbound)
    RegistrationRequest,
    /// Registration response carrying the delivery token
    RegistrationResponse,
}

impl TopicId {
    /// Topics listed in the CONNECT payload's subscription field
    pub const SUBSCRIBED: [TopicId; 2] = [TopicId::MessageDelivery, TopicId::RegistrationResponse];

    pub fn id(self) -> i32 {
        match self {
            TopicId::MessageDelivery => 76,
            TopicId::RegistrationRequest => 79,
            TopicId::RegistrationResponse => 80,
        }
    }

    /// Topic string used on the wire
    pub fn as_str(self) -> &'static str {
        match self {
            TopicId::MessageDelivery => "76",
            TopicId::RegistrationRequest => "79",
            TopicId::RegistrationResponse => "80",
        }
    }

    pub fn path(self) -> &'static str {
        match self {
            TopicId::MessageDelivery => "/fbns_msg",
            TopicId::RegistrationRequest => "/fbns_reg_req",
            TopicId::RegistrationResponse => "/fbns_reg_resp",
        }
    }

    /// Resolve an inbound topic by id or path name
    pub fn from_topic(topic: &str) -> Option<Self> {
        [
            TopicId::MessageDelivery,
            TopicId::RegistrationRequest,
            TopicId::RegistrationResponse,
        ]
        .into_iter()
        .find(|t| t.as_str() == topic || t.path() == topic)
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
