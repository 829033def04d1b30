use std::collections::HashMap;

use tracing::debug;

use crate::error::RouteError;
use crate::event::DomainEvent;

use super::Channel;

/// Static map from event type name to channel.
///
/// Built once at startup by `ChannelRouterBuilder`; every route and the
/// default name a registered channel.
pub struct ChannelRouter<Tx> {
    channels: HashMap<String, Channel<Tx>>,
    routes: HashMap<String, String>,
    default_channel: Option<String>,
}

impl<Tx> ChannelRouter<Tx> {
    pub fn builder() -> ChannelRouterBuilder<Tx> {
        ChannelRouterBuilder::new()
    }

    /// The channel for `event_type`: its explicit route, else the default.
    pub fn route(&self, event_type: &str) -> Result<&Channel<Tx>, RouteError> {
        let name = self
            .routes
            .get(event_type)
            .or(self.default_channel.as_ref())
            .ok_or_else(|| RouteError::NoRouteAndNoDefault(event_type.to_string()))?;

        debug!(event_type, channel = %name, "Routed event");
        self.channels
            .get(name)
            .ok_or_else(|| RouteError::UnknownChannel(name.clone()))
    }

    pub fn channel(&self, name: &str) -> Option<&Channel<Tx>> {
        self.channels.get(name)
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel<Tx>> {
        self.channels.values()
    }
}

/// Assembles a `ChannelRouter`.
///
/// ```ignore
/// let router = ChannelRouter::builder()
///     .channel(Channel::outbox("outbox", OutboxChannel::new(store.clone())))
///     .channel(Channel::broker("audit", BrokerChannel::new(kafka)))
///     .route::<AuditRecorded>("audit")
///     .default_channel("outbox")
///     .build()?;
/// ```
pub struct ChannelRouterBuilder<Tx> {
    channels: Vec<Channel<Tx>>,
    routes: Vec<(String, String)>,
    default_channel: Option<String>,
}

impl<Tx> Default for ChannelRouterBuilder<Tx> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Tx> ChannelRouterBuilder<Tx> {
    pub fn new() -> Self {
        Self {
            channels: Vec::new(),
            routes: Vec::new(),
            default_channel: None,
        }
    }

    pub fn channel(mut self, channel: Channel<Tx>) -> Self {
        self.channels.push(channel);
        self
    }

    /// Route `E` to the named channel.
    pub fn route<E: DomainEvent>(self, channel: &str) -> Self {
        self.route_type(E::EVENT_TYPE, channel)
    }

    /// Route an event type name to the named channel. A later route for the
    /// same type replaces the earlier one.
    pub fn route_type(mut self, event_type: &str, channel: &str) -> Self {
        self.routes.push((event_type.to_string(), channel.to_string()));
        self
    }

    pub fn default_channel(mut self, channel: &str) -> Self {
        self.default_channel = Some(channel.to_string());
        self
    }

    pub fn build(self) -> Result<ChannelRouter<Tx>, RouteError> {
        let mut channels = HashMap::with_capacity(self.channels.len());
        for channel in self.channels {
            let name = channel.name().to_string();
            if channels.insert(name.clone(), channel).is_some() {
                return Err(RouteError::DuplicateChannel(name));
            }
        }

        let mut routes = HashMap::with_capacity(self.routes.len());
        for (event_type, channel) in self.routes {
            if !channels.contains_key(&channel) {
                return Err(RouteError::UnknownChannel(channel));
            }
            routes.insert(event_type, channel);
        }

        if let Some(default) = &self.default_channel {
            if !channels.contains_key(default) {
                return Err(RouteError::UnknownChannel(default.clone()));
            }
        }

        Ok(ChannelRouter {
            channels,
            routes,
            default_channel: self.default_channel,
        })
    }
}
