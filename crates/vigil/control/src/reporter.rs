//! Answers status and health requests arriving over the bus.

use serde::{Deserialize, Serialize};
use tracing::debug;
use vigil_state::{DropletRegistry, InstanceState};
use vigil_types::{DropletId, Timestamp};

use crate::bus::BusMessage;
use crate::error::ControlResult;

/// `healthmanager.status` request.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StatusRequest {
    pub droplet: DropletId,
    pub state: InstanceState,
}

/// `healthmanager.status` reply.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StatusReply {
    pub indices: Vec<u32>,
}

/// One droplet/version pair of a health request.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthQuery {
    pub droplet: DropletId,
    pub version: String,
}

/// `healthmanager.health` request.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthRequest {
    pub droplets: Vec<HealthQuery>,
}

/// Alive instance count of one droplet version.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HealthEntry {
    pub droplet: DropletId,
    pub version: String,
    pub healthy: usize,
}

/// Read-only view over the registry for request/reply introspection.
#[derive(Debug, Default)]
pub struct Reporter;

impl Reporter {
    pub fn new() -> Self {
        Self
    }

    pub fn status(&self, request: &StatusRequest, registry: &DropletRegistry) -> StatusReply {
        let indices = registry
            .get(&request.droplet)
            .map(|d| d.indices_in_state(request.state))
            .unwrap_or_default();
        StatusReply { indices }
    }

    pub fn health(
        &self,
        request: &HealthRequest,
        registry: &DropletRegistry,
        now: Timestamp,
    ) -> Vec<HealthEntry> {
        request
            .droplets
            .iter()
            .map(|query| HealthEntry {
                droplet: query.droplet.clone(),
                version: query.version.clone(),
                healthy: registry
                    .get(&query.droplet)
                    .map(|d| d.alive_count(&query.version, now))
                    .unwrap_or(0),
            })
            .collect()
    }

    /// Build the reply to a status request, if it asked for one.
    pub fn reply_status(
        &self,
        message: &BusMessage,
        registry: &DropletRegistry,
    ) -> ControlResult<Option<BusMessage>> {
        let request: StatusRequest = message.decode()?;
        let reply = self.status(&request, registry);
        Self::reply(message, &reply)
    }

    /// Build the reply to a health request, if it asked for one.
    pub fn reply_health(
        &self,
        message: &BusMessage,
        registry: &DropletRegistry,
        now: Timestamp,
    ) -> ControlResult<Option<BusMessage>> {
        let request: HealthRequest = message.decode()?;
        let reply = self.health(&request, registry, now);
        Self::reply(message, &reply)
    }

    fn reply<T: Serialize>(message: &BusMessage, body: &T) -> ControlResult<Option<BusMessage>> {
        let Some(inbox) = message.reply_to.as_deref() else {
            debug!(topic = %message.topic, "Request without reply subject, dropping answer");
            return Ok(None);
        };
        Ok(Some(BusMessage::json(inbox, body)?))
    }
}
