//! Structured security-event logging.
//!
//! Every authentication outcome is emitted as a `tracing` event under
//! the `security` target so deployments can route them to an audit
//! sink independently of application logs. Events carry identifiers
//! and client metadata, never credentials or token values.

use uuid::Uuid;

use crate::store::ClientMeta;

pub(crate) fn success(event: &str, identity_id: Uuid, tenant_id: &str, client: &ClientMeta) {
    tracing::info!(
        target: "security",
        event,
        identity_id = %identity_id,
        tenant_id,
        client.address = %client.address,
        client.agent = client.agent.as_deref().unwrap_or(""),
        "security event"
    );
}

pub(crate) fn failure(event: &str, reason: &str, client: Option<&ClientMeta>) {
    tracing::warn!(
        target: "security",
        event,
        reason,
        client.address = client.map_or("", |meta| meta.address.as_str()),
        "security event"
    );
}

pub(crate) fn event(event: &str) {
    tracing::info!(target: "security", event, "security event");
}

pub(crate) fn identity_event(event: &str, identity_id: Uuid) {
    tracing::info!(
        target: "security",
        event,
        identity_id = %identity_id,
        "security event"
    );
}
