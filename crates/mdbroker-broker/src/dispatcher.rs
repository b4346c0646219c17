//! Round-robin dispatch of queued requests to healthy workers

use mdbroker_core::{Frame, Multipart, PeerAddress, Service, Worker};
use std::collections::HashMap;

/// A queued request bound to the worker that will receive it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// Worker identity
    pub worker: PeerAddress,
    /// Where the request is sent
    pub inbound_address: PeerAddress,
    /// Request envelope: `[client, "", correlation id, ...body]`
    pub envelope: Multipart,
}

/// Pair pending requests with healthy workers, oldest request first
///
/// Each chosen worker moves to the back of the service's rotation, so no
/// healthy worker gets a second request while another healthy worker is
/// still waiting for its turn. Requests stay queued when no worker is healthy.
pub fn assign(service: &mut Service, workers: &HashMap<PeerAddress, Worker>) -> Vec<Assignment> {
    let mut assignments = Vec::new();

    while !service.pending_requests.is_empty() {
        let Some(position) = service
            .workers
            .iter()
            .position(|id| workers.get(id).is_some_and(Worker::is_healthy))
        else {
            break;
        };
        let (Some(identity), Some(envelope)) = (
            service.workers.remove(position),
            service.pending_requests.pop_front(),
        ) else {
            break;
        };

        let inbound_address = workers
            .get(&identity)
            .map(|w| w.inbound_address.clone())
            .unwrap_or_default();
        service.workers.push_back(identity.clone());

        assignments.push(Assignment {
            worker: identity,
            inbound_address,
            envelope,
        });
    }

    assignments
}

/// Correlation id carried in a request envelope, for logging
pub fn correlation_id(envelope: &[Frame]) -> String {
    envelope
        .get(2)
        .map(|f| String::from_utf8_lossy(f).into_owned())
        .unwrap_or_else(|| "-".to_string())
}
