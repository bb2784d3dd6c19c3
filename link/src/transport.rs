//! In-process [Transport] connecting contexts that run on separate threads.

use crate::router::{Remote, System, Transport, Unreachable, MAX_REMOTE_FRAME};
use bytes::Bytes;
use commonware_codec::{Decode as _, Encode as _, Error};
use futures::channel::mpsc;
use std::collections::BTreeMap;
use tracing::{trace, warn};

/// Sending half held by one context: a channel to every other context.
pub struct Channel {
    system: System,
    peers: BTreeMap<System, mpsc::UnboundedSender<Bytes>>,
}

/// Receiving half held by one context.
pub struct Inbox {
    system: System,
    receiver: mpsc::UnboundedReceiver<Bytes>,
}

/// Build a fully connected set of channels for `systems` contexts. Entry `i`
/// belongs to context `i`.
pub fn mesh(systems: u32) -> Vec<(Channel, Inbox)> {
    let (senders, receivers): (Vec<_>, Vec<_>) =
        (0..systems).map(|_| mpsc::unbounded::<Bytes>()).unzip();
    receivers
        .into_iter()
        .enumerate()
        .map(|(index, receiver)| {
            let system = index as System;
            let peers = senders
                .iter()
                .enumerate()
                .filter(|(peer, _)| *peer != index)
                .map(|(peer, sender)| (peer as System, sender.clone()))
                .collect();
            (Channel { system, peers }, Inbox { system, receiver })
        })
        .collect()
}

impl Channel {
    pub fn system(&self) -> System {
        self.system
    }
}

impl Transport for Channel {
    fn send(&mut self, system: System, message: Remote) -> Result<(), Unreachable> {
        let Some(peer) = self.peers.get(&system) else {
            panic!("context {} has no channel to context {system}", self.system);
        };
        let encoded = message.encode().freeze();
        trace!(from = self.system, to = system, len = encoded.len(), "sending");
        peer.unbounded_send(encoded).map_err(|err| {
            warn!(from = self.system, to = system, ?err, "peer hung up");
            Unreachable(system)
        })
    }
}

impl Inbox {
    pub fn system(&self) -> System {
        self.system
    }

    /// Take every message that has arrived so far, without blocking.
    ///
    /// Messages are returned in arrival order. One that fails to decode
    /// yields its error in place and does not affect the others.
    pub fn drain(&mut self) -> Vec<Result<Remote, Error>> {
        let mut messages = Vec::new();
        while let Ok(Some(encoded)) = self.receiver.try_next() {
            let decoded = Remote::decode_cfg(encoded, &MAX_REMOTE_FRAME);
            if let Err(err) = &decoded {
                warn!(system = self.system, ?err, "malformed remote message");
            }
            messages.push(decoded);
        }
        messages
    }
}
