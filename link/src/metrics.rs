use crate::{
    endpoint::Identity,
    observer::{Observer, Reason},
};
use bytes::Bytes;
use prometheus_client::{
    encoding::{text::encode, EncodeLabelSet},
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use std::time::SystemTime;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Interface {
    pub node: String,
    pub interface: String,
}

impl Interface {
    pub fn new(endpoint: &Identity) -> Self {
        Self {
            node: endpoint.node.to_string(),
            interface: endpoint.interface.to_string(),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Dropped {
    pub node: String,
    pub interface: String,
    pub reason: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct LinkState {
    pub node: String,
    pub interface: String,
    pub state: String,
}

/// Frame and link counters, exported through a [Registry].
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    transmitted_frames: Family<Interface, Counter>,
    transmitted_bytes: Family<Interface, Counter>,
    received_frames: Family<Interface, Counter>,
    received_bytes: Family<Interface, Counter>,
    dropped_frames: Family<Dropped, Counter>,
    link_changes: Family<LinkState, Counter>,
}

impl Metrics {
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "transmitted_frames",
            "Total number of frames put on the wire",
            metrics.transmitted_frames.clone(),
        );
        registry.register(
            "transmitted_bytes",
            "Total number of bytes put on the wire",
            metrics.transmitted_bytes.clone(),
        );
        registry.register(
            "received_frames",
            "Total number of frames accepted by an endpoint",
            metrics.received_frames.clone(),
        );
        registry.register(
            "received_bytes",
            "Total number of bytes accepted by an endpoint",
            metrics.received_bytes.clone(),
        );
        registry.register(
            "dropped_frames",
            "Total number of frames discarded",
            metrics.dropped_frames.clone(),
        );
        registry.register(
            "link_changes",
            "Total number of link state changes",
            metrics.link_changes.clone(),
        );
        metrics
    }

    pub fn transmitted_frames(&self, endpoint: &Identity) -> u64 {
        self.transmitted_frames
            .get_or_create(&Interface::new(endpoint))
            .get()
    }

    pub fn received_frames(&self, endpoint: &Identity) -> u64 {
        self.received_frames
            .get_or_create(&Interface::new(endpoint))
            .get()
    }

    pub fn dropped_frames(&self, endpoint: &Identity, reason: Reason) -> u64 {
        self.dropped_frames
            .get_or_create(&Dropped {
                node: endpoint.node.to_string(),
                interface: endpoint.interface.to_string(),
                reason: reason.to_string(),
            })
            .get()
    }
}

impl Observer for Metrics {
    fn transmit_begin(&mut self, _time: SystemTime, endpoint: &Identity, frame: &Bytes) {
        let label = Interface::new(endpoint);
        self.transmitted_frames.get_or_create(&label).inc();
        self.transmitted_bytes
            .get_or_create(&label)
            .inc_by(frame.len() as u64);
    }

    fn receive(&mut self, _time: SystemTime, endpoint: &Identity, frame: &Bytes) {
        let label = Interface::new(endpoint);
        self.received_frames.get_or_create(&label).inc();
        self.received_bytes
            .get_or_create(&label)
            .inc_by(frame.len() as u64);
    }

    fn dropped(&mut self, _time: SystemTime, endpoint: &Identity, _frame: &Bytes, reason: Reason) {
        self.dropped_frames
            .get_or_create(&Dropped {
                node: endpoint.node.to_string(),
                interface: endpoint.interface.to_string(),
                reason: reason.to_string(),
            })
            .inc();
    }

    fn link_state_change(&mut self, _time: SystemTime, endpoint: &Identity, up: bool) {
        self.link_changes
            .get_or_create(&LinkState {
                node: endpoint.node.to_string(),
                interface: endpoint.interface.to_string(),
                state: if up { "up" } else { "down" }.to_string(),
            })
            .inc();
    }
}

/// Render every metric in `registry` in the text exposition format.
pub fn render(registry: &Registry) -> String {
    let mut buffer = String::new();
    encode(&mut buffer, registry).expect("encoding failed");
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Address;
    use commonware_macros::test_traced;
    use std::time::UNIX_EPOCH;

    #[test_traced]
    fn test_counters_are_exported() {
        let mut registry = Registry::default();
        let mut metrics = Metrics::init(&mut registry);
        let endpoint = Identity {
            node: 3,
            interface: 1,
            address: Address::from_u64(1),
        };
        let frame = Bytes::from_static(&[0u8; 64]);
        metrics.transmit_begin(UNIX_EPOCH, &endpoint, &frame);
        metrics.transmit_begin(UNIX_EPOCH, &endpoint, &frame);
        metrics.dropped(UNIX_EPOCH, &endpoint, &frame, Reason::QueueFull);
        metrics.link_state_change(UNIX_EPOCH, &endpoint, true);

        assert_eq!(metrics.transmitted_frames(&endpoint), 2);
        assert_eq!(metrics.dropped_frames(&endpoint, Reason::QueueFull), 1);
        assert_eq!(metrics.dropped_frames(&endpoint, Reason::Corrupt), 0);

        let rendered = render(&registry);
        assert!(rendered.contains(r#"transmitted_bytes_total{node="3",interface="1"} 128"#));
        assert!(rendered.contains(r#"reason="queue_full""#));
        assert!(rendered.contains(r#"state="up""#));
    }
}
