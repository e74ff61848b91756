//! Simulation orchestrator.
//!
//! Owns the virtual clock, the radio environment and the nodes, and drives
//! the cooperative step loop: advance time, tick every node, put drained
//! frames on the air, deliver frames whose airtime elapsed, and collect the
//! events the step produced.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::Serialize;

use crate::protocol::node::{LogEntry, Node, NodeSnapshot};
use crate::protocol::packet::payload_type_name;
use crate::simulation::clock::VirtualClock;
use crate::simulation::radio::{LinkConfig, RadioEnvironment};

/// Default step granularity.
pub const DEFAULT_TICK_MS: u64 = 10;

/// One observable simulation event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SimEvent {
    /// A node produced a log entry.
    Log {
        node: String,
        at_ms: u64,
        tag: &'static str,
        text: String,
    },
    /// A node put a frame on the air.
    PacketTx {
        from: String,
        targets: Vec<String>,
        payload_type: &'static str,
        at_ms: u64,
    },
    /// A frame arrived at a node.
    PacketRx {
        from: String,
        to: String,
        rssi: i16,
        at_ms: u64,
    },
}

/// Serializable snapshot of the whole simulation.
#[derive(Serialize)]
pub struct SimState {
    pub time_ms: u64,
    pub nodes: Vec<NodeSnapshot>,
    pub links: Vec<LinkState>,
}

#[derive(Serialize)]
pub struct LinkState {
    pub node_a: String,
    pub node_b: String,
    #[serde(flatten)]
    pub config: LinkConfig,
}

/// Multi-node mesh simulation.
pub struct SimRunner {
    pub clock: VirtualClock,
    pub radio: RadioEnvironment,
    nodes: BTreeMap<String, Node>,
    /// Everything observed since construction.
    pub events: Vec<SimEvent>,
    pub tick_ms: u64,
    master_rng: StdRng,
}

impl SimRunner {
    /// Build an empty simulation. All randomness (identities, TX jitter,
    /// shadowing) derives from `seed`, so a run is reproducible.
    pub fn new(seed: u64) -> SimRunner {
        let clock = VirtualClock::new();
        let mut master_rng = StdRng::seed_from_u64(seed);
        let radio = RadioEnvironment::new(clock.clone(), master_rng.next_u64());
        SimRunner {
            clock,
            radio,
            nodes: BTreeMap::new(),
            events: Vec::new(),
            tick_ms: DEFAULT_TICK_MS,
            master_rng,
        }
    }

    pub fn add_repeater(&mut self, name: &str) -> &mut Node {
        let node = Node::new_repeater(name, self.clock.clone(), &mut self.master_rng);
        self.nodes.insert(name.to_string(), node);
        self.nodes.get_mut(name).expect("node was just inserted")
    }

    pub fn add_companion(&mut self, name: &str) -> &mut Node {
        let node = Node::new_companion(name, self.clock.clone(), &mut self.master_rng);
        self.nodes.insert(name.to_string(), node);
        self.nodes.get_mut(name).expect("node was just inserted")
    }

    pub fn remove_node(&mut self, name: &str) {
        self.nodes.remove(name);
        self.radio.remove_node(name);
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes.get_mut(name)
    }

    pub fn node_names(&self) -> impl Iterator<Item = &String> {
        self.nodes.keys()
    }

    pub fn set_link(&mut self, a: &str, b: &str, rssi: i16, snr: i16) {
        self.radio.set_link(a, b, rssi, snr);
    }

    pub fn remove_link(&mut self, a: &str, b: &str) {
        self.radio.remove_link(a, b);
    }

    /// Hand a CLI command line to a node.
    pub fn inject_command(&mut self, node_name: &str, line: &str) -> String {
        match self.nodes.get_mut(node_name) {
            Some(node) => node.process_command(line),
            None => format!("Node '{node_name}' not found"),
        }
    }

    /// Run one simulation step and return the events it produced.
    pub fn run_step(&mut self, tick_ms: u64) -> Vec<SimEvent> {
        let mut step_events = Vec::new();

        self.clock.advance(tick_ms);
        let now = self.clock.millis();

        // Tick every node and put its drained frames on the air.
        for (name, node) in self.nodes.iter_mut() {
            for pkt in node.tick() {
                let targets = self.radio.transmit(name, &pkt);
                if !targets.is_empty() {
                    step_events.push(SimEvent::PacketTx {
                        from: name.clone(),
                        targets,
                        payload_type: payload_type_name(pkt.payload_type()),
                        at_ms: now,
                    });
                }
            }
        }

        // Deliver frames whose airtime has elapsed.
        for frame in self.radio.take_due() {
            for target in &frame.targets {
                if let Some(node) = self.nodes.get_mut(&target.name) {
                    node.on_rx_frame(&frame.bytes, target.rssi, target.snr);
                    step_events.push(SimEvent::PacketRx {
                        from: frame.sender.clone(),
                        to: target.name.clone(),
                        rssi: target.rssi,
                        at_ms: now,
                    });
                }
            }
        }

        // Collect node logs produced during this step.
        for (name, node) in self.nodes.iter_mut() {
            for LogEntry { at_ms, tag, text } in node.events.drain() {
                step_events.push(SimEvent::Log {
                    node: name.clone(),
                    at_ms,
                    tag,
                    text,
                });
            }
        }

        self.events.extend(step_events.iter().cloned());
        step_events
    }

    /// Run for a simulated duration at the configured tick granularity.
    pub fn run(&mut self, duration_ms: u64) {
        let end = self.clock.millis() + duration_ms;
        while self.clock.millis() < end {
            self.run_step(self.tick_ms);
        }
    }

    /// Full state snapshot for the shell.
    pub fn state(&self) -> SimState {
        SimState {
            time_ms: self.clock.millis(),
            nodes: self.nodes.values().map(Node::snapshot).collect(),
            links: self
                .radio
                .links()
                .map(|((a, b), config)| LinkState {
                    node_a: a.clone(),
                    node_b: b.clone(),
                    config: *config,
                })
                .collect(),
        }
    }
}
