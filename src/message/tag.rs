use serde::{Deserialize, Serialize};

/// Which of the two node schedules a message belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeClass {
    Dangling,
    Anchored,
}

/// The quantity carried by an exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Payload {
    Mass,
    Force,
    Displacement,
}

/// Harborers send partial values to owners (`Contribute`, accumulated with
/// `+=`), or owners send authoritative values to harborers (`Share`,
/// overwritten with `=`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Contribute,
    Share,
}

/// A typed exchange channel. Two exchanges in flight at the same time never
/// share a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Channel {
    pub nodes: NodeClass,
    pub payload: Payload,
    pub direction: Direction,
}

impl Channel {
    pub fn new(nodes: NodeClass, payload: Payload, direction: Direction) -> Self {
        Self {
            nodes,
            payload,
            direction,
        }
    }
}

/// Message tags. Receives match on the (source, tag) pair, and messages
/// with the same pair are delivered in the order they were sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tag {
    Exchange(Channel),
    Broadcast,
    Reduce,
    Gather,
    GoAhead,
    Output,
    Abort,
}

/// What actually travels between processes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub source: usize,
    pub tag: Tag,
    pub data: Vec<u8>,
}
