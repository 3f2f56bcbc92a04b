use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
};

use crossbeam_channel::Receiver;
use log::debug;

use super::tag::{Envelope, Tag};
use crate::error::{Error, Result};

/// The mailbox sits in front of a channel of inbound envelopes and hands
/// them out by (source, tag). Envelopes which arrive before anyone asks for
/// them are kept until a matching receive is made. An `Abort` envelope from
/// any source fails the receive that observes it.
///
pub struct Mailbox {
    inbound: Receiver<Envelope>,
    buffer: RefCell<HashMap<(usize, Tag), VecDeque<Vec<u8>>>>,
}

impl Mailbox {
    pub fn new(inbound: Receiver<Envelope>) -> Self {
        Self {
            inbound,
            buffer: RefCell::new(HashMap::new()),
        }
    }

    /// Block until a message from `source` with the given tag is available.
    ///
    pub fn take(&self, source: usize, tag: Tag) -> Result<Vec<u8>> {
        if let Some(data) = self.pop_buffered(source, tag) {
            return Ok(data);
        }
        loop {
            let envelope = self
                .inbound
                .recv()
                .map_err(|_| Error::Transport("inbound channel closed".into()))?;

            if envelope.tag == Tag::Abort {
                return Err(Error::Aborted {
                    rank: envelope.source,
                    reason: String::from_utf8_lossy(&envelope.data).into_owned(),
                });
            }
            if envelope.source == source && envelope.tag == tag {
                return Ok(envelope.data);
            }
            debug!(
                "buffering message from {} with tag {:?} ({} bytes)",
                envelope.source,
                envelope.tag,
                envelope.data.len()
            );
            self.buffer
                .borrow_mut()
                .entry((envelope.source, envelope.tag))
                .or_insert_with(VecDeque::new)
                .push_back(envelope.data);
        }
    }

    /// Number of messages received but not yet taken.
    ///
    pub fn buffered_len(&self) -> usize {
        self.buffer.borrow().values().map(VecDeque::len).sum()
    }

    fn pop_buffered(&self, source: usize, tag: Tag) -> Option<Vec<u8>> {
        let mut buffer = self.buffer.borrow_mut();
        let queue = buffer.get_mut(&(source, tag))?;
        let data = queue.pop_front();
        if queue.is_empty() {
            buffer.remove(&(source, tag));
        }
        data
    }
}
