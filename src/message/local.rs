use std::thread;

use core_affinity::{get_core_ids, set_for_current};
use crossbeam_channel::{unbounded, Sender};
use log::{debug, error};

use super::comm::Communicator;
use super::mailbox::Mailbox;
use super::tag::{Envelope, Tag};
use crate::error::{Error, Result};

/// One rank of an in-process group. Every rank holds a sender into every
/// other rank's mailbox, so the group can be run on threads of a single
/// process with exactly the message semantics of the TCP transport.
///
pub struct LocalCommunicator {
    rank: usize,
    peers: Vec<Sender<Envelope>>,
    mailbox: Mailbox,
}

impl LocalCommunicator {
    /// Create the communicators of a group with the given number of ranks,
    /// in rank order.
    ///
    pub fn group(size: usize) -> Vec<LocalCommunicator> {
        let (sinks, sources): (Vec<_>, Vec<_>) = (0..size).map(|_| unbounded()).unzip();

        sources
            .into_iter()
            .enumerate()
            .map(|(rank, src)| LocalCommunicator {
                rank,
                peers: sinks.clone(),
                mailbox: Mailbox::new(src),
            })
            .collect()
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, rank: usize, tag: Tag, message: Vec<u8>) -> Result<()> {
        let envelope = Envelope {
            source: self.rank,
            tag,
            data: message,
        };
        self.peers
            .get(rank)
            .ok_or_else(|| Error::Transport(format!("no process with rank {}", rank)))?
            .send(envelope)
            .map_err(|_| Error::Transport(format!("process {} is gone", rank)))
    }

    fn recv(&self, source: usize, tag: Tag) -> Result<Vec<u8>> {
        self.mailbox.take(source, tag)
    }

    fn abort(&self, reason: &str) {
        for (rank, peer) in self.peers.iter().enumerate() {
            if rank != self.rank {
                let _ = peer.send(Envelope {
                    source: self.rank,
                    tag: Tag::Abort,
                    data: reason.as_bytes().to_vec(),
                });
            }
        }
    }
}

impl Drop for LocalCommunicator {
    fn drop(&mut self) {
        if thread::panicking() {
            self.abort("panicked");
        }
    }
}

/// Run `f` on every rank of a fresh in-process group, one thread per rank,
/// and return the results in rank order. Threads are pinned round-robin to
/// the available cores. A panic on any rank aborts the others and is
/// resumed on the calling thread.
///
pub fn run<F, T>(size: usize, f: F) -> Vec<T>
where
    F: Fn(LocalCommunicator) -> T + Sync,
    T: Send,
{
    let core_ids = get_core_ids().unwrap_or_default();
    let f = &f;

    thread::scope(|scope| {
        let handles: Vec<_> = LocalCommunicator::group(size)
            .into_iter()
            .map(|comm| {
                let core_id = core_ids.get(comm.rank() % core_ids.len().max(1)).cloned();
                scope.spawn(move || {
                    if let Some(core_id) = core_id {
                        set_for_current(core_id);
                    }
                    debug!("[{}] local rank started", comm.rank());
                    f(comm)
                })
            })
            .collect();

        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| match handle.join() {
                Ok(result) => result,
                Err(panic) => {
                    error!("[{}] local rank panicked", rank);
                    std::panic::resume_unwind(panic)
                }
            })
            .collect()
    })
}




// ============================================================================
#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ranks_talk_to_each_other() {
        let results = run(3, |comm| {
            let next = (comm.rank() + 1) % comm.size();
            let prev = (comm.rank() + comm.size() - 1) % comm.size();
            comm.send(next, Tag::GoAhead, vec![comm.rank() as u8]).unwrap();
            comm.recv(prev, Tag::GoAhead).unwrap()[0] as usize
        });
        assert_eq!(results, vec![2, 0, 1]);
    }

    #[test]
    fn abort_unblocks_waiting_peers() {
        let results = run(3, |comm| {
            if comm.rank() == 1 {
                comm.abort("bad input");
                Ok(Vec::new())
            } else {
                comm.recv(1, Tag::Output)
            }
        });
        assert!(matches!(results[0], Err(Error::Aborted { rank: 1, .. })));
        assert!(matches!(results[2], Err(Error::Aborted { rank: 1, .. })));
    }
}
