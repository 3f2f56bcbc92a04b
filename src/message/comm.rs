use super::tag::Tag;
use super::util;
use crate::error::{Error, Result};

/// Elementwise reduction operators for the typed collectives.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    Min,
    Max,
    Sum,
}

impl ReduceOp {
    pub fn apply_f64(self, a: f64, b: f64) -> f64 {
        match self {
            ReduceOp::Min => a.min(b),
            ReduceOp::Max => a.max(b),
            ReduceOp::Sum => a + b,
        }
    }

    pub fn apply_u64(self, a: u64, b: u64) -> u64 {
        match self {
            ReduceOp::Min => a.min(b),
            ReduceOp::Max => a.max(b),
            ReduceOp::Sum => a + b,
        }
    }
}

/// Interface for a group of processes that can exchange messages over a
/// network. The underlying transport can in principle be TCP, UDP, or a
/// higher level abstraction like MPI.
///
pub trait Communicator {
    /// Must be implemented to return the rank of this process within the
    /// communicator.
    fn rank(&self) -> usize;

    /// Must be implemented to return the number of peers processes in this
    /// communicator.
    fn size(&self) -> usize;

    /// Must be implemented to send a message to a peer. This method must
    /// return immediately, in other words it is not allowed to block until a
    /// matching receive is posted.
    fn send(&self, rank: usize, tag: Tag, message: Vec<u8>) -> Result<()>;

    /// Must be implemented to receive the next message from the given peer
    /// with the given tag. This method is allowed to block until the message
    /// arrives. Messages from other (source, tag) pairs that arrive in the
    /// meantime are kept for later receives.
    fn recv(&self, source: usize, tag: Tag) -> Result<Vec<u8>>;

    /// Must be implemented to notify every other process that this one has
    /// hit a fatal condition. Peers blocked in `recv` return
    /// `Error::Aborted`.
    fn abort(&self, reason: &str);

    /// Implements a binomial tree broadcast from rank 0. The message buffer
    /// must be `Some` if this is the root node, and it must be `None`
    /// otherwise.
    ///
    fn broadcast(&self, value: Option<Vec<u8>>) -> Result<Vec<u8>> {
        let r = self.rank();
        let p = self.size();

        let value = match value {
            Some(value) => value,
            None if r == 0 => {
                return Err(Error::Transport("broadcast root has no value".into()))
            }
            None => self.recv(r - util::lowest_bit(r), Tag::Broadcast)?,
        };
        for level in (0..util::ceil_log2(p)).rev() {
            let one = 1 << level;
            let two = 1 << (level + 1);

            if r % two == 0 && r + one < p {
                self.send(r + one, Tag::Broadcast, value.clone())?
            }
        }
        Ok(value)
    }

    /// Implements a binomial tree reduce to rank 0. All ranks return `None`
    /// except for the root.
    ///
    fn reduce<F>(&self, f: F, mut value: Vec<u8>) -> Result<Option<Vec<u8>>>
    where
        F: Fn(Vec<u8>, Vec<u8>) -> Result<Vec<u8>>,
    {
        let r = self.rank();
        let p = self.size();

        for level in 0..util::ceil_log2(p) {
            let one = 1 << level;
            let two = 1 << (level + 1);

            if r % two == 0 {
                if r + one < p {
                    value = f(value, self.recv(r + one, Tag::Reduce)?)?
                }
            } else {
                self.send(r - one, Tag::Reduce, value)?;
                return Ok(None);
            }
        }
        Ok(Some(value))
    }

    /// Implements an all-reduce (symmetric fold) operation over a commutative
    /// binary operator.
    ///
    fn all_reduce<F>(&self, f: F, value: Vec<u8>) -> Result<Vec<u8>>
    where
        F: Fn(Vec<u8>, Vec<u8>) -> Result<Vec<u8>>,
    {
        let reduced = self.reduce(f, value)?;
        self.broadcast(reduced)
    }

    /// Collect one message from every rank at rank 0, in rank order. Other
    /// ranks return `None`.
    ///
    fn gather(&self, value: Vec<u8>) -> Result<Option<Vec<Vec<u8>>>> {
        if self.rank() == 0 {
            let mut values = Vec::with_capacity(self.size());
            values.push(value);
            for source in 1..self.size() {
                values.push(self.recv(source, Tag::Gather)?);
            }
            Ok(Some(values))
        } else {
            self.send(0, Tag::Gather, value)?;
            Ok(None)
        }
    }

    /// Block until every process has entered the barrier.
    ///
    fn barrier(&self) -> Result<()> {
        self.all_reduce(|a, _| Ok(a), Vec::new()).map(|_| ())
    }

    /// Reduce a slice of doubles elementwise onto every rank.
    ///
    fn all_reduce_f64s(&self, op: ReduceOp, values: &[f64]) -> Result<Vec<f64>> {
        let combine = |a: Vec<u8>, b: Vec<u8>| -> Result<Vec<u8>> {
            let a = util::f64s_from_bytes(&a)?;
            let b = util::f64s_from_bytes(&b)?;
            if a.len() != b.len() {
                return Err(Error::Transport("reduction operands differ in length".into()));
            }
            let c: Vec<f64> = a.iter().zip(&b).map(|(x, y)| op.apply_f64(*x, *y)).collect();
            Ok(util::f64s_to_bytes(&c))
        };
        let bytes = self.all_reduce(combine, util::f64s_to_bytes(values))?;
        util::f64s_from_bytes(&bytes)
    }

    fn all_reduce_f64(&self, op: ReduceOp, value: f64) -> Result<f64> {
        Ok(self.all_reduce_f64s(op, &[value])?[0])
    }

    fn all_reduce_u64(&self, op: ReduceOp, value: u64) -> Result<u64> {
        let combine = |a: Vec<u8>, b: Vec<u8>| -> Result<Vec<u8>> {
            let c = op.apply_u64(util::u64_from_bytes(&a)?, util::u64_from_bytes(&b)?);
            Ok(c.to_le_bytes().to_vec())
        };
        let bytes = self.all_reduce(combine, value.to_le_bytes().to_vec())?;
        util::u64_from_bytes(&bytes)
    }

    /// Turn a local outcome into a group-wide one: if any process failed,
    /// every process returns an error. The failing process keeps its own
    /// error, the others get `Error::PeerFailed`.
    ///
    fn agree<T>(&self, local: Result<T>, operation: &'static str) -> Result<T> {
        let failed = self.all_reduce_u64(ReduceOp::Max, local.is_err() as u64)?;
        match local {
            Err(e) => Err(e),
            Ok(_) if failed != 0 => Err(Error::PeerFailed { operation }),
            Ok(value) => Ok(value),
        }
    }
}

impl<C: Communicator + ?Sized> Communicator for &C {
    fn rank(&self) -> usize {
        (**self).rank()
    }

    fn size(&self) -> usize {
        (**self).size()
    }

    fn send(&self, rank: usize, tag: Tag, message: Vec<u8>) -> Result<()> {
        (**self).send(rank, tag, message)
    }

    fn recv(&self, source: usize, tag: Tag) -> Result<Vec<u8>> {
        (**self).recv(source, tag)
    }

    fn abort(&self, reason: &str) {
        (**self).abort(reason)
    }
}




// ============================================================================
#[cfg(test)]
mod test {
    use super::*;
    use crate::message::local;

    #[test]
    fn broadcast_reaches_every_rank() {
        for size in 1..=7 {
            let results = local::run(size, |comm| {
                let value = if comm.rank() == 0 {
                    Some(vec![42, 7])
                } else {
                    None
                };
                comm.broadcast(value).unwrap()
            });
            assert!(results.iter().all(|v| v == &vec![42, 7]));
        }
    }

    #[test]
    fn reduce_sums_at_the_root_only() {
        for size in 1..=9 {
            let results = local::run(size, |comm| {
                let value = (comm.rank() as u64 + 1).to_le_bytes().to_vec();
                comm.reduce(
                    |a, b| {
                        let c = util::u64_from_bytes(&a)? + util::u64_from_bytes(&b)?;
                        Ok(c.to_le_bytes().to_vec())
                    },
                    value,
                )
                .unwrap()
            });
            let expected = (size * (size + 1) / 2) as u64;
            assert_eq!(util::u64_from_bytes(results[0].as_ref().unwrap()).unwrap(), expected);
            assert!(results[1..].iter().all(Option::is_none));
        }
    }

    #[test]
    fn typed_all_reduce_agrees_everywhere() {
        let results = local::run(5, |comm| {
            let x = comm.rank() as f64 - 1.5;
            (
                comm.all_reduce_f64(ReduceOp::Min, x).unwrap(),
                comm.all_reduce_f64(ReduceOp::Max, x).unwrap(),
                comm.all_reduce_u64(ReduceOp::Sum, comm.rank() as u64).unwrap(),
            )
        });
        for r in results {
            assert_eq!(r, (-1.5, 2.5, 10));
        }
    }

    #[test]
    fn gather_collects_in_rank_order() {
        let results = local::run(4, |comm| {
            comm.barrier().unwrap();
            comm.gather(vec![comm.rank() as u8]).unwrap()
        });
        assert_eq!(results[0], Some(vec![vec![0], vec![1], vec![2], vec![3]]));
        assert!(results[1..].iter().all(Option::is_none));
    }
}
