use std::{collections::HashMap, io, thread};
use std::{io::prelude::*, thread::JoinHandle};
use std::{
    net::{SocketAddr, TcpListener, TcpStream},
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info, warn};

use super::backoff::{ExponentialBackoff, Retry};
use super::comm::Communicator;
use super::mailbox::Mailbox;
use super::tag::{Envelope, Tag};
use super::util;
use crate::error::{Error, Result};

const CXN_R_TIMEOUT: Duration = Duration::from_secs(30);
const CXN_W_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_WAIT: Duration = Duration::from_millis(250);
const RETRY_MAX_WAIT: Duration = Duration::from_millis(5000);
const RETRY_LIMIT: usize = 12;

type Outbound = (usize, Vec<u8>);

/// Background threads of the TCP transport: one serial sender which owns a
/// connection per peer, and one listener which spawns a reader per accepted
/// connection. Frames are a little-endian u64 length followed by an
/// rmp-encoded `Envelope`, and each frame is acknowledged with its length.
///
pub struct TcpHost {
    listen_thread: Option<JoinHandle<()>>,
    send_thread: Option<JoinHandle<()>>,
}

impl TcpHost {
    pub fn new(rank: usize, peers: Vec<SocketAddr>) -> (Self, Sender<Outbound>, Receiver<Envelope>) {
        let (recv_sink, recv_src) = crossbeam_channel::unbounded();
        let listen_thread = Self::start_listener(rank, peers[rank], recv_sink.clone());

        let (send_sink, send_src) = crossbeam_channel::unbounded();
        let send_thread = Self::start_serial_sender(rank, peers, send_src, recv_sink);

        (
            TcpHost {
                send_thread: Some(send_thread),
                listen_thread: Some(listen_thread),
            },
            send_sink,
            recv_src,
        )
    }

    /// Wait for every queued outbound message to be delivered. Returns once
    /// all senders (the communicator) have been dropped.
    ///
    pub fn join(&mut self) {
        if let Some(handle) = self.send_thread.take() {
            if handle.join().is_err() {
                error!("tcp sender thread panicked");
            }
        }
        // The listener blocks in accept for the lifetime of the process.
        self.listen_thread.take();
    }

    fn start_serial_sender(
        rank: usize,
        peers: Vec<SocketAddr>,
        send_src: Receiver<Outbound>,
        local_sink: Sender<Envelope>,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            let mut table: HashMap<usize, TcpStream> = HashMap::new();

            for (dest, frame) in send_src {
                if let Err(e) = Self::deliver(&mut table, peers[dest], dest, &frame) {
                    error!("[{}] failed to deliver message to {}: {}", rank, peers[dest], e);
                    let _ = local_sink.send(Envelope {
                        source: rank,
                        tag: Tag::Abort,
                        data: format!("cannot reach process {}: {}", dest, e).into_bytes(),
                    });
                }
            }
            debug!("[{}] tcp sender finished", rank);
        })
    }

    /// Write one frame and wait for the acknowledgement. A write that fails
    /// is retried once over a fresh connection; the receiver drops partial
    /// frames, so nothing was delivered. Once the whole frame is out, a
    /// missing or wrong acknowledgement is an error: the frame may have
    /// arrived, and sending it again could deliver it twice.
    ///
    fn deliver(
        table: &mut HashMap<usize, TcpStream>,
        addr: SocketAddr,
        dest: usize,
        frame: &[u8],
    ) -> io::Result<()> {
        let msg_sz = frame.len() as u64;
        let mut attempt = 0;

        loop {
            if !table.contains_key(&dest) {
                table.insert(dest, Self::connect_with_retry(addr)?);
            }
            let client = table
                .get_mut(&dest)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no connection"))?;

            match Self::write_frame(client, frame) {
                Ok(()) => break,
                Err(e) if attempt == 0 => {
                    warn!("send to {} failed ({}), reconnecting", addr, e);
                    table.remove(&dest);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }

        let client = table
            .get_mut(&dest)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no connection"))?;
        let acked = util::read_u64(client).and_then(|ack| {
            if ack != msg_sz {
                Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("sent {} bytes but receiver acked {} bytes", msg_sz, ack),
                ))
            } else {
                Ok(())
            }
        });
        if acked.is_err() {
            table.remove(&dest);
        }
        acked
    }

    fn write_frame(client: &mut TcpStream, frame: &[u8]) -> io::Result<()> {
        client.write_all(&(frame.len() as u64).to_le_bytes())?;
        client.write_all(frame)
    }

    fn start_listener(rank: usize, addr: SocketAddr, recv_sink: Sender<Envelope>) -> JoinHandle<()> {
        thread::spawn(move || {
            info!("[{}] listening to: {}", rank, addr);
            let listener = match TcpListener::bind(addr) {
                Ok(listener) => listener,
                Err(e) => {
                    error!("[{}] cannot bind {}: {}", rank, addr, e);
                    let _ = recv_sink.send(Envelope {
                        source: rank,
                        tag: Tag::Abort,
                        data: format!("cannot bind {}: {}", addr, e).into_bytes(),
                    });
                    return;
                }
            };
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        Self::handle_connection(stream, recv_sink.clone());
                    }
                    Err(e) => warn!("[{}] failed to accept connection: {}", rank, e),
                }
            }
        })
    }

    fn handle_connection(mut stream: TcpStream, recv_sink: Sender<Envelope>) -> JoinHandle<()> {
        let remote = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown peer".into());
        debug!("receiving connection from {}", remote);

        thread::spawn(move || loop {
            let size = match util::read_u64(&mut stream) {
                Ok(size) => size,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!("connection from {} closed", remote);
                    return;
                }
                Err(e) => {
                    error!("connection from {} failed: {}", remote, e);
                    return;
                }
            };
            let result = util::read_bytes_vec(&mut stream, size as usize)
                .and_then(|bytes| {
                    rmp_serde::decode::from_slice::<Envelope>(&bytes)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
                })
                .and_then(|envelope| {
                    recv_sink
                        .send(envelope)
                        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
                })
                .and_then(|()| stream.write_all(&size.to_le_bytes()));

            if let Err(e) = result {
                error!("connection from {} failed: {}", remote, e);
                return;
            }
        })
    }

    fn connect_with_retry(addr: SocketAddr) -> io::Result<TcpStream> {
        debug!("connecting to {}", addr);
        let stream = ExponentialBackoff::new(RETRY_WAIT, RETRY_MAX_WAIT, 2)
            .take(RETRY_LIMIT)
            .retry(
                || TcpStream::connect(addr),
                |e, delay| {
                    debug!("connect to {} failed: {}, retrying in {:?}", addr, e, delay);
                    thread::sleep(delay)
                },
            )
            .unwrap_or_else(|| Err(io::ErrorKind::NotConnected.into()))?;

        stream.set_read_timeout(Some(CXN_R_TIMEOUT))?;
        stream.set_write_timeout(Some(CXN_W_TIMEOUT))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}




// ============================================================================
pub struct TcpCommunicator {
    rank: usize,
    num_peers: usize,
    send_sink: Sender<Outbound>,
    mailbox: Mailbox,
}

impl TcpCommunicator {
    pub fn new(rank: usize, num_peers: usize, send_sink: Sender<Outbound>, recv_src: Receiver<Envelope>) -> Self {
        Self {
            rank,
            num_peers,
            send_sink,
            mailbox: Mailbox::new(recv_src),
        }
    }

    /// Start the host threads for this rank and return them together with a
    /// communicator that uses them.
    ///
    pub fn connect(rank: usize, peers: Vec<SocketAddr>) -> (TcpHost, Self) {
        let num_peers = peers.len();
        let (host, send_sink, recv_src) = TcpHost::new(rank, peers);
        (host, Self::new(rank, num_peers, send_sink, recv_src))
    }

    fn frame(&self, tag: Tag, data: Vec<u8>) -> Result<Vec<u8>> {
        let envelope = Envelope {
            source: self.rank,
            tag,
            data,
        };
        Ok(rmp_serde::encode::to_vec(&envelope)?)
    }
}

impl Communicator for TcpCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.num_peers
    }

    fn send(&self, rank: usize, tag: Tag, message: Vec<u8>) -> Result<()> {
        if rank >= self.num_peers {
            return Err(Error::Transport(format!("no process with rank {}", rank)));
        }
        let frame = self.frame(tag, message)?;
        self.send_sink
            .send((rank, frame))
            .map_err(|_| Error::Transport("tcp sender thread is gone".into()))
    }

    fn recv(&self, source: usize, tag: Tag) -> Result<Vec<u8>> {
        self.mailbox.take(source, tag)
    }

    fn abort(&self, reason: &str) {
        for rank in (0..self.num_peers).filter(|&r| r != self.rank) {
            if let Err(e) = self.send(rank, Tag::Abort, reason.as_bytes().to_vec()) {
                warn!("[{}] could not notify {} of abort: {}", self.rank, rank, e);
            }
        }
    }
}




// ============================================================================
#[cfg(test)]
mod test {
    use super::*;
    use crate::message::comm::ReduceOp;

    fn free_addresses(n: usize) -> Vec<SocketAddr> {
        let listeners: Vec<_> = (0..n)
            .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        listeners.iter().map(|l| l.local_addr().unwrap()).collect()
    }

    #[test]
    fn unacknowledged_frame_is_not_sent_twice() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (frames_sink, frames) = crossbeam_channel::unbounded();

        // A receiver that takes each frame and hangs up without acking.
        thread::spawn(move || {
            for stream in listener.incoming() {
                let mut stream = stream.unwrap();
                let size = util::read_u64(&mut stream).unwrap();
                let bytes = util::read_bytes_vec(&mut stream, size as usize).unwrap();
                frames_sink.send(bytes).unwrap();
            }
        });

        let mut table = HashMap::new();
        let result = TcpHost::deliver(&mut table, addr, 1, b"contribution");

        assert!(result.is_err());
        assert!(table.is_empty());
        assert_eq!(frames.try_iter().collect::<Vec<_>>(), vec![b"contribution".to_vec()]);
    }

    #[test]
    fn tcp_group_reduces() {
        let peers = free_addresses(3);
        let handles: Vec<_> = (0..3)
            .map(|rank| {
                let peers = peers.clone();
                thread::spawn(move || {
                    let (mut host, comm) = TcpCommunicator::connect(rank, peers);
                    let sum = comm.all_reduce_f64(ReduceOp::Sum, rank as f64 + 1.0).unwrap();
                    comm.barrier().unwrap();
                    drop(comm);
                    host.join();
                    sum
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 6.0);
        }
    }
}
