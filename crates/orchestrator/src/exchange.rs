//! Bounded-memory sparse all-to-all for query and result payloads.
//!
//! Per walk iteration the ranks first agree on counts, then move the
//! payloads with non-blocking point-to-point: receives are posted before
//! sends so a backend with a zero-copy fast path can take it, and the caller
//! decides when to block (the primary walk runs between posting and
//! waiting). Only ranks with non-zero counts get requests at all.

use crate::comm::{Communicator, WaitRecv, WaitSend};

/// Tag for query payloads (exports travelling to their evaluating rank).
pub const TAG_QUERY: u16 = 1;
/// Tag for result payloads (travelling back to the owning rank).
pub const TAG_RESULT: u16 = 2;

/// Per-destination element counts and prefix-summed offsets for one
/// iteration's exchange.
#[derive(Debug, Clone)]
pub struct ExchangeLayout {
    /// Elements this rank sends to each peer.
    pub send_count: Vec<usize>,
    /// Element offset of each peer's block in the send buffer.
    pub send_offset: Vec<usize>,
    /// Elements this rank receives from each peer.
    pub recv_count: Vec<usize>,
    /// Element offset of each peer's block in the receive buffer.
    pub recv_offset: Vec<usize>,
    /// Total elements sent.
    pub nexport: usize,
    /// Total elements received.
    pub nimport: usize,
}

/// Exchange per-destination counts and derive the block layout.
pub fn exchange_counts<C: Communicator>(comm: &C, send_count: Vec<usize>) -> ExchangeLayout {
    let n = comm.size();
    assert_eq!(send_count.len(), n);
    let send_u64: Vec<u64> = send_count.iter().map(|&c| c as u64).collect();
    let recv_u64 = comm.alltoall_u64(&send_u64);
    let recv_count: Vec<usize> = recv_u64.iter().map(|&c| c as usize).collect();

    let mut send_offset = vec![0usize; n];
    let mut recv_offset = vec![0usize; n];
    for i in 1..n {
        send_offset[i] = send_offset[i - 1] + send_count[i - 1];
        recv_offset[i] = recv_offset[i - 1] + recv_count[i - 1];
    }
    let nexport = send_count.iter().sum();
    let nimport = recv_count.iter().sum();

    ExchangeLayout {
        send_count,
        send_offset,
        recv_count,
        recv_offset,
        nexport,
        nimport,
    }
}

/// Outstanding receives of one sparse exchange.
pub struct PendingRecvs<H> {
    handles: Vec<(usize, H)>,
    recv_count: Vec<usize>,
    recv_offset: Vec<usize>,
    elsize: usize,
    total: usize,
}

impl<H: WaitRecv> PendingRecvs<H> {
    /// Block until every posted receive lands and assemble the blocks
    /// rank-major at their offsets.
    pub fn complete(self) -> Vec<u8> {
        let mut out = vec![0u8; self.total * self.elsize];
        for (peer, handle) in self.handles {
            let bytes = handle.wait();
            debug_assert_eq!(bytes.len(), self.recv_count[peer] * self.elsize);
            let start = self.recv_offset[peer] * self.elsize;
            out[start..start + bytes.len()].copy_from_slice(&bytes);
        }
        out
    }
}

/// Outstanding sends of one sparse exchange.
pub struct PendingSends<H> {
    handles: Vec<H>,
}

impl<H: WaitSend> PendingSends<H> {
    /// Block until the transfers no longer need the send buffer.
    pub fn complete(self) {
        for h in self.handles {
            h.wait();
        }
    }
}

/// Start a sparse exchange of `elsize`-byte elements: post the receive for
/// every peer with a non-zero incoming count, then the sends. Nothing is
/// posted for the local rank (the engine never exports to itself).
#[allow(clippy::too_many_arguments)]
pub fn sparse_exchange<C: Communicator>(
    comm: &C,
    tag: u16,
    sendbuf: &[u8],
    send_count: &[usize],
    send_offset: &[usize],
    recv_count: &[usize],
    recv_offset: &[usize],
    elsize: usize,
) -> (PendingRecvs<C::RecvHandle>, PendingSends<C::SendHandle>) {
    let n = comm.size();
    let me = comm.rank();
    debug_assert_eq!(send_count[me], 0, "rank exports to itself");
    debug_assert_eq!(recv_count[me], 0, "rank imports from itself");

    // Receives first: a rendezvous-capable backend can then land the
    // matching sends without staging.
    let recvs: Vec<(usize, C::RecvHandle)> = (0..n)
        .filter(|&p| p != me && recv_count[p] > 0)
        .map(|p| (p, comm.irecv(p, tag, recv_count[p] * elsize)))
        .collect();

    let sends: Vec<C::SendHandle> = (0..n)
        .filter(|&p| p != me && send_count[p] > 0)
        .map(|p| {
            let start = send_offset[p] * elsize;
            let len = send_count[p] * elsize;
            comm.isend(p, tag, &sendbuf[start..start + len])
        })
        .collect();

    (
        PendingRecvs {
            handles: recvs,
            recv_count: recv_count.to_vec(),
            recv_offset: recv_offset.to_vec(),
            elsize,
            total: recv_count.iter().sum(),
        },
        PendingSends { handles: sends },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalUniverse;
    use std::thread;

    #[test]
    fn counts_roundtrip_and_offsets() {
        let comms = LocalUniverse::new(3);
        let outs: Vec<ExchangeLayout> = thread::scope(|s| {
            comms
                .iter()
                .map(|c| {
                    s.spawn(move || {
                        // Rank r sends r+1 elements to every other rank.
                        let me = c.rank();
                        let count: Vec<usize> =
                            (0..3).map(|p| if p == me { 0 } else { me + 1 }).collect();
                        exchange_counts(c, count)
                    })
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect()
        });
        // Rank 0 imports 2 from rank 1 and 3 from rank 2.
        assert_eq!(outs[0].recv_count, vec![0, 2, 3]);
        assert_eq!(outs[0].recv_offset, vec![0, 0, 2]);
        assert_eq!(outs[0].nimport, 5);
        assert_eq!(outs[0].nexport, 2);
        assert_eq!(outs[1].nimport, 1 + 3);
        assert_eq!(outs[2].send_offset, vec![0, 3, 3]);
    }

    #[test]
    fn sparse_payloads_land_at_their_offsets() {
        let comms = LocalUniverse::new(3);
        let outs: Vec<Vec<u8>> = thread::scope(|s| {
            comms
                .iter()
                .map(|c| {
                    s.spawn(move || {
                        let me = c.rank();
                        // Element = one byte naming the sender.
                        let count: Vec<usize> =
                            (0..3).map(|p| if p == me { 0 } else { 2 }).collect();
                        let layout = exchange_counts(c, count);
                        let sendbuf = vec![me as u8; layout.nexport];
                        let (recvs, sends) = sparse_exchange(
                            c,
                            TAG_QUERY,
                            &sendbuf,
                            &layout.send_count,
                            &layout.send_offset,
                            &layout.recv_count,
                            &layout.recv_offset,
                            1,
                        );
                        let got = recvs.complete();
                        sends.complete();
                        got
                    })
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect()
        });
        assert_eq!(outs[0], vec![1, 1, 2, 2]);
        assert_eq!(outs[1], vec![0, 0, 2, 2]);
        assert_eq!(outs[2], vec![0, 0, 1, 1]);
    }
}
