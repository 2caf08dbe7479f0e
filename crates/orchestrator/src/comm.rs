//! Communication abstraction: one engine instance runs per rank, all ranks
//! engaged in the same sequence of collectives.
//!
//! The engine only needs non-blocking point-to-point plus a handful of small
//! collectives, so the trait keeps that surface and builds the collectives
//! on the point-to-point primitives by default. Two backends are provided:
//!
//! - [`LocalComm`]: an in-process mailbox, one rank per thread. This is the
//!   backend every test runs on.
//! - `MpiComm` (feature `mpi`): real MPI through the `mpi` crate, overriding
//!   the collectives with their native counterparts.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

/// Waitable handle for a posted send. Waiting releases the send buffer.
pub trait WaitSend {
    /// Block until the transfer no longer needs the source buffer.
    fn wait(self);
}

/// Waitable handle for a posted receive.
pub trait WaitRecv {
    /// Block until the message arrives and return its payload.
    fn wait(self) -> Vec<u8>;
}

/// Reserved tag space for the default collective implementations.
const TAG_COLL_ALLTOALL: u16 = u16::MAX - 1;
const TAG_COLL_ALLGATHER: u16 = u16::MAX - 2;

/// Non-blocking communication interface, minimal by design.
pub trait Communicator: Send + Sync {
    /// Handle returned by [`isend`](Self::isend).
    type SendHandle: WaitSend;
    /// Handle returned by [`irecv`](Self::irecv).
    type RecvHandle: WaitRecv;

    /// Rank of this process in `0..size`.
    fn rank(&self) -> usize;

    /// Total number of ranks.
    fn size(&self) -> usize;

    /// Post a non-blocking send of `buf` to `peer`.
    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;

    /// Post a non-blocking receive of exactly `len` bytes from `peer`.
    fn irecv(&self, peer: usize, tag: u16, len: usize) -> Self::RecvHandle;

    /// Synchronisation barrier. The default rides on [`allgather_bytes`].
    fn barrier(&self) {
        let _ = self.allgather_bytes(&[]);
    }

    /// Personalised all-to-all of one `u64` per peer. `send[p]` goes to `p`;
    /// the result's slot `p` holds what `p` sent here.
    fn alltoall_u64(&self, send: &[u64]) -> Vec<u64> {
        let n = self.size();
        let me = self.rank();
        assert_eq!(send.len(), n, "alltoall send buffer must have one slot per rank");
        let mut out = vec![0u64; n];
        out[me] = send[me];
        if n == 1 {
            return out;
        }
        let recvs: Vec<_> = (0..n)
            .filter(|&p| p != me)
            .map(|p| (p, self.irecv(p, TAG_COLL_ALLTOALL, 8)))
            .collect();
        let sends: Vec<_> = (0..n)
            .filter(|&p| p != me)
            .map(|p| self.isend(p, TAG_COLL_ALLTOALL, &send[p].to_le_bytes()))
            .collect();
        for s in sends {
            s.wait();
        }
        for (p, r) in recvs {
            let bytes = r.wait();
            out[p] = u64::from_le_bytes(bytes.try_into().expect("eight bytes"));
        }
        out
    }

    /// Gather every rank's `send` buffer (same length everywhere),
    /// rank-major.
    fn allgather_bytes(&self, send: &[u8]) -> Vec<Vec<u8>> {
        let n = self.size();
        let me = self.rank();
        let mut out: Vec<Vec<u8>> = vec![Vec::new(); n];
        out[me] = send.to_vec();
        if n == 1 {
            return out;
        }
        let recvs: Vec<_> = (0..n)
            .filter(|&p| p != me)
            .map(|p| (p, self.irecv(p, TAG_COLL_ALLGATHER, send.len())))
            .collect();
        let sends: Vec<_> = (0..n)
            .filter(|&p| p != me)
            .map(|p| self.isend(p, TAG_COLL_ALLGATHER, send))
            .collect();
        for s in sends {
            s.wait();
        }
        for (p, r) in recvs {
            out[p] = r.wait();
        }
        out
    }

    /// Sum-allreduce of a single `i64`.
    fn allreduce_i64_sum(&self, x: i64) -> i64 {
        self.allgather_bytes(&x.to_le_bytes())
            .iter()
            .map(|b| i64::from_le_bytes(b.as_slice().try_into().expect("eight bytes")))
            .sum()
    }

    /// Min-allreduce of a single `f64`.
    fn allreduce_f64_min(&self, x: f64) -> f64 {
        self.allgather_bytes(&x.to_le_bytes())
            .iter()
            .map(|b| f64::from_le_bytes(b.as_slice().try_into().expect("eight bytes")))
            .fold(f64::INFINITY, f64::min)
    }

    /// Max-allreduce of a single `f64`.
    fn allreduce_f64_max(&self, x: f64) -> f64 {
        self.allgather_bytes(&x.to_le_bytes())
            .iter()
            .map(|b| f64::from_le_bytes(b.as_slice().try_into().expect("eight bytes")))
            .fold(f64::NEG_INFINITY, f64::max)
    }
}

// ---------------------------------------------------------------------------
// LocalComm: in-process mailbox backend
// ---------------------------------------------------------------------------

type Key = (usize, usize, u16); // (src, dst, tag)

#[derive(Default)]
struct Slot {
    queue: Mutex<VecDeque<Vec<u8>>>,
    ready: Condvar,
}

struct BarrierState {
    arrived: usize,
    epoch: u64,
}

struct UniverseState {
    size: usize,
    mail: Mutex<HashMap<Key, Arc<Slot>>>,
    barrier: Mutex<BarrierState>,
    barrier_cv: Condvar,
}

/// Factory for a set of in-process ranks sharing one mailbox.
pub struct LocalUniverse;

impl LocalUniverse {
    /// Create `size` communicators, one per rank. Hand each to its own
    /// thread; they are only useful together.
    pub fn new(size: usize) -> Vec<LocalComm> {
        assert!(size >= 1, "a universe needs at least one rank");
        let state = Arc::new(UniverseState {
            size,
            mail: Mutex::new(HashMap::new()),
            barrier: Mutex::new(BarrierState { arrived: 0, epoch: 0 }),
            barrier_cv: Condvar::new(),
        });
        (0..size)
            .map(|rank| LocalComm {
                rank,
                state: Arc::clone(&state),
            })
            .collect()
    }
}

/// In-process mailbox communicator: ranks are threads, messages are queued
/// byte buffers, receives block on a condvar.
pub struct LocalComm {
    rank: usize,
    state: Arc<UniverseState>,
}

impl LocalComm {
    fn slot(&self, key: Key) -> Arc<Slot> {
        let mut mail = self.state.mail.lock().expect("mailbox poisoned");
        Arc::clone(mail.entry(key).or_default())
    }
}

/// Send handle of [`LocalComm`]; the payload was copied on post.
pub struct LocalSendHandle;

impl WaitSend for LocalSendHandle {
    fn wait(self) {}
}

/// Receive handle of [`LocalComm`].
pub struct LocalRecvHandle {
    slot: Arc<Slot>,
    want: usize,
}

impl WaitRecv for LocalRecvHandle {
    fn wait(self) -> Vec<u8> {
        let mut queue = self.slot.queue.lock().expect("mail slot poisoned");
        while queue.is_empty() {
            queue = self.slot.ready.wait(queue).expect("mail slot poisoned");
        }
        let msg = queue.pop_front().expect("queue non-empty");
        assert_eq!(
            msg.len(),
            self.want,
            "message length does not match the posted receive"
        );
        msg
    }
}

impl Communicator for LocalComm {
    type SendHandle = LocalSendHandle;
    type RecvHandle = LocalRecvHandle;

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.state.size
    }

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> LocalSendHandle {
        let slot = self.slot((self.rank, peer, tag));
        slot.queue
            .lock()
            .expect("mail slot poisoned")
            .push_back(buf.to_vec());
        slot.ready.notify_all();
        LocalSendHandle
    }

    fn irecv(&self, peer: usize, tag: u16, len: usize) -> LocalRecvHandle {
        LocalRecvHandle {
            slot: self.slot((peer, self.rank, tag)),
            want: len,
        }
    }

    fn barrier(&self) {
        let mut b = self.state.barrier.lock().expect("barrier poisoned");
        let epoch = b.epoch;
        b.arrived += 1;
        if b.arrived == self.state.size {
            b.arrived = 0;
            b.epoch += 1;
            self.state.barrier_cv.notify_all();
        } else {
            while b.epoch == epoch {
                b = self.state.barrier_cv.wait(b).expect("barrier poisoned");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MPI backend
// ---------------------------------------------------------------------------

#[cfg(feature = "mpi")]
mod mpi_backend {
    use super::{Communicator, WaitRecv, WaitSend};
    use core::ptr::NonNull;
    use mpi::collective::{CommunicatorCollectives, SystemOperation};
    use mpi::environment::Universe;
    use mpi::point_to_point::{Destination, Source};
    use mpi::topology::{Communicator as _, SimpleCommunicator};

    /// MPI world communicator. Owns the MPI universe for the process.
    pub struct MpiComm {
        _universe: Universe,
        world: SimpleCommunicator,
        rank: usize,
        size: usize,
    }

    unsafe impl Send for MpiComm {}
    unsafe impl Sync for MpiComm {}

    impl MpiComm {
        /// Initialise MPI and wrap the world communicator. Returns `None`
        /// when MPI was already initialised.
        pub fn new() -> Option<Self> {
            let universe = mpi::initialize()?;
            let world = universe.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Some(Self {
                _universe: universe,
                world,
                rank,
                size,
            })
        }
    }

    /// Send handle owning its staged buffer until completion.
    pub struct MpiSendHandle {
        req: Option<mpi::request::Request<'static, [u8], mpi::request::StaticScope>>,
        buf: Option<NonNull<[u8]>>,
    }

    impl WaitSend for MpiSendHandle {
        fn wait(mut self) {
            if let Some(r) = self.req.take() {
                let _ = r.wait();
            }
            if let Some(ptr) = self.buf.take() {
                unsafe { drop(Box::from_raw(ptr.as_ptr())) };
            }
        }
    }

    impl Drop for MpiSendHandle {
        fn drop(&mut self) {
            if let Some(r) = self.req.take() {
                let _ = r.wait();
            }
            if let Some(ptr) = self.buf.take() {
                unsafe { drop(Box::from_raw(ptr.as_ptr())) };
            }
        }
    }

    /// Receive handle owning its destination buffer.
    pub struct MpiRecvHandle {
        req: Option<mpi::request::Request<'static, [u8], mpi::request::StaticScope>>,
        buf: Option<NonNull<[u8]>>,
    }

    impl WaitRecv for MpiRecvHandle {
        fn wait(mut self) -> Vec<u8> {
            if let Some(r) = self.req.take() {
                let _ = r.wait();
            }
            let ptr = self.buf.take().expect("receive buffer missing");
            let boxed: Box<[u8]> = unsafe { Box::from_raw(ptr.as_ptr()) };
            Vec::from(boxed)
        }
    }

    impl Drop for MpiRecvHandle {
        fn drop(&mut self) {
            if let Some(r) = self.req.take() {
                let _ = r.wait();
            }
            if let Some(ptr) = self.buf.take() {
                unsafe { drop(Box::from_raw(ptr.as_ptr())) };
            }
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiSendHandle;
        type RecvHandle = MpiRecvHandle;

        fn rank(&self) -> usize {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MpiSendHandle {
            use mpi::request::StaticScope;
            let raw: *mut [u8] = Box::into_raw(buf.to_vec().into_boxed_slice());
            let slice: &'static [u8] = unsafe { &*raw };
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(StaticScope, slice, tag as i32);
            MpiSendHandle {
                req: Some(req),
                buf: Some(unsafe { NonNull::new_unchecked(raw) }),
            }
        }

        fn irecv(&self, peer: usize, tag: u16, len: usize) -> MpiRecvHandle {
            use mpi::request::StaticScope;
            let raw: *mut [u8] = Box::into_raw(vec![0u8; len].into_boxed_slice());
            let slice: &'static mut [u8] = unsafe { &mut *raw };
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_receive_into_with_tag(StaticScope, slice, tag as i32);
            MpiRecvHandle {
                req: Some(req),
                buf: Some(unsafe { NonNull::new_unchecked(raw) }),
            }
        }

        fn barrier(&self) {
            self.world.barrier();
        }

        fn alltoall_u64(&self, send: &[u64]) -> Vec<u64> {
            let mut out = vec![0u64; self.size];
            self.world.all_to_all_into(send, &mut out[..]);
            out
        }

        fn allreduce_i64_sum(&self, x: i64) -> i64 {
            let mut out = 0i64;
            self.world
                .all_reduce_into(&x, &mut out, SystemOperation::sum());
            out
        }

        fn allreduce_f64_min(&self, x: f64) -> f64 {
            let mut out = 0f64;
            self.world
                .all_reduce_into(&x, &mut out, SystemOperation::min());
            out
        }

        fn allreduce_f64_max(&self, x: f64) -> f64 {
            let mut out = 0f64;
            self.world
                .all_reduce_into(&x, &mut out, SystemOperation::max());
            out
        }
    }
}

#[cfg(feature = "mpi")]
pub use mpi_backend::MpiComm;
