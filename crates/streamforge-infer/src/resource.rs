//! Double-buffered resource rings and ticketing.
//!
//! `InferResource<V>` owns a small fixed ring of `V` instances (typically
//! two) and hands out FIFO tickets naming a slot. A ticket minted with
//! `reserve = true` keeps naming the same slot on every subsequent pickup
//! from the same caller — this is how one batch's worth of frames all
//! land in the same `IOResValue` while the batch is being filled; the
//! final frame of the batch releases with `reserve = false`, which is
//! what rotates the ring for the next batch.
//!
//! `wait_resource_by_ticket` is the actual admission gate: it blocks until
//! the slot is no longer held by whatever round used it last, independent
//! of the coarser "at most N rounds outstanding" throttle in
//! `pick_up_ticket`.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AllocateError {
    #[error("resource allocation failed: {0}")]
    Exhausted(String),
}

/// A reservation for one slot in an [`InferResource`] ring.
#[derive(Debug, Clone, Copy)]
pub struct Ticket {
    slot: usize,
    round: u64,
}

impl Ticket {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

struct RingState {
    cursor: usize,
    next_round: u64,
    current_round: u64,
    round_open: bool,
    in_flight: usize,
    busy: Vec<bool>,
    owner_round: Vec<Option<u64>>,
}

/// A fixed ring of `N` instances of `V`, ticketed FIFO.
pub struct InferResource<V> {
    slots: Vec<Mutex<V>>,
    n: usize,
    state: Mutex<RingState>,
    cond: Condvar,
}

impl<V> InferResource<V> {
    pub fn new(values: Vec<V>) -> Self {
        let n = values.len();
        InferResource {
            slots: values.into_iter().map(Mutex::new).collect(),
            n,
            state: Mutex::new(RingState {
                cursor: 0,
                next_round: 0,
                current_round: 0,
                round_open: false,
                in_flight: 0,
                busy: vec![false; n],
                owner_round: vec![None; n],
            }),
            cond: Condvar::new(),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.n
    }

    /// Blocks if all `N` slots are already checked out by rounds that
    /// haven't released yet. `reserve = true` keeps returning the same
    /// slot without counting a new round against the limit; `reserve =
    /// false` closes the round out and rotates the cursor for the next
    /// caller.
    pub fn pick_up_ticket(&self, reserve: bool) -> Ticket {
        let mut state = self.state.lock();
        if !state.round_open {
            while state.in_flight >= self.n {
                self.cond.wait(&mut state);
            }
            state.in_flight += 1;
            state.round_open = true;
            state.current_round = state.next_round;
            state.next_round += 1;
        }
        let slot = state.cursor;
        let round = state.current_round;
        if !reserve {
            state.cursor = (state.cursor + 1) % self.n;
            state.round_open = false;
        }
        tracing::debug!(slot, round, reserve, "ticket issued");
        Ticket { slot, round }
    }

    /// Blocks until `ticket`'s slot is free of whatever round last held
    /// it, then locks it for this round. Idempotent: calling again with a
    /// ticket this round already owns returns immediately.
    pub fn wait_resource_by_ticket(&self, ticket: &Ticket) -> ResourceGuard<'_, V> {
        {
            let mut state = self.state.lock();
            while state.busy[ticket.slot] && state.owner_round[ticket.slot] != Some(ticket.round) {
                self.cond.wait(&mut state);
            }
            state.busy[ticket.slot] = true;
            state.owner_round[ticket.slot] = Some(ticket.round);
        }
        ResourceGuard {
            guard: self.slots[ticket.slot].lock(),
        }
    }

    /// Reads a slot's content directly, bypassing ticket bookkeeping.
    /// Only safe once the caller already knows, through some other
    /// happens-before relationship (e.g. a task dependency chain), that
    /// the slot's last writer has finished.
    pub fn peek(&self, slot: usize) -> parking_lot::MutexGuard<'_, V> {
        self.slots[slot].lock()
    }

    /// Releases `ticket`'s slot. Must be called exactly once per round
    /// (i.e. once per `pick_up_ticket(reserve = false)`).
    pub fn dealing_done(&self, ticket: Ticket) {
        let mut state = self.state.lock();
        state.busy[ticket.slot] = false;
        state.owner_round[ticket.slot] = None;
        state.in_flight = state.in_flight.saturating_sub(1);
        tracing::debug!(slot = ticket.slot, round = ticket.round, "slot released");
        self.cond.notify_all();
    }
}

/// A held slot's content, borrowed for the duration of this guard.
pub struct ResourceGuard<'a, V> {
    guard: parking_lot::MutexGuard<'a, V>,
}

impl<'a, V> std::ops::Deref for ResourceGuard<'a, V> {
    type Target = V;
    fn deref(&self) -> &V {
        &self.guard
    }
}

impl<'a, V> std::ops::DerefMut for ResourceGuard<'a, V> {
    fn deref_mut(&mut self) -> &mut V {
        &mut self.guard
    }
}

/// One allocation of host or device tensor storage sized for `batchsize`
/// samples across all tensors of a model's input (or output) set.
#[derive(Debug)]
pub struct IoResValue {
    pub batchsize: usize,
    /// Per-tensor base address plus the byte stride between samples
    /// (`TensorLayout::host_batch_stride` / `device_batch_stride`).
    pub tensors: Vec<(usize, usize)>,
    pub backing: Vec<u8>,
}

impl IoResValue {
    pub fn new(batchsize: usize, tensors: Vec<(usize, usize)>) -> Self {
        let total: usize = tensors.iter().map(|(_, stride)| stride * batchsize).sum();
        IoResValue {
            batchsize,
            tensors,
            backing: vec![0u8; total],
        }
    }

    /// Address of the `batch_idx`-th sample within tensor `tensor_idx`.
    ///
    /// Uses the model-reported per-tensor alignment, not a naive
    /// `hwc * size_of::<f32>()` computation — the two differ on
    /// accelerators that pad each sample to a hardware-friendly stride.
    pub fn offset(&self, tensor_idx: usize, batch_idx: usize) -> usize {
        let (base, stride) = self.tensors[tensor_idx];
        base + stride * batch_idx
    }
}

fn allocate_host(batchsize: usize, tensors: Vec<(usize, usize)>) -> Result<IoResValue, AllocateError> {
    Ok(IoResValue::new(batchsize, tensors))
}

fn allocate_device(batchsize: usize, tensors: Vec<(usize, usize)>) -> Result<IoResValue, AllocateError> {
    // The real accelerator allocator is an external collaborator; this
    // stands in for it with host memory of the same shape so the ring and
    // ticketing logic above can be exercised without real hardware.
    Ok(IoResValue::new(batchsize, tensors))
}

pub type CpuInputResource = InferResource<IoResValue>;
pub type CpuOutputResource = InferResource<IoResValue>;
pub type AcceleratorInputResource = InferResource<IoResValue>;
pub type AcceleratorOutputResource = InferResource<IoResValue>;

pub fn new_cpu_resource(
    n: usize,
    batchsize: usize,
    tensors: Vec<(usize, usize)>,
) -> Result<InferResource<IoResValue>, AllocateError> {
    let mut values = Vec::with_capacity(n);
    for _ in 0..n {
        values.push(allocate_host(batchsize, tensors.clone())?);
    }
    Ok(InferResource::new(values))
}

pub fn new_accelerator_resource(
    n: usize,
    batchsize: usize,
    tensors: Vec<(usize, usize)>,
) -> Result<InferResource<IoResValue>, AllocateError> {
    let mut values = Vec::with_capacity(n);
    for _ in 0..n {
        values.push(allocate_device(batchsize, tensors.clone())?);
    }
    Ok(InferResource::new(values))
}

/// Fixed attributes of the on-device resize+colour-convert operator,
/// frozen after first initialisation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RcOpAttributes {
    pub src_width: u32,
    pub src_height: u32,
    pub src_stride: usize,
    pub dst_width: u32,
    pub dst_height: u32,
    pub batchsize: usize,
}

/// The single on-device resize+colour-convert operator plus its per-batch
/// "fake data" scratch buffers, used to pad unfilled slots when a batch is
/// forced to commit partially.
pub struct RcOpResource {
    attrs: Mutex<Option<RcOpAttributes>>,
    fake_y: Arc<Vec<u8>>,
    fake_uv: Arc<Vec<u8>>,
}

impl RcOpResource {
    pub fn new(fake_plane_bytes: usize) -> Self {
        RcOpResource {
            attrs: Mutex::new(None),
            fake_y: Arc::new(vec![0u8; fake_plane_bytes]),
            fake_uv: Arc::new(vec![0u8; fake_plane_bytes / 2]),
        }
    }

    pub fn fake_y(&self) -> Arc<Vec<u8>> {
        Arc::clone(&self.fake_y)
    }

    pub fn fake_uv(&self) -> Arc<Vec<u8>> {
        Arc::clone(&self.fake_uv)
    }

    /// Initialises the operator's attributes on first call; on every
    /// later call, validates the new frame's attributes match what was
    /// fixed at init time.
    pub fn init_or_validate(&self, attrs: RcOpAttributes) -> Result<(), String> {
        let mut current = self.attrs.lock();
        match *current {
            None => {
                *current = Some(attrs);
                Ok(())
            }
            Some(existing) if existing == attrs => Ok(()),
            Some(existing) => Err(format!(
                "RC-op re-seen with mismatched attributes: expected {existing:?}, got {attrs:?}"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn reserved_ticket_is_idempotent_across_calls() {
        let res: InferResource<i32> = InferResource::new(vec![0, 0]);
        let t1 = res.pick_up_ticket(true);
        let t2 = res.pick_up_ticket(true);
        assert_eq!(t1.slot(), t2.slot());
    }

    #[test]
    fn release_rotates_cursor() {
        let res: InferResource<i32> = InferResource::new(vec![0, 0]);
        let t1 = res.pick_up_ticket(false);
        res.dealing_done(t1);
        let t2 = res.pick_up_ticket(false);
        assert_eq!(t2.slot(), 1);
    }

    #[test]
    fn third_pickup_blocks_until_release() {
        let res = StdArc::new(InferResource::<i32>::new(vec![0, 0]));
        let t1 = res.pick_up_ticket(false);
        let _t2 = res.pick_up_ticket(false);

        let res2 = StdArc::clone(&res);
        let handle = thread::spawn(move || {
            // Blocks until the main thread releases t1.
            res2.pick_up_ticket(false)
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());
        res.dealing_done(t1);
        let t3 = handle.join().unwrap();
        assert_eq!(t3.slot(), 0);
    }

    #[test]
    fn wait_resource_blocks_until_prior_round_released() {
        let res = StdArc::new(InferResource::<i32>::new(vec![0, 0]));

        let t1 = res.pick_up_ticket(false); // slot 0
        let g1 = res.wait_resource_by_ticket(&t1);

        let t2 = res.pick_up_ticket(false); // slot 1
        res.dealing_done(t2); // frees a round, but not slot 0

        let t3 = res.pick_up_ticket(false); // cursor back at slot 0
        assert_eq!(t3.slot(), 0);

        let res2 = StdArc::clone(&res);
        let handle = thread::spawn(move || {
            let _g = res2.wait_resource_by_ticket(&t3);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());
        drop(g1);
        res.dealing_done(t1);
        handle.join().unwrap();
    }

    #[test]
    fn rc_op_validates_fixed_attributes() {
        let rc = RcOpResource::new(1920 * 1080);
        let a = RcOpAttributes {
            src_width: 1920,
            src_height: 1080,
            src_stride: 1920,
            dst_width: 224,
            dst_height: 224,
            batchsize: 4,
        };
        assert!(rc.init_or_validate(a).is_ok());
        assert!(rc.init_or_validate(a).is_ok());

        let mut b = a;
        b.src_stride = 1280;
        assert!(rc.init_or_validate(b).is_err());
    }
}
