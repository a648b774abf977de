//! # IRQ multiplexer
//!
//! Bridges the interrupt core's one-callback-per-vector table to the
//! many handlers drivers actually want: a fixed table of
//! `{vector, handler, arg}` actions behind its own spinlock. The first
//! claim for a vector installs the multiplexer's trampoline as that
//! vector's callback; dispatch then fans out to every matching action in
//! insertion order.
//!
//! The lock covers the short table mutations and the snapshot taken at
//! dispatch, never the handler invocations themselves.

use heapless::Vec;
use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::interrupts::{self, InterruptContext};

/// Capacity of the action table
pub const MAX_IRQ_ACTIONS: usize = 64;

/// Driver-facing IRQ callback: `(vector, arg)`.
pub type IrqHandler = fn(u8, usize);

#[derive(Clone, Copy)]
struct IrqAction {
    vector: u8,
    handler: IrqHandler,
    arg: usize,
}

/// The action table. One global instance serves the kernel; tests build
/// their own.
pub struct IrqMux {
    actions: Mutex<[Option<IrqAction>; MAX_IRQ_ACTIONS]>,
}

impl IrqMux {
    pub const fn new() -> Self {
        Self {
            actions: Mutex::new([None; MAX_IRQ_ACTIONS]),
        }
    }

    /// Claim a free slot. Returns whether this is the vector's first
    /// active action (the caller then installs the trampoline).
    pub fn claim(&self, vector: u8, handler: IrqHandler, arg: usize) -> KernelResult<bool> {
        let mut actions = self.actions.lock();
        let first_for_vector = !actions
            .iter()
            .flatten()
            .any(|action| action.vector == vector);

        let slot = actions
            .iter_mut()
            .find(|slot| slot.is_none())
            .ok_or(KernelError::Resource)?;
        *slot = Some(IrqAction {
            vector,
            handler,
            arg,
        });
        Ok(first_for_vector)
    }

    /// Revoke the action matching `(vector, handler)`.
    pub fn release(&self, vector: u8, handler: IrqHandler) -> KernelResult {
        let mut actions = self.actions.lock();
        for slot in actions.iter_mut() {
            if let Some(action) = slot {
                if action.vector == vector && action.handler as usize == handler as usize {
                    *slot = None;
                    return Ok(());
                }
            }
        }
        Err(KernelError::NotPresent)
    }

    /// Invoke every active action for `vector`, in insertion order.
    /// Returns how many ran.
    pub fn dispatch(&self, vector: u8) -> usize {
        let mut snapshot: Vec<IrqAction, MAX_IRQ_ACTIONS> = Vec::new();
        {
            let actions = self.actions.lock();
            for action in actions.iter().flatten() {
                if action.vector == vector {
                    // Cannot overflow: the snapshot has the table's capacity.
                    let _ = snapshot.push(*action);
                }
            }
        }

        for action in &snapshot {
            (action.handler)(action.vector, action.arg);
        }
        snapshot.len()
    }

    /// Number of active actions across all vectors.
    pub fn active_count(&self) -> usize {
        self.actions.lock().iter().flatten().count()
    }
}

static IRQ_MUX: IrqMux = IrqMux::new();

/// Vector-table callback: fan the interrupt out to the claimed actions.
fn trampoline(ctx: &mut InterruptContext) {
    IRQ_MUX.dispatch(ctx.vector);
}

/// Claim an IRQ action on the global multiplexer. The first claim for a
/// vector registers the trampoline with the interrupt core.
pub fn request_irq(vector: u8, handler: IrqHandler, arg: usize) -> KernelResult {
    let first = IRQ_MUX.claim(vector, handler, arg)?;
    if first {
        if let Err(err) = interrupts::register(vector as usize, trampoline) {
            IRQ_MUX.release(vector, handler)?;
            return Err(err);
        }
    }
    Ok(())
}

/// Revoke a previously claimed action. The trampoline stays registered;
/// with no actions left it fans out to nobody.
pub fn free_irq(vector: u8, handler: IrqHandler) -> KernelResult {
    IRQ_MUX.release(vector, handler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    static SEEN_ARGS: StdMutex<Option<std::vec::Vec<usize>>> = StdMutex::new(None);

    fn recording_handler(_vector: u8, arg: usize) {
        if let Some(seen) = SEEN_ARGS.lock().unwrap().as_mut() {
            seen.push(arg);
        }
    }

    static COUNT_A: AtomicUsize = AtomicUsize::new(0);
    static COUNT_B: AtomicUsize = AtomicUsize::new(0);

    fn handler_a(_vector: u8, _arg: usize) {
        COUNT_A.fetch_add(1, Ordering::SeqCst);
    }

    fn handler_b(_vector: u8, _arg: usize) {
        COUNT_B.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_dispatch_runs_in_insertion_order() {
        let mux = IrqMux::new();
        *SEEN_ARGS.lock().unwrap() = Some(std::vec::Vec::new());

        assert!(mux.claim(33, recording_handler, 10).unwrap());
        assert!(!mux.claim(33, recording_handler, 20).unwrap());
        assert!(!mux.claim(33, recording_handler, 30).unwrap());

        assert_eq!(mux.dispatch(33), 3);
        let seen = SEEN_ARGS.lock().unwrap().take().unwrap();
        assert_eq!(seen, vec![10, 20, 30]);
    }

    #[test]
    fn test_dispatch_matches_vector_only() {
        let mux = IrqMux::new();
        mux.claim(34, handler_a, 0).unwrap();
        mux.claim(35, handler_b, 0).unwrap();

        let a_before = COUNT_A.load(Ordering::SeqCst);
        let b_before = COUNT_B.load(Ordering::SeqCst);
        assert_eq!(mux.dispatch(34), 1);
        assert_eq!(COUNT_A.load(Ordering::SeqCst), a_before + 1);
        assert_eq!(COUNT_B.load(Ordering::SeqCst), b_before);
    }

    #[test]
    fn test_release_revokes_matching_action_only() {
        let mux = IrqMux::new();
        mux.claim(36, handler_a, 0).unwrap();
        mux.claim(36, handler_b, 0).unwrap();

        mux.release(36, handler_a).unwrap();
        assert_eq!(mux.active_count(), 1);

        let b_before = COUNT_B.load(Ordering::SeqCst);
        assert_eq!(mux.dispatch(36), 1);
        assert_eq!(COUNT_B.load(Ordering::SeqCst), b_before + 1);

        assert_eq!(mux.release(36, handler_a), Err(KernelError::NotPresent));
    }

    #[test]
    fn test_first_claim_per_vector_is_flagged() {
        let mux = IrqMux::new();
        assert!(mux.claim(40, handler_a, 0).unwrap());
        assert!(!mux.claim(40, handler_b, 0).unwrap());
        // A different vector is its own first.
        assert!(mux.claim(41, handler_a, 0).unwrap());

        mux.release(40, handler_a).unwrap();
        mux.release(40, handler_b).unwrap();
        assert!(mux.claim(40, handler_a, 0).unwrap());
    }

    #[test]
    fn test_capacity_exhaustion_is_resource() {
        let mux = IrqMux::new();
        for i in 0..MAX_IRQ_ACTIONS {
            mux.claim(42, handler_a, i).unwrap();
        }
        assert_eq!(
            mux.claim(42, handler_a, usize::MAX),
            Err(KernelError::Resource)
        );
    }
}
