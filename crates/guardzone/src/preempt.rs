//! Thread-local stand-in for the scheduler's preemption level.
//!
//! The engine never sleeps on behalf of a caller that has preemption
//! disabled: allocation with [`AllocFlags::NOWAIT`] returns null from such a
//! context, and without the flag the engine proceeds but bumps a diagnostic
//! counter.
//!
//! [`AllocFlags::NOWAIT`]: crate::engine::AllocFlags::NOWAIT

use core::marker::PhantomData;
use std::cell::Cell;

thread_local! {
    static PREEMPT_LEVEL: Cell<u32> = const { Cell::new(0) };
}

/// Current preemption-disable depth of the calling thread.
#[inline]
pub fn preemption_level() -> u32 {
    PREEMPT_LEVEL.with(|l| l.get())
}

/// Disable preemption for the calling thread until the guard drops.
/// Nests; the level is the number of live guards.
pub fn disable_preemption() -> PreemptionDisabled {
    PREEMPT_LEVEL.with(|l| l.set(l.get() + 1));
    PreemptionDisabled {
        _not_send: PhantomData,
    }
}

pub struct PreemptionDisabled {
    _not_send: PhantomData<*const ()>,
}

impl Drop for PreemptionDisabled {
    fn drop(&mut self) {
        PREEMPT_LEVEL.with(|l| l.set(l.get() - 1));
    }
}
