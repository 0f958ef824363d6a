use std::io;
use std::mem;

/// Sentinel core id meaning "not bound".
pub const UNBOUND_CORE: i32 = -1;

/// Binding state of one team thread: where it currently runs and where the
/// next rebalance wants it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindSlot {
    /// OS core the thread is pinned to, or [`UNBOUND_CORE`].
    pub cur_core_id: i32,
    /// OS core the thread should move to, or [`UNBOUND_CORE`].
    pub new_core_id: i32,
}

impl BindSlot {
    /// A slot with no current and no requested core.
    #[must_use]
    pub fn unbound() -> Self {
        Self {
            cur_core_id: UNBOUND_CORE,
            new_core_id: UNBOUND_CORE,
        }
    }
}

impl Default for BindSlot {
    fn default() -> Self {
        Self::unbound()
    }
}

/// Pins the calling thread to a single OS core.
pub fn pin_current_thread(os_core_id: i32) -> io::Result<()> {
    // A cpu_set_t only addresses CPU_SETSIZE cores; CPU_SET would index
    // past its bit array for anything beyond.
    if os_core_id < 0 || os_core_id >= libc::CPU_SETSIZE {
        return Err(io::Error::from_raw_os_error(libc::EINVAL));
    }

    // SAFETY: `cpu_set_t` is a plain bit set, all-zeroes is its empty value.
    let mut set: libc::cpu_set_t = unsafe { mem::zeroed() };

    // SAFETY: CPU_SET writes within the set for any id below CPU_SETSIZE.
    unsafe {
        libc::CPU_SET(os_core_id as usize, &mut set);
    }

    // SAFETY: the set is initialized and its size is passed alongside it.
    let status = unsafe {
        libc::pthread_setaffinity_np(
            libc::pthread_self(),
            mem::size_of::<libc::cpu_set_t>(),
            &set,
        )
    };

    if status != 0 {
        return Err(io::Error::from_raw_os_error(status));
    }

    Ok(())
}

/// The runtime primitive that moves a thread team onto its new cores.
///
/// The rebalance engine fills each thread's [`BindSlot::new_core_id`] and then
/// hands the whole plan to this interface. Implementations are expected to
/// make every team thread pin itself to its own slot, mark the move by
/// setting `cur_core_id` to the applied core, and reset `new_core_id` to
/// [`UNBOUND_CORE`]. A failed affinity call must leave the slot's
/// `cur_core_id` untouched; the next rebalance retries.
pub trait TeamRebind {
    /// Applies the binding plan, one slot per team thread.
    fn rebind(&self, slots: &mut [BindSlot]);
}

/// A [`TeamRebind`] for teams whose master is the only thread the embedder
/// controls directly: pins the calling thread to slot 0 and leaves the
/// remaining slots for the host runtime to apply.
#[derive(Debug, Default)]
pub struct MasterOnlyRebind;

impl TeamRebind for MasterOnlyRebind {
    fn rebind(&self, slots: &mut [BindSlot]) {
        let Some(slot) = slots.first_mut() else {
            return;
        };

        if slot.new_core_id == UNBOUND_CORE {
            return;
        }

        match pin_current_thread(slot.new_core_id) {
            Ok(()) => {
                log::debug!(
                    target: "sabo::binding",
                    "moved master thread from core {} to core {}",
                    slot.cur_core_id,
                    slot.new_core_id
                );

                slot.cur_core_id = slot.new_core_id;
                slot.new_core_id = UNBOUND_CORE;
            }
            Err(err) => {
                log::error!(
                    target: "sabo::binding",
                    "failed to move master thread to core {}: {err}",
                    slot.new_core_id
                );
            }
        }
    }
}
