use parking_lot::Mutex;

#[derive(Debug, Default)]
struct LatchState {
    running: bool,
    pending: bool,
}

/// Coalesces sync triggers so that at most one pass runs at a time.
///
/// Triggers arriving while a pass runs collapse into a single follow-up pass.
#[derive(Debug, Default)]
pub struct SyncLatch {
    state: Mutex<LatchState>,
}

impl SyncLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the caller must start a pass, otherwise latches a follow-up pass.
    pub fn try_start(&self) -> bool {
        let mut state = self.state.lock();
        if state.running {
            state.pending = true;
            false
        } else {
            state.running = true;
            state.pending = false;
            true
        }
    }

    /// Marks the running pass as completed.
    ///
    /// Returns `true` if a trigger was latched meanwhile, the latch then stays running and the
    /// caller must run exactly one more pass.
    pub fn finish(&self) -> bool {
        let mut state = self.state.lock();
        if state.pending {
            state.pending = false;
            true
        } else {
            state.running = false;
            false
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }
}
