use std::ffi::{c_int, c_void};
use std::time::{Duration, Instant};

use ffmpeg_next::ffi;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Polled by FFmpeg during blocking I/O; aborts it once the relay is cancelled.
///
/// With a non-zero `grace` the abort waits that long after the cancellation is
/// first noticed, so a recorder can still flush its trailer.
pub(crate) struct Interrupt {
    cancel: CancellationToken,
    grace: Duration,
    noticed_at: Mutex<Option<Instant>>,
}

impl Interrupt {
    pub(crate) fn new(cancel: CancellationToken, grace: Duration) -> Box<Self> {
        Box::new(Self {
            cancel,
            grace,
            noticed_at: Mutex::new(None),
        })
    }

    pub(crate) fn should_abort(&self) -> bool {
        if !self.cancel.is_cancelled() {
            return false;
        }
        if self.grace.is_zero() {
            return true;
        }
        let mut noticed_at = self.noticed_at.lock();
        noticed_at.get_or_insert_with(Instant::now).elapsed() >= self.grace
    }

    /// Keep `self` boxed and alive for as long as any context holds the callback.
    pub(crate) fn callback(&self) -> ffi::AVIOInterruptCB {
        ffi::AVIOInterruptCB {
            callback: Some(interrupt_callback),
            opaque: self as *const Self as *mut c_void,
        }
    }
}

unsafe extern "C" fn interrupt_callback(opaque: *mut c_void) -> c_int {
    if opaque.is_null() {
        return 0;
    }
    let interrupt = unsafe { &*(opaque as *const Interrupt) };
    c_int::from(interrupt.should_abort())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_token_never_aborts() {
        let interrupt = Interrupt::new(CancellationToken::new(), Duration::ZERO);
        assert!(!interrupt.should_abort());
    }

    #[test]
    fn cancelled_token_aborts_at_once_without_grace() {
        let cancel = CancellationToken::new();
        let interrupt = Interrupt::new(cancel.clone(), Duration::ZERO);
        cancel.cancel();
        assert!(interrupt.should_abort());
    }

    #[test]
    fn grace_delays_the_abort() {
        let cancel = CancellationToken::new();
        let interrupt = Interrupt::new(cancel.clone(), Duration::from_millis(50));
        cancel.cancel();

        assert!(!interrupt.should_abort());
        std::thread::sleep(Duration::from_millis(80));
        assert!(interrupt.should_abort());
    }

    #[test]
    fn callback_reads_the_boxed_state() {
        let cancel = CancellationToken::new();
        let interrupt = Interrupt::new(cancel.clone(), Duration::ZERO);
        let callback = interrupt.callback();
        let poll = callback.callback.expect("callback installed");

        assert_eq!(unsafe { poll(callback.opaque) }, 0);
        cancel.cancel();
        assert_eq!(unsafe { poll(callback.opaque) }, 1);
    }
}
