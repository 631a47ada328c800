//! Host services
//!
//! Display, input, files and named plugins are external collaborators of
//! the VM core. They appear here as one trait with a failing default for
//! everything, so a headless VM runs with [`NullHost`] and tests install
//! purpose-built mocks. Primitives translate [`HostError`] into ordinary
//! primitive failure.

use shrew_vm_heap::{ObjectSpace, Value};
use thiserror::Error;

use crate::context::Context;

/// Errors surfaced by host services.
#[derive(Debug, Error)]
pub enum HostError {
    /// The host does not provide this service
    #[error("unsupported host operation")]
    Unsupported,
    /// The host tried and failed
    #[error("host i/o error: {0}")]
    Io(String),
}

/// Result type for host operations
pub type HostResult<T> = Result<T, HostError>;

/// An input event record, eight integer fields as the image expects.
pub type InputEvent = [i64; 8];

/// The services a host embedding may provide.
///
/// Every method has a default that either fails (queries the VM cannot
/// fake) or does nothing (hints a headless VM can ignore).
#[allow(unused_variables)]
pub trait HostServices {
    /// Current mouse position.
    fn mouse_point(&mut self) -> HostResult<(i64, i64)> {
        Err(HostError::Unsupported)
    }

    /// Current mouse button bits.
    fn mouse_buttons(&mut self) -> HostResult<i64> {
        Err(HostError::Unsupported)
    }

    /// Next keyboard code, if one is buffered.
    fn next_keycode(&mut self) -> HostResult<Option<i64>> {
        Err(HostError::Unsupported)
    }

    /// Peek the next keyboard code without consuming it.
    fn peek_keycode(&mut self) -> HostResult<Option<i64>> {
        Err(HostError::Unsupported)
    }

    /// Next input event; `now` is the VM millisecond clock.
    fn next_event(&mut self, now: i64) -> HostResult<InputEvent> {
        Err(HostError::Unsupported)
    }

    /// The display extent, if the host has one.
    fn screen_size(&mut self) -> HostResult<(i64, i64)> {
        Err(HostError::Unsupported)
    }

    /// A form became the display; the host may open a window.
    fn be_display(&mut self, width: i64, height: i64, depth: i64) -> HostResult<()> {
        Ok(())
    }

    /// Route a named external primitive (`module>>function`).
    ///
    /// `Ok(Some(v))` answers `v` after the dispatcher cleans the stack;
    /// `Ok(None)` means the host managed the stack itself.
    fn named_call(
        &mut self,
        module: &str,
        function: &str,
        space: &mut ObjectSpace,
        frame: Context,
        argument_count: usize,
    ) -> HostResult<Option<Value>> {
        Err(HostError::Unsupported)
    }

    /// Open a file; answers a descriptor.
    fn file_open(&mut self, path: &str, writable: bool) -> HostResult<i64> {
        Err(HostError::Unsupported)
    }

    /// Close a descriptor.
    fn file_close(&mut self, fd: i64) -> HostResult<()> {
        Err(HostError::Unsupported)
    }

    /// Write bytes at the descriptor's position.
    fn file_write(&mut self, fd: i64, data: &[u8]) -> HostResult<usize> {
        Err(HostError::Unsupported)
    }

    /// Path separator for the directory primitives.
    fn file_delimiter(&mut self) -> u8 {
        b'/'
    }

    /// Block for about `microseconds`.
    fn sleep(&mut self, microseconds: i64) {}

    /// Audible beep.
    fn beep(&mut self) {}

    /// Batch display updates on or off.
    fn defer_updates(&mut self, defer: bool) {}

    /// Flush any pending display updates now.
    fn force_display_update(&mut self) {}

    /// The image chose an interrupt key.
    fn set_interrupt_key(&mut self, code: i64) {}

    /// Whether the user-interrupt key was pressed since last asked.
    fn user_interrupt_pending(&mut self) -> bool {
        false
    }
}

/// The headless host: every query fails, every hint is ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHost;

impl HostServices for NullHost {}
