//! Detour installation with a process-wide target registry.
//!
//! [`install`] patches a resolved address with a detour to a replacement
//! function and hands back a [`Hook`] that owns the patch. The hook starts
//! disabled; [`Hook::enable`] routes host calls to the replacement and
//! [`Hook::original`] exposes the trampoline so the replacement can always
//! forward into the pre-hook behavior. One registry spans the process, so
//! two live hooks can never target the same address.
//!
//! Installation and disposal happen at subsystem start-up and shutdown on
//! the host's main thread; steady-state dispatch goes through the patched
//! code itself and never takes the registry lock.

use std::collections::HashSet;
use std::sync::OnceLock;

use parking_lot::Mutex;
use retour::{Function, GenericDetour, HookableWith};
use thiserror::Error;
use tracing::{debug, warn};

/// Failures of hook installation and lifecycle operations.
#[derive(Debug, Error)]
pub enum HookError {
    /// The target address is zero. Calling through null is undefined
    /// behavior in the host and is rejected before any patching.
    #[error("cannot hook the null address")]
    NullTarget,
    /// A non-disposed hook already targets this address.
    #[error("address {0:#x} is already hooked")]
    DuplicateHook(usize),
    /// The hook was disposed; no further operations are valid.
    #[error("hook was already disposed")]
    UseAfterDispose,
    /// The detour backend rejected the target.
    #[error(transparent)]
    Backend(#[from] retour::Error),
}

fn registry() -> &'static Mutex<HashSet<usize>> {
    static REGISTRY: OnceLock<Mutex<HashSet<usize>>> = OnceLock::new();
    REGISTRY.get_or_init(Default::default)
}

/// Whether a non-disposed hook currently targets `address`.
pub fn is_hooked(address: usize) -> bool {
    registry().lock().contains(&address)
}

/// Installs a detour on `target`, leaving it disabled.
///
/// # Safety
///
/// `target` must be the address, resolved in this process, of a function
/// whose signature is exactly `F`.
pub unsafe fn install<F>(target: usize, replacement: F) -> Result<Hook<F>, HookError>
where
    F: Function + HookableWith<F>,
{
    if target == 0 {
        return Err(HookError::NullTarget);
    }
    if !registry().lock().insert(target) {
        return Err(HookError::DuplicateHook(target));
    }

    let original: F = F::from_ptr(target as *const ());
    let detour = match GenericDetour::new(original, replacement) {
        Ok(detour) => detour,
        Err(e) => {
            registry().lock().remove(&target);
            return Err(e.into());
        }
    };

    debug!("hook installed at {target:#x}");
    Ok(Hook {
        target,
        enabled: false,
        detour: Some(detour),
    })
}

/// An installed detour on one target address.
///
/// Lifecycle: created disabled, then enabled/disabled at will, then
/// disposed. Disposal is terminal; it restores the target, frees the
/// trampoline and releases the address for a future install.
#[derive(Debug)]
pub struct Hook<F: Function> {
    target: usize,
    enabled: bool,
    detour: Option<GenericDetour<F>>,
}

impl<F: Function> Hook<F> {
    fn live(&self) -> Result<&GenericDetour<F>, HookError> {
        self.detour.as_ref().ok_or(HookError::UseAfterDispose)
    }

    /// The hooked address.
    pub fn target(&self) -> usize {
        self.target
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_disposed(&self) -> bool {
        self.detour.is_none()
    }

    /// Starts routing host calls to the replacement. Enabling an enabled
    /// hook is a no-op.
    pub fn enable(&mut self) -> Result<(), HookError> {
        let detour = self.live()?;
        if !self.enabled {
            unsafe { detour.enable()? };
            self.enabled = true;
            debug!("hook enabled at {:#x}", self.target);
        }
        Ok(())
    }

    /// Routes host calls back to the original. Disabling a disabled hook
    /// is a no-op; the trampoline stays valid.
    pub fn disable(&mut self) -> Result<(), HookError> {
        let detour = self.live()?;
        if self.enabled {
            unsafe { detour.disable()? };
            self.enabled = false;
            debug!("hook disabled at {:#x}", self.target);
        }
        Ok(())
    }

    /// The trampoline as a plain function pointer.
    ///
    /// Valid in every non-disposed state, enabled or not. Replacements
    /// that fail internally must still forward through this so the host's
    /// own control flow is never dropped.
    pub fn original(&self) -> Result<F, HookError> {
        let detour = self.live()?;
        Ok(unsafe { F::from_ptr(detour.trampoline() as *const _ as *const ()) })
    }

    /// Restores the target, frees the trampoline and releases the address.
    /// Terminal; disposing twice is a no-op.
    pub fn dispose(&mut self) {
        let Some(detour) = self.detour.take() else {
            return;
        };
        if self.enabled {
            if let Err(e) = unsafe { detour.disable() } {
                warn!("failed to disable hook at {:#x} during disposal: {e}", self.target);
            }
            self.enabled = false;
        }
        drop(detour);
        registry().lock().remove(&self.target);
        debug!("hook disposed at {:#x}", self.target);
    }
}

impl<F: Function> Drop for Hook<F> {
    fn drop(&mut self) {
        self.dispose();
    }
}
