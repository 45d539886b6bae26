//! # In-Process Hooks
//!
//! Virtual method interception for tools loaded *inside* the target. A hook
//! rewrites one vtable slot to point at a replacement function; the
//! replacement may call through to the function it displaced.
//!
//! This capability is kept apart from the remote [`Process`](crate::process::Process)
//! handle: it trusts its own address space, the remote side never does. The
//! registry works on any [`MemoryAccess`], so it runs against
//! [`LocalMemory`] in production and against a simulated target in tests.
//!
//! ## Chaining
//!
//! Several hooks may target the same slot. Each new hook saves whatever the
//! slot held (the vanilla method or the previous hook) as its *original*:
//!
//! ```text
//! slot ──> hook C ──original──> hook B ──original──> hook A ──original──> vanilla
//! ```
//!
//! Removing the top hook writes its original back into the slot. Removing a
//! link in the middle leaves the slot alone and re-points the hook above it
//! at the removed hook's original. Replacements look their original up with
//! [`HookRegistry::original_for`] at call time, so re-chaining takes effect
//! immediately.
//!
//! ## Safety net
//!
//! - Applying the same hook twice is a no-op returning the existing id.
//! - A slot that does not hold the expected function is never overwritten
//!   (`HookMismatch`).
//! - Dropping the registry removes every hook it still holds.

pub mod patch;

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::{BurrowError, Result};
use crate::overlay::{MemoryAccess, TypedMemory};
use crate::types::{Address, PointerWidth};

pub use patch::{patch_memory, LocalMemory, PAGE_SIZE};

/// Identifier of an applied hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookId(u64);

impl HookId
{
    /// Raw value, for logging
    pub const fn raw(self) -> u64
    {
        self.0
    }
}

/// One vtable slot redirection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VMethodHook
{
    /// Address of the virtual table
    pub vtable: Address,
    /// Zero-based slot index
    pub slot: usize,
    /// Function to install
    pub replacement: Address,
    /// Vanilla function the slot must hold, if known
    pub expected: Option<Address>,
}

impl VMethodHook
{
    /// Hook slot `slot` of `vtable` with `replacement`.
    pub fn new(vtable: Address, slot: usize, replacement: Address) -> Self
    {
        Self {
            vtable,
            slot,
            replacement,
            expected: None,
        }
    }

    /// Refuse to apply unless the slot's vanilla function is `original`.
    #[must_use]
    pub fn expecting(mut self, original: Address) -> Self
    {
        self.expected = Some(original);
        self
    }

    /// Address of the slot for the given pointer width.
    pub fn slot_address(&self, width: PointerWidth) -> Result<Address>
    {
        (self.slot as u64)
            .checked_mul(width.bytes() as u64)
            .and_then(|offset| self.vtable.checked_add(offset))
            .ok_or_else(|| BurrowError::InvalidArgument(format!("slot {} of {} overflows", self.slot, self.vtable)))
    }
}

/// Public state of an applied hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookInfo
{
    /// Registry id
    pub id: HookId,
    /// What was applied
    pub hook: VMethodHook,
    /// Address of the patched slot
    pub slot_address: Address,
    /// Function this hook calls through to
    pub original: Address,
}

/// Applied hooks over one address space
pub struct HookRegistry<M: MemoryAccess>
{
    memory: M,
    next_id: u64,
    by_id: HashMap<HookId, HookInfo>,
    /// Per slot, bottom (first applied) to top (currently installed)
    chains: HashMap<Address, Vec<HookId>>,
}

impl<M: MemoryAccess> HookRegistry<M>
{
    /// Registry patching `memory`.
    pub fn new(memory: M) -> Self
    {
        Self {
            memory,
            next_id: 0,
            by_id: HashMap::new(),
            chains: HashMap::new(),
        }
    }

    /// The patched memory
    pub fn memory(&self) -> &M
    {
        &self.memory
    }

    /// Number of applied hooks
    pub fn len(&self) -> usize
    {
        self.by_id.len()
    }

    /// `true` if nothing is applied
    pub fn is_empty(&self) -> bool
    {
        self.by_id.is_empty()
    }

    /// State of hook `id`.
    pub fn info(&self, id: HookId) -> Option<HookInfo>
    {
        self.by_id.get(&id).copied()
    }

    /// Function hook `id` should call through to.
    pub fn original_for(&self, id: HookId) -> Option<Address>
    {
        self.by_id.get(&id).map(|info| info.original)
    }

    /// Install `hook`.
    ///
    /// ## Errors
    ///
    /// - `HookMismatch`: the slot does not hold what this registry or
    ///   `hook.expected` says it should, or `hook.replacement` is the slot's
    ///   vanilla function (reported with `expected == found`); nothing is written
    /// - `MemoryRead`/`MemoryWrite`/`HookFailed`: the slot could not be accessed
    pub fn apply(&mut self, hook: VMethodHook) -> Result<HookId>
    {
        let slot = hook.slot_address(self.memory.pointer_width())?;
        let chain = self.chains.get(&slot).map(Vec::as_slice).unwrap_or_default();

        if let Some(existing) = chain
            .iter()
            .copied()
            .find(|id| self.by_id.get(id).is_some_and(|info| info.hook.replacement == hook.replacement))
        {
            debug!(id = existing.raw(), %slot, "hook already applied");
            return Ok(existing);
        }

        let current = self.memory.read_pointer(slot)?;
        let bottom = chain.first().and_then(|id| self.by_id.get(id));
        let top = chain.last().and_then(|id| self.by_id.get(id));
        let (installed, vanilla) = match (bottom, top) {
            (Some(bottom), Some(top)) => (top.hook.replacement, Some(bottom.original)),
            _ => (current, None),
        };
        if current != installed {
            return Err(mismatch(slot, installed, current));
        }
        let vanilla = vanilla.unwrap_or(current);
        if let Some(expected) = hook.expected {
            if vanilla != expected {
                return Err(mismatch(slot, expected, vanilla));
            }
        }
        // installing the vanilla function would make the chain call itself
        if hook.replacement == vanilla {
            return Err(mismatch(slot, vanilla, hook.replacement));
        }

        self.memory.write_pointer(slot, hook.replacement)?;

        self.next_id += 1;
        let id = HookId(self.next_id);
        self.by_id.insert(
            id,
            HookInfo {
                id,
                hook,
                slot_address: slot,
                original: current,
            },
        );
        self.chains.entry(slot).or_default().push(id);
        debug!(id = id.raw(), %slot, replacement = %hook.replacement, original = %current, "hook applied");
        Ok(id)
    }

    /// Remove hook `id`, restoring or re-chaining its original.
    ///
    /// Returns `false` for an unknown id (never applied, or already removed).
    ///
    /// ## Errors
    ///
    /// `HookMismatch` if the slot of a top-of-chain hook was overwritten by
    /// someone else; the hook stays registered in that case.
    pub fn remove(&mut self, id: HookId) -> Result<bool>
    {
        let Some(info) = self.by_id.get(&id).copied() else {
            return Ok(false);
        };
        let chain = self.chains.get(&info.slot_address).cloned().unwrap_or_default();
        let Some(position) = chain.iter().position(|link| *link == id) else {
            return Ok(false);
        };

        if position + 1 == chain.len() {
            let current = self.memory.read_pointer(info.slot_address)?;
            if current != info.hook.replacement {
                return Err(mismatch(info.slot_address, info.hook.replacement, current));
            }
            self.memory.write_pointer(info.slot_address, info.original)?;
        } else if let Some(above) = self.by_id.get_mut(&chain[position + 1]) {
            above.original = info.original;
        }

        self.by_id.remove(&id);
        if let Some(links) = self.chains.get_mut(&info.slot_address) {
            links.retain(|link| *link != id);
            if links.is_empty() {
                self.chains.remove(&info.slot_address);
            }
        }
        debug!(id = id.raw(), slot = %info.slot_address, "hook removed");
        Ok(true)
    }

    /// Remove every hook, newest first.
    ///
    /// Keeps going after a failure and reports the first one.
    pub fn remove_all(&mut self) -> Result<()>
    {
        let mut ids: Vec<HookId> = self.by_id.keys().copied().collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));

        let mut first_error = None;
        for id in ids {
            if let Err(e) = self.remove(id) {
                warn!(id = id.raw(), error = %e, "failed to remove hook");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl<M: MemoryAccess> std::fmt::Debug for HookRegistry<M>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("HookRegistry")
            .field("hooks", &self.by_id.len())
            .field("slots", &self.chains.len())
            .finish_non_exhaustive()
    }
}

impl<M: MemoryAccess> Drop for HookRegistry<M>
{
    fn drop(&mut self)
    {
        if !self.by_id.is_empty() {
            if let Err(e) = self.remove_all() {
                warn!(error = %e, "hooks left installed at shutdown");
            }
        }
    }
}

fn mismatch(slot: Address, expected: Address, found: Address) -> BurrowError
{
    BurrowError::HookMismatch {
        slot,
        expected: expected.value(),
        found: found.value(),
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::memory_map::Permissions;
    use crate::platform::mock::MockProcess;

    const VTABLE: u64 = 0x2000;
    const VANILLA: [u64; 3] = [0x40_1000, 0x40_2000, 0x40_3000];

    fn vtable() -> MockProcess
    {
        let mock = MockProcess::builder(1)
            .region(VTABLE, 0x100, Permissions::READ_WRITE, None)
            .build();
        for (index, function) in VANILLA.iter().enumerate() {
            mock.write_u64(Address::new(VTABLE + 8 * index as u64), *function).unwrap();
        }
        mock
    }

    fn slot(mock: &MockProcess, index: u64) -> u64
    {
        mock.read_u64(Address::new(VTABLE + 8 * index)).unwrap()
    }

    fn hook(replacement: u64) -> VMethodHook
    {
        VMethodHook::new(Address::new(VTABLE), 1, Address::new(replacement))
    }

    #[test]
    fn apply_twice_then_remove_once()
    {
        let mock = vtable();
        let mut hooks = HookRegistry::new(mock.clone());
        let first = hooks.apply(hook(0x50_0000)).unwrap();
        let second = hooks.apply(hook(0x50_0000)).unwrap();
        assert_eq!(first, second);
        assert_eq!(hooks.len(), 1);
        assert_eq!(slot(&mock, 1), 0x50_0000);
        assert_eq!(hooks.original_for(first), Some(Address::new(VANILLA[1])));

        assert!(hooks.remove(first).unwrap());
        assert_eq!(slot(&mock, 1), VANILLA[1]);
        assert!(!hooks.remove(first).unwrap());
        // neighbours untouched
        assert_eq!(slot(&mock, 0), VANILLA[0]);
        assert_eq!(slot(&mock, 2), VANILLA[2]);
    }

    #[test]
    fn removing_an_unapplied_hook_is_a_no_op()
    {
        let mut hooks = HookRegistry::new(vtable());
        assert!(!hooks.remove(HookId(99)).unwrap());
    }

    #[test]
    fn mismatched_slot_blocks_installation()
    {
        let mock = vtable();
        let mut hooks = HookRegistry::new(mock.clone());
        let result = hooks.apply(hook(0x50_0000).expecting(Address::new(0x40_9999)));
        assert!(matches!(
            result,
            Err(BurrowError::HookMismatch { expected: 0x40_9999, found, .. }) if found == VANILLA[1]
        ));
        assert_eq!(slot(&mock, 1), VANILLA[1]);
        assert!(hooks.is_empty());

        hooks.apply(hook(0x50_0000).expecting(Address::new(VANILLA[1]))).unwrap();
    }

    #[test]
    fn vanilla_function_as_replacement_is_refused()
    {
        let mock = vtable();
        let mut hooks = HookRegistry::new(mock.clone());
        assert!(matches!(
            hooks.apply(hook(VANILLA[1])),
            Err(BurrowError::HookMismatch { expected, found, .. }) if expected == VANILLA[1] && found == VANILLA[1]
        ));
        assert!(hooks.is_empty());

        // also once the slot is already hooked
        let first = hooks.apply(hook(0x50_0000)).unwrap();
        assert!(matches!(hooks.apply(hook(VANILLA[1])), Err(BurrowError::HookMismatch { .. })));
        assert_eq!(hooks.len(), 1);
        assert_eq!(slot(&mock, 1), 0x50_0000);
        assert!(hooks.remove(first).unwrap());
        assert_eq!(slot(&mock, 1), VANILLA[1]);
    }

    #[test]
    fn chains_and_rechains()
    {
        let mock = vtable();
        let mut hooks = HookRegistry::new(mock.clone());
        let a = hooks.apply(hook(0x50_0000)).unwrap();
        let b = hooks.apply(hook(0x60_0000)).unwrap();
        let c = hooks.apply(hook(0x70_0000).expecting(Address::new(VANILLA[1]))).unwrap();
        assert_eq!(slot(&mock, 1), 0x70_0000);
        assert_eq!(hooks.original_for(c), Some(Address::new(0x60_0000)));
        assert_eq!(hooks.original_for(b), Some(Address::new(0x50_0000)));

        // middle link: slot untouched, C now calls A
        hooks.remove(b).unwrap();
        assert_eq!(slot(&mock, 1), 0x70_0000);
        assert_eq!(hooks.original_for(c), Some(Address::new(0x50_0000)));

        hooks.remove(c).unwrap();
        assert_eq!(slot(&mock, 1), 0x50_0000);
        hooks.remove(a).unwrap();
        assert_eq!(slot(&mock, 1), VANILLA[1]);
    }

    #[test]
    fn foreign_overwrite_is_detected()
    {
        let mock = vtable();
        let mut hooks = HookRegistry::new(mock.clone());
        let id = hooks.apply(hook(0x50_0000)).unwrap();
        mock.write_u64(Address::new(VTABLE + 8), 0x66_6666).unwrap();

        assert!(matches!(hooks.remove(id), Err(BurrowError::HookMismatch { .. })));
        assert!(matches!(hooks.apply(hook(0x60_0000)), Err(BurrowError::HookMismatch { .. })));
        // leave the slot as we found it so drop succeeds
        mock.write_u64(Address::new(VTABLE + 8), 0x50_0000).unwrap();
    }

    #[test]
    fn drop_restores_everything()
    {
        let mock = vtable();
        {
            let mut hooks = HookRegistry::new(mock.clone());
            hooks.apply(hook(0x50_0000)).unwrap();
            hooks.apply(VMethodHook::new(Address::new(VTABLE), 2, Address::new(0x60_0000))).unwrap();
        }
        assert_eq!(slot(&mock, 1), VANILLA[1]);
        assert_eq!(slot(&mock, 2), VANILLA[2]);
    }

    #[test]
    fn slot_addresses_follow_width()
    {
        let hook = VMethodHook::new(Address::new(0x1000), 3, Address::new(0x2000));
        assert_eq!(hook.slot_address(PointerWidth::Four).unwrap(), Address::new(0x100c));
        assert_eq!(hook.slot_address(PointerWidth::Eight).unwrap(), Address::new(0x1018));
    }
}
