//! Reader/writer for the host's context menu value arrays.
//!
//! The host builds each menu as a heap array of [`TaggedValue`] slots
//! whose shape depends on run-time context: a title slot may or may not be
//! present, and titled sub-menus come in two packings. Nothing in the data
//! names the shape; it is inferred from a few structural cues and
//! recomputed on every call, because the same view type is reused across
//! structurally different arrays.
//!
//! [`MenuArrayView::read`] decodes the array into ordered [`MenuItem`]s
//! and [`MenuArrayView::write`] encodes a new item list back, rebuilding
//! the array through the host's own allocator when the item count changes.

use std::ffi::c_void;

use thiserror::Error;
use tracing::{debug, warn};

use crate::host_alloc::HostAllocator;

/// Raw type tags the host stores in a value slot.
pub mod tag {
    pub const EMPTY: u32 = 0;
    pub const BOOL: u32 = 2;
    pub const INT: u32 = 3;
    pub const UINT: u32 = 5;
    pub const FLOAT: u32 = 7;
    pub const STRING: u32 = 8;
    pub const POINTER: u32 = 11;
    /// Second string representation the host emits for strings it owns.
    pub const MANAGED_STRING: u32 = 38;
}

/// Whether `raw` is one of the tags the host uses for string payloads.
pub fn is_string_tag(raw: u32) -> bool {
    matches!(raw, tag::STRING | tag::MANAGED_STRING)
}

/// One self-describing slot of a host value array: a 32-bit type tag
/// followed by an 8-byte payload.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TaggedValue {
    tag: u32,
    _pad: u32,
    payload: u64,
}

const _: () = assert!(std::mem::size_of::<TaggedValue>() == 16);

impl TaggedValue {
    pub const EMPTY: TaggedValue = TaggedValue {
        tag: tag::EMPTY,
        _pad: 0,
        payload: 0,
    };

    pub fn tag(&self) -> u32 {
        self.tag
    }

    pub fn int(&self) -> i32 {
        self.payload as u32 as i32
    }

    pub fn uint(&self) -> u32 {
        self.payload as u32
    }

    pub fn float(&self) -> f32 {
        f32::from_bits(self.payload as u32)
    }

    pub fn string_ptr(&self) -> *const u8 {
        self.payload as usize as *const u8
    }

    pub fn set_int(&mut self, value: i32) {
        self.tag = tag::INT;
        self.payload = value as u32 as u64;
    }

    pub fn set_uint(&mut self, value: u32) {
        self.tag = tag::UINT;
        self.payload = value as u64;
    }

    pub fn set_float(&mut self, value: f32) {
        self.tag = tag::FLOAT;
        self.payload = value.to_bits() as u64;
    }

    pub fn set_string(&mut self, ptr: *const u8) {
        self.tag = tag::STRING;
        self.payload = ptr as usize as u64;
    }

    /// An int slot, as the host writes positional flags and counts.
    pub fn from_int(value: i32) -> Self {
        let mut v = Self::EMPTY;
        v.set_int(value);
        v
    }

    pub fn from_uint(value: u32) -> Self {
        let mut v = Self::EMPTY;
        v.set_uint(value);
        v
    }

    pub fn from_string(ptr: *const u8) -> Self {
        let mut v = Self::EMPTY;
        v.set_string(ptr);
        v
    }
}

impl std::fmt::Debug for TaggedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaggedValue")
            .field("tag", &self.tag)
            .field("payload", &format_args!("{:#x}", self.payload))
            .finish()
    }
}

/// Pagination affordance shown on a menu entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MenuIndicator {
    #[default]
    None,
    Previous,
    Next,
}

/// A decoded menu entry, in display order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuItem {
    pub name: String,
    pub enabled: bool,
    pub indicator: MenuIndicator,
    /// Entry of the host's parallel action table; opaque to this layer.
    pub action: u8,
}

/// Failures of [`MenuArrayView::write`].
#[derive(Debug, Error)]
pub enum MenuError {
    /// The host allocator could not satisfy a staged allocation. The live
    /// array is untouched when this is returned.
    #[error("host allocator returned null for {requested} bytes")]
    OutOfHostMemory { requested: usize },
}

/// The closed set of array shapes the host is observed to produce,
/// derived fresh from the first few slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MenuLayout {
    has_title: bool,
    alternate: bool,
}

impl MenuLayout {
    /// Infers the shape: slot 1 carrying a string means the menu has a
    /// title, and titled menus whose probe slot 7 holds 8 use the denser
    /// packing the host emits for inventory-triggered sub-menus.
    pub fn infer(values: &[TaggedValue]) -> Self {
        let has_title = values.get(1).is_some_and(|v| is_string_tag(v.tag()));
        let alternate = has_title && values.get(7).is_some_and(|v| v.int() == 8);
        Self { has_title, alternate }
    }

    pub fn has_title(&self) -> bool {
        self.has_title
    }

    pub fn is_alternate(&self) -> bool {
        self.alternate
    }

    pub fn first_item_index(&self) -> usize {
        if self.has_title {
            8
        } else {
            7
        }
    }

    fn previous_flags_index(&self) -> usize {
        if self.has_title {
            6
        } else {
            2
        }
    }

    fn next_flags_index(&self) -> usize {
        if self.has_title {
            5
        } else {
            3
        }
    }

    fn name_offset(&self) -> usize {
        if self.alternate {
            1
        } else {
            0
        }
    }

    fn disabled_offset(&self, item_count: usize) -> usize {
        if self.alternate {
            2
        } else {
            item_count
        }
    }

    /// Stride between consecutive entries.
    fn values_per_item(&self) -> usize {
        if self.alternate {
            4
        } else {
            1
        }
    }

    /// Slots reserved per entry when the array is rebuilt; the sparse
    /// layouts carry their disabled flags in a trailing region.
    fn rebuilt_values_per_item(&self) -> usize {
        if self.alternate {
            4
        } else {
            2
        }
    }

    fn item_base_index(&self, index: usize) -> usize {
        self.first_item_index() + index * self.values_per_item()
    }

    /// Index of entry `index` in the parallel action table.
    fn action_index(&self, index: usize) -> usize {
        if self.alternate {
            index
        } else {
            self.first_item_index() + index
        }
    }
}

fn has_flag(mask: u32, index: usize) -> bool {
    index < 32 && mask & (1 << index) != 0
}

fn set_flag(mask: &mut u32, index: usize) {
    if index < 32 {
        *mask |= 1 << index;
    } else {
        warn!("indicator bit {index} beyond mask width");
    }
}

const COUNT_HEADER_SIZE: usize = 8;
const VALUE_SIZE: usize = std::mem::size_of::<TaggedValue>();

/// A read/write view over one host-owned menu value array and its parallel
/// action table.
///
/// The view is ephemeral: it is built from a replacement callback's
/// arguments, used within that callback and dropped. It owns no memory
/// while reading; a [`write`](Self::write) that rebuilds the array frees
/// the block it replaces and adopts the new one on the host's behalf.
pub struct MenuArrayView<'a> {
    values: *mut TaggedValue,
    value_count: usize,
    actions: *mut u8,
    host: &'a HostAllocator,
}

impl<'a> MenuArrayView<'a> {
    /// Builds a view over `value_count` slots at `values` and the action
    /// table at `actions` (may be null; actions then decode as 0).
    ///
    /// # Safety
    ///
    /// `values` must point at `value_count` initialized slots. For
    /// [`write`](Self::write), `values` must additionally sit directly
    /// past the 8-byte element-count header of a live host allocation,
    /// and `actions` must cover the indices implied by the layout.
    pub unsafe fn new(
        values: *mut TaggedValue,
        value_count: usize,
        actions: *mut u8,
        host: &'a HostAllocator,
    ) -> Self {
        Self {
            values,
            value_count,
            actions,
            host,
        }
    }

    pub fn values_ptr(&self) -> *mut TaggedValue {
        self.values
    }

    pub fn value_count(&self) -> usize {
        self.value_count
    }

    fn values(&self) -> &[TaggedValue] {
        unsafe { std::slice::from_raw_parts(self.values, self.value_count) }
    }

    fn values_mut(&mut self) -> &mut [TaggedValue] {
        unsafe { std::slice::from_raw_parts_mut(self.values, self.value_count) }
    }

    /// Number of menu entries the count slot declares.
    pub fn item_count(&self) -> usize {
        self.values().first().map_or(0, |v| v.int().max(0) as usize)
    }

    pub fn layout(&self) -> MenuLayout {
        MenuLayout::infer(self.values())
    }

    pub fn has_title(&self) -> bool {
        self.layout().has_title()
    }

    /// The title string at slot 1, when present.
    pub fn title(&self) -> Option<String> {
        let values = self.values();
        let layout = MenuLayout::infer(values);
        if !layout.has_title() {
            return None;
        }
        let ptr = values[1].string_ptr();
        if ptr.is_null() {
            return None;
        }
        Some(unsafe { read_cstring(ptr) })
    }

    /// Screen position the host stored for titled menus.
    pub fn position(&self) -> Option<(i32, i32)> {
        let values = self.values();
        if MenuLayout::infer(values).has_title() {
            Some((values.get(2)?.int(), values.get(3)?.int()))
        } else {
            None
        }
    }

    /// Decodes the array into menu items, preserving display order.
    pub fn read(&self) -> Vec<MenuItem> {
        let values = self.values();
        let layout = MenuLayout::infer(values);
        let item_count = self.item_count();

        let previous_mask = values
            .get(layout.previous_flags_index())
            .map_or(0, |v| v.uint());
        let next_mask = values.get(layout.next_flags_index()).map_or(0, |v| v.uint());

        // The host sometimes sizes arrays without the trailing disabled
        // region; such entries decode as enabled.
        let disabled_defined = layout.first_item_index() + item_count < self.value_count;
        if !disabled_defined && item_count > 0 {
            warn!(
                "disabled region absent: {item_count} items in {} values",
                self.value_count
            );
        }

        let mut items = Vec::with_capacity(item_count);
        for index in 0..item_count {
            let base = layout.item_base_index(index);
            let Some(name_value) = values.get(base + layout.name_offset()) else {
                warn!("entry {index} slot beyond the value array");
                break;
            };
            // The host pads with empty slots.
            if name_value.tag() == tag::EMPTY {
                continue;
            }
            let name_ptr = name_value.string_ptr();
            if name_ptr.is_null() {
                warn!("entry {index} name pointer is null");
                continue;
            }
            let name = unsafe { read_cstring(name_ptr) };

            // The host stores is-disabled, not is-enabled.
            let enabled = if disabled_defined {
                values
                    .get(base + layout.disabled_offset(item_count))
                    .map_or(true, |v| v.int() == 0)
            } else {
                true
            };

            let action = self.action_at(layout.action_index(index));

            let indicator = if has_flag(previous_mask, index) {
                MenuIndicator::Previous
            } else if has_flag(next_mask, index) {
                MenuIndicator::Next
            } else {
                MenuIndicator::None
            };

            items.push(MenuItem {
                name,
                enabled,
                indicator,
                action,
            });
        }
        items
    }

    /// Encodes `items` back into the host array.
    ///
    /// The array is rebuilt through the host allocator whenever the item
    /// count changes, or unconditionally when `allow_reallocate` is set.
    /// Every host allocation (name buffers and the rebuilt block) is
    /// staged before the live array is touched, so on
    /// [`MenuError::OutOfHostMemory`] the old array is intact and no
    /// staged block leaks.
    pub fn write(&mut self, items: &[MenuItem], allow_reallocate: bool) -> Result<(), MenuError> {
        let layout = self.layout();
        let new_item_count = items.len();

        let mut staged = Staged::new(self.host);
        let names = items
            .iter()
            .map(|item| staged.copy_name(item.name.as_bytes()))
            .collect::<Result<Vec<_>, _>>()?;

        let rebuild = allow_reallocate || new_item_count != self.item_count();
        let rebuilt = if rebuild {
            let value_count =
                layout.first_item_index() + new_item_count * layout.rebuilt_values_per_item();
            let block = staged.block(COUNT_HEADER_SIZE + value_count * VALUE_SIZE)?;
            Some((block, value_count))
        } else {
            None
        };

        // All allocations succeeded; nothing below can fail.
        staged.commit();

        if let Some((block, value_count)) = rebuilt {
            self.replace_array(layout, block, value_count);
        }

        let values = self.values_mut();
        if let Some(count_slot) = values.first_mut() {
            count_slot.set_uint(new_item_count as u32);
        }

        let mut previous_mask = 0u32;
        let mut next_mask = 0u32;
        for (index, (item, name)) in items.iter().zip(&names).enumerate() {
            let base = layout.item_base_index(index);

            let name_index = base + layout.name_offset();
            let disabled_index = base + layout.disabled_offset(new_item_count);
            let values = unsafe { std::slice::from_raw_parts_mut(self.values, self.value_count) };
            match values.get_mut(name_index) {
                Some(slot) => slot.set_string(*name),
                None => {
                    warn!("entry {index} name slot beyond the value array");
                    continue;
                }
            }
            if let Some(slot) = values.get_mut(disabled_index) {
                slot.set_int(if item.enabled { 0 } else { 1 });
            }

            self.set_action(layout.action_index(index), item.action);

            match item.indicator {
                MenuIndicator::Previous => set_flag(&mut previous_mask, index),
                MenuIndicator::Next => set_flag(&mut next_mask, index),
                MenuIndicator::None => {}
            }
        }

        let values = self.values_mut();
        if let Some(slot) = values.get_mut(layout.previous_flags_index()) {
            slot.set_uint(previous_mask);
        }
        if let Some(slot) = values.get_mut(layout.next_flags_index()) {
            slot.set_uint(next_mask);
        }
        Ok(())
    }

    /// Swaps the live array for a freshly staged block: copy the pre-item
    /// header forward, stamp the element count, free the old block, adopt.
    /// The array stays fully initialized at every step the host could
    /// observe.
    fn replace_array(&mut self, layout: MenuLayout, block: *mut c_void, value_count: usize) {
        let new_values = unsafe { (block as *mut u8).add(COUNT_HEADER_SIZE) } as *mut TaggedValue;
        let header_values = layout
            .first_item_index()
            .min(self.value_count)
            .min(value_count);
        unsafe {
            std::ptr::copy_nonoverlapping(self.values, new_values, header_values);
            (block as *mut u64).write_unaligned(value_count as u64);
        }

        let old_block = unsafe { (self.values as *mut u8).sub(COUNT_HEADER_SIZE) } as *mut c_void;
        self.host.free(old_block);

        self.values = new_values;
        self.value_count = value_count;
        debug!("menu value array rebuilt with {value_count} values");
    }

    fn action_at(&self, index: usize) -> u8 {
        if self.actions.is_null() {
            warn!("action table missing, entry {index}");
            return 0;
        }
        unsafe { *self.actions.add(index) }
    }

    fn set_action(&mut self, index: usize, action: u8) {
        if self.actions.is_null() {
            warn!("action table missing, entry {index}");
            return;
        }
        unsafe { *self.actions.add(index) = action };
    }
}

unsafe fn read_cstring(ptr: *const u8) -> String {
    let mut len = 0;
    while *ptr.add(len) != 0 {
        len += 1;
    }
    String::from_utf8_lossy(std::slice::from_raw_parts(ptr, len)).into_owned()
}

/// Host allocations staged for a write; freed on drop unless committed.
struct Staged<'a> {
    host: &'a HostAllocator,
    blocks: Vec<*mut c_void>,
}

impl<'a> Staged<'a> {
    fn new(host: &'a HostAllocator) -> Self {
        Self {
            host,
            blocks: vec![],
        }
    }

    fn block(&mut self, size: usize) -> Result<*mut c_void, MenuError> {
        let ptr = self.host.allocate(size);
        if ptr.is_null() {
            return Err(MenuError::OutOfHostMemory { requested: size });
        }
        unsafe { std::ptr::write_bytes(ptr as *mut u8, 0, size) };
        self.blocks.push(ptr);
        Ok(ptr)
    }

    /// Copies `name` into a host block with a trailing terminator.
    fn copy_name(&mut self, name: &[u8]) -> Result<*const u8, MenuError> {
        let block = self.block(name.len() + 1)? as *mut u8;
        unsafe { std::ptr::copy_nonoverlapping(name.as_ptr(), block, name.len()) };
        Ok(block as *const u8)
    }

    fn commit(mut self) {
        self.blocks.clear();
    }
}

impl Drop for Staged<'_> {
    fn drop(&mut self) {
        for block in self.blocks.drain(..) {
            self.host.free(block);
        }
    }
}
