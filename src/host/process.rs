//! This module contains a host which patches memory of the current process
//!
//! Modules are registered by the embedder as a name, a fingerprint and a list of segments.
//! Injections change the page permissions of the target, write the patch, and then revert the permissions.

use std::collections::HashMap;
use std::ptr;
use std::sync::Mutex;

use region::Protection;

use super::{Host, InjectId, ModuleId, ModuleInfo, Status};

/// One addressable region of a registered module
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    /// Start of the segment
    base: *mut u8,
    /// Length of the segment in bytes
    len: usize,
}
impl Segment {
    /// Describes a segment starting at `base`
    ///
    /// # Safety
    ///
    /// `base` must be [https://doc.rust-lang.org/stable/std/ptr/index.html#safety](valid) for reads and writes of `len` bytes
    /// for as long as the segment is registered with a [`ProcessHost`].
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Self {
        Self { base, len }
    }

    /// Length of the segment in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the segment is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A module registered with [`ProcessHost::register`]
struct LoadedModule {
    /// Loader-style module info
    info: ModuleInfo,
    /// Segments by index
    segments: Vec<Segment>,
}

/// Bookkeeping for a live injection
struct Injection {
    /// Module the injection belongs to
    module: ModuleId,
    /// Segment index the injection belongs to
    segment: u32,
    /// Offset into the segment
    offset: usize,
    /// Location of the patch
    location: *mut u8,
    /// Original data from `location`
    original: Vec<u8>,
}
impl Injection {
    /// Whether this injection overlaps `len` bytes at `offset` of the same module and segment
    fn overlaps(&self, module: ModuleId, segment: u32, offset: usize, len: usize) -> bool {
        self.module == module
            && self.segment == segment
            && offset < self.offset + self.original.len()
            && self.offset < offset + len
    }
}

/// Mutable state of a [`ProcessHost`]
#[derive(Default)]
struct State {
    /// Registered modules
    modules: Vec<LoadedModule>,
    /// Live injections by handle
    injections: HashMap<i32, Injection>,
    /// Last handle or module id handed out
    last_id: i32,
}
impl State {
    /// Hands out a fresh positive identifier
    fn next_id(&mut self) -> Result<i32, Status> {
        self.last_id = self.last_id.checked_add(1).ok_or(Status::MEMORY)?;
        Ok(self.last_id)
    }
}

/// Host that injects into memory of the current process.
///
/// Useful for exercising patch tables against an image loaded by the embedder
/// (or a plain buffer) without the console's loader.
#[derive(Default)]
pub struct ProcessHost {
    /// All state, behind a lock since [`Host`] methods take `&self`
    state: Mutex<State>,
}

impl ProcessHost {
    /// Creates a host with no modules registered
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a module so it can be looked up and patched.
    ///
    /// # Safety
    ///
    /// Every segment must stay valid for as long as this host lives or has live injections into it.
    pub unsafe fn register(
        &self,
        name: &str,
        fingerprint: u32,
        segments: Vec<Segment>,
    ) -> Result<ModuleId, Status> {
        let mut state = self.state.lock().map_err(|_| Status::SYSTEM)?;
        let id = ModuleId(state.next_id()?);
        state.modules.push(LoadedModule {
            info: ModuleInfo {
                id,
                fingerprint,
                name: name.to_owned(),
            },
            segments,
        });
        Ok(id)
    }

    /// Number of injections that have not been released
    pub fn live_injections(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.injections.len())
            .unwrap_or_default()
    }
}

/// Runs `write` with the pages covering `len` bytes at `location` made writable,
/// then restores their previous protection
///
/// # Safety
///
/// `location` must be valid for `len` bytes
unsafe fn with_writable(
    location: *mut u8,
    len: usize,
    write: impl FnOnce(),
) -> Result<(), region::Error> {
    let protection = region::query(location as *const u8)?.protection() | Protection::READ_WRITE;
    let _guard = region::protect_with_handle(location as *const u8, len, protection)?;
    write();
    Ok(())
}

impl Host for ProcessHost {
    fn module_info(&self, name: &str) -> Result<ModuleInfo, Status> {
        let state = self.state.lock().map_err(|_| Status::SYSTEM)?;
        state
            .modules
            .iter()
            .find(|module| module.info.name == name)
            .map(|module| module.info.clone())
            .ok_or(Status::NOT_FOUND)
    }

    fn inject_data(
        &self,
        module: ModuleId,
        segment: u32,
        offset: u32,
        data: &[u8],
    ) -> Result<InjectId, Status> {
        let mut state = self.state.lock().map_err(|_| Status::SYSTEM)?;
        let target = state
            .modules
            .iter()
            .find(|m| m.info.id == module)
            .ok_or(Status::NOT_FOUND)?
            .segments
            .get(segment as usize)
            .copied()
            .ok_or(Status::INVALID_ARGS)?;

        let offset = offset as usize;
        let end = offset.checked_add(data.len()).ok_or(Status::INVALID_ARGS)?;
        if data.is_empty() || end > target.len {
            return Err(Status::INVALID_ARGS);
        }
        if state
            .injections
            .values()
            .any(|i| i.overlaps(module, segment, offset, data.len()))
        {
            return Err(Status::PATCH_EXISTS);
        }

        let id = state.next_id()?;

        // Safety: `register` requires the segment to be valid, and we checked that the patch fits inside it
        let location = unsafe { target.base.add(offset) };
        let mut original = vec![0u8; data.len()];
        unsafe {
            ptr::copy(location, original.as_mut_ptr(), data.len());
            with_writable(location, data.len(), || {
                ptr::copy(data.as_ptr(), location, data.len())
            })
            .map_err(|_| Status::NOT_ALLOWED)?;
        }

        state.injections.insert(
            id,
            Injection {
                module,
                segment,
                offset,
                location,
                original,
            },
        );
        Ok(InjectId(id))
    }

    fn inject_release(&self, id: InjectId) -> Result<(), Status> {
        let mut state = self.state.lock().map_err(|_| Status::SYSTEM)?;
        let injection = state.injections.remove(&id.0).ok_or(Status::NOT_FOUND)?;
        let Injection {
            location, original, ..
        } = &injection;
        // Safety: the location was valid when injected and `register` requires it to stay valid
        let restored = unsafe {
            with_writable(*location, original.len(), || {
                ptr::copy(original.as_ptr(), *location, original.len())
            })
        };
        if restored.is_err() {
            // keep the bookkeeping so the caller can retry
            state.injections.insert(id.0, injection);
            return Err(Status::NOT_ALLOWED);
        }
        Ok(())
    }
}
