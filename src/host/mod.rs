//! # Host
//!
//! The module loader owns every loaded module and performs the actual writes into them.
//! This module describes the part of its API the patcher consumes.

use std::fmt;

#[cfg(test)]
pub(crate) mod mock;
pub mod process;
#[cfg(feature = "taihen")]
pub mod taihen;

/// Status code returned by the loader. Negative values are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub i32);

impl Status {
    /// Generic loader failure
    pub const SYSTEM: Status = Status(0x9001_0000_u32 as i32);
    /// Out of memory
    pub const MEMORY: Status = Status(0x9001_0001_u32 as i32);
    /// Module, export or injection not found
    pub const NOT_FOUND: Status = Status(0x9001_0002_u32 as i32);
    /// Bad module, segment or offset
    pub const INVALID_ARGS: Status = Status(0x9001_0003_u32 as i32);
    /// The range is already covered by another injection
    pub const PATCH_EXISTS: Status = Status(0x9001_0005_u32 as i32);
    /// The caller is not allowed to patch the target
    pub const NOT_ALLOWED: Status = Status(0x9001_0009_u32 as i32);

    /// Whether the code denotes a failure
    pub fn is_error(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0 as u32)
    }
}

/// Loader-assigned identifier of a loaded module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(pub i32);

/// Handle of one applied injection, needed to undo it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InjectId(pub i32);
impl InjectId {
    /// Whether the loader can release this handle. Only positive handles are real.
    pub fn is_valid(self) -> bool {
        self.0 > 0
    }
}

/// What the loader reports about a module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Identifier to pass back into [`Host::inject_data`]
    pub id: ModuleId,
    /// Build fingerprint of the module image
    pub fingerprint: u32,
    /// Module name as reported by the loader
    pub name: String,
}

/// The loader's module lookup and data injection primitives.
///
/// Methods take `&self` because the loader API is process-global; implementations use interior mutability.
pub trait Host {
    /// Looks up a loaded module by name
    fn module_info(&self, name: &str) -> Result<ModuleInfo, Status>;

    /// Overwrites `data.len()` bytes at `offset` of segment `segment` of `module` with `data`.
    ///
    /// The write is byte-for-byte; no relocation or instruction boundary handling is done.
    fn inject_data(
        &self,
        module: ModuleId,
        segment: u32,
        offset: u32,
        data: &[u8],
    ) -> Result<InjectId, Status>;

    /// Undoes an injection made by [`Host::inject_data`]
    fn inject_release(&self, id: InjectId) -> Result<(), Status>;
}

impl<H: Host + ?Sized> Host for &H {
    fn module_info(&self, name: &str) -> Result<ModuleInfo, Status> {
        (**self).module_info(name)
    }

    fn inject_data(
        &self,
        module: ModuleId,
        segment: u32,
        offset: u32,
        data: &[u8],
    ) -> Result<InjectId, Status> {
        (**self).inject_data(module, segment, offset, data)
    }

    fn inject_release(&self, id: InjectId) -> Result<(), Status> {
        (**self).inject_release(id)
    }
}
