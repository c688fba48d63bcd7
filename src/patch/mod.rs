//! # Patch
//!
//! This module covers patch tables, which overwrite a list of locations in a module with the same bytes
//! and remember how to undo each overwrite

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::host::{Host, InjectId, ModuleId};

pub mod thumb;

/// Replacement bytes written verbatim at every offset of a table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchDescriptor {
    /// Bytes to write. Their length is the length being overwritten.
    bytes: &'static [u8],
}
impl PatchDescriptor {
    /// Creates a descriptor from its replacement bytes
    pub const fn new(bytes: &'static [u8]) -> Self {
        Self { bytes }
    }

    /// Replacement bytes
    pub const fn bytes(&self) -> &'static [u8] {
        self.bytes
    }

    /// Number of bytes overwritten at each offset
    pub const fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the descriptor writes nothing
    pub const fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// An ordered set of offsets sharing one [`PatchDescriptor`], together with the handle of each applied entry.
///
/// `handles[i]` is `Some` exactly when `offsets[i]` is currently overwritten.
#[derive(Debug, Clone)]
pub struct PatchTable {
    /// Name used in logs and errors
    name: &'static str,
    /// Bytes written at every offset
    descriptor: PatchDescriptor,
    /// Target offsets, in application order
    offsets: &'static [u32],
    /// Handle per offset; `None` until applied and after release
    handles: Vec<Option<InjectId>>,
}

impl PatchTable {
    /// Creates a table with nothing applied
    pub fn new(name: &'static str, descriptor: PatchDescriptor, offsets: &'static [u32]) -> Self {
        Self {
            name,
            descriptor,
            offsets,
            handles: vec![None; offsets.len()],
        }
    }

    /// Name of the table
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Bytes written at every offset
    pub fn descriptor(&self) -> PatchDescriptor {
        self.descriptor
    }

    /// Target offsets
    pub fn offsets(&self) -> &'static [u32] {
        self.offsets
    }

    /// Handle per offset
    pub fn handles(&self) -> &[Option<InjectId>] {
        &self.handles
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Whether the table has no entries
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Number of entries currently applied
    pub fn applied(&self) -> usize {
        self.handles.iter().filter(|h| h.is_some()).count()
    }

    /// Whether every entry is currently applied
    pub fn is_fully_applied(&self) -> bool {
        self.handles.iter().all(Option::is_some)
    }

    /// Writes the descriptor at every offset of `segment` in `module`, in order.
    ///
    /// Stops at the first entry the host refuses. Entries applied before it stay applied,
    /// entries after it are never attempted.
    pub fn apply<H: Host>(&mut self, host: &H, module: ModuleId, segment: u32) -> Result<()> {
        for (index, (&offset, handle)) in self.offsets.iter().zip(&mut self.handles).enumerate() {
            match host.inject_data(module, segment, offset, self.descriptor.bytes) {
                Ok(id) => {
                    debug!("{}[{}] at {:#08X} -> {:?}", self.name, index, offset, id);
                    *handle = Some(id);
                }
                Err(status) => {
                    warn!(
                        "Failed to apply {}[{}] at {:#08X}: {}",
                        self.name, index, offset, status
                    );
                    return Err(Error::Inject {
                        table: self.name,
                        index,
                        offset,
                        status,
                    });
                }
            }
        }
        info!("Applied {} ({} entries)", self.name, self.len());
        Ok(())
    }

    /// Undoes every applied entry. Entries that were never applied, or whose handle is not positive, are skipped.
    ///
    /// A release the host refuses is logged and the handle is forgotten anyway.
    pub fn release<H: Host>(&mut self, host: &H) {
        for (index, handle) in self.handles.iter_mut().enumerate() {
            let Some(id) = handle.take() else {
                continue;
            };
            if !id.is_valid() {
                continue;
            }
            if let Err(status) = host.inject_release(id) {
                warn!(
                    "Failed to release {}[{}] ({:?}): {}",
                    self.name, index, id, status
                );
            }
        }
    }
}
