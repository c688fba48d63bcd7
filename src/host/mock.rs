//! Recording host for tests

use std::cell::RefCell;
use std::collections::HashMap;

use super::{Host, InjectId, ModuleId, ModuleInfo, Status};

/// Host that records every call and fails where it is told to
#[derive(Default)]
pub(crate) struct MockHost {
    /// Modules that can be looked up
    pub modules: Vec<ModuleInfo>,
    /// Offsets that are refused, with the status to refuse them with
    pub failing_offsets: HashMap<u32, Status>,
    /// Handles whose release fails
    pub failing_releases: Vec<InjectId>,
    /// Every `inject_data` call, including refused ones
    pub injects: RefCell<Vec<(ModuleId, u32, u32, Vec<u8>)>>,
    /// Every `inject_release` call
    pub releases: RefCell<Vec<InjectId>>,
    /// Every `module_info` call
    pub lookups: RefCell<Vec<String>>,
    /// Last handle handed out
    pub last_id: RefCell<i32>,
}

impl MockHost {
    /// Host with a single module
    pub fn with_module(name: &str, fingerprint: u32) -> Self {
        Self {
            modules: vec![ModuleInfo {
                id: ModuleId(0x4000_0001),
                fingerprint,
                name: name.to_owned(),
            }],
            ..Default::default()
        }
    }

    /// Refuses injection at `offset`
    pub fn fail_at(mut self, offset: u32, status: Status) -> Self {
        self.failing_offsets.insert(offset, status);
        self
    }

    /// Number of injection attempts
    pub fn inject_count(&self) -> usize {
        self.injects.borrow().len()
    }

    /// How many times `id` was released
    pub fn release_count(&self, id: InjectId) -> usize {
        self.releases.borrow().iter().filter(|&&r| r == id).count()
    }
}

impl Host for MockHost {
    fn module_info(&self, name: &str) -> Result<ModuleInfo, Status> {
        self.lookups.borrow_mut().push(name.to_owned());
        self.modules
            .iter()
            .find(|m| m.name == name)
            .cloned()
            .ok_or(Status::NOT_FOUND)
    }

    fn inject_data(
        &self,
        module: ModuleId,
        segment: u32,
        offset: u32,
        data: &[u8],
    ) -> Result<InjectId, Status> {
        self.injects
            .borrow_mut()
            .push((module, segment, offset, data.to_vec()));
        if let Some(status) = self.failing_offsets.get(&offset) {
            return Err(*status);
        }
        let mut last = self.last_id.borrow_mut();
        *last += 1;
        Ok(InjectId(*last))
    }

    fn inject_release(&self, id: InjectId) -> Result<(), Status> {
        self.releases.borrow_mut().push(id);
        if self.failing_releases.contains(&id) {
            return Err(Status::SYSTEM);
        }
        Ok(())
    }
}
