//! # Plugin
//!
//! Lifecycle of the patcher as driven by the module loader: resolve the target module,
//! apply every enabled fix on start, release everything on stop.

use std::sync::{Mutex, PoisonError};

use tracing::{error, info, warn};

use crate::catalog::{Fix, Target};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::host::{Host, ModuleInfo};
use crate::patch::PatchTable;

/// How much of the enabled fixes ended up applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coverage {
    /// Every table applied
    Full,
    /// Some optional table failed
    Partial,
}

/// Where the plugin is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Nothing done yet
    Unresolved,
    /// Target module found and verified
    Resolved,
    /// Every mandatory table applied
    Patched(Coverage),
    /// Start failed; mandatory entries applied before the failure are still in place
    Failed,
    /// Everything released
    Stopped,
}

/// Result of `module_start` as the loader understands it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartStatus {
    /// Stay resident
    Success,
    /// Unload the plugin
    NoResident,
}
impl StartStatus {
    /// Loader return code
    pub fn code(self) -> i32 {
        match self {
            StartStatus::Success => 0,
            StartStatus::NoResident => 1,
        }
    }
}

/// Result of `module_stop` as the loader understands it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStatus {
    /// Stopped
    Success,
}
impl StopStatus {
    /// Loader return code
    pub fn code(self) -> i32 {
        0
    }
}

/// A patch table together with the fix it came from
#[derive(Debug)]
struct Entry {
    /// Static description of the fix
    fix: &'static Fix,
    /// Applied state of the fix
    table: PatchTable,
}

/// Owns every patch table for one target and drives them through start and stop
pub struct Plugin<H: Host> {
    /// Loader used for lookups and injections
    host: H,
    /// Module build being patched
    target: Target,
    /// Resolved module, once found
    module: Option<ModuleInfo>,
    /// One table per enabled fix, in application order
    entries: Vec<Entry>,
    /// Current lifecycle stage
    stage: Stage,
}

impl<H: Host> Plugin<H> {
    /// Creates a plugin for `target` with one empty table per fix enabled in `config`
    pub fn new(host: H, target: Target, config: &Config) -> Self {
        let entries = config
            .enabled_fixes(&target)
            .into_iter()
            .map(|fix| Entry {
                fix,
                table: PatchTable::new(fix.name, fix.descriptor, fix.offsets),
            })
            .collect();
        Self {
            host,
            target,
            module: None,
            entries,
            stage: Stage::Unresolved,
        }
    }

    /// Current lifecycle stage
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Target module, once resolved
    pub fn module(&self) -> Option<&ModuleInfo> {
        self.module.as_ref()
    }

    /// Tables in application order
    pub fn tables(&self) -> impl Iterator<Item = &PatchTable> {
        self.entries.iter().map(|entry| &entry.table)
    }

    /// Table of the fix named `name`, if it is enabled
    pub fn table(&self, name: &str) -> Option<&PatchTable> {
        self.tables().find(|table| table.name() == name)
    }

    /// Loader this plugin talks to
    pub fn host(&self) -> &H {
        &self.host
    }

    /// Loader entry point for starting. Errors are logged and turned into [`StartStatus::NoResident`].
    pub fn start(&mut self) -> StartStatus {
        match self.try_start() {
            Ok(coverage) => {
                match coverage {
                    Coverage::Full => info!("All patches applied - enjoy the Black Label experience!"),
                    Coverage::Partial => {
                        info!("Mandatory patches applied - enjoy the Black Label experience!")
                    }
                }
                StartStatus::Success
            }
            Err(e) => {
                error!("{}", e);
                StartStatus::NoResident
            }
        }
    }

    /// Resolves the target and applies every enabled table.
    ///
    /// On failure tables that were already applied are left in place; only [`Plugin::stop`] releases them.
    pub fn try_start(&mut self) -> Result<Coverage> {
        if self.stage != Stage::Unresolved {
            return Err(Error::AlreadyStarted);
        }

        let module = self.resolve().inspect_err(|_| self.stage = Stage::Failed)?;
        self.stage = Stage::Resolved;

        let mut coverage = Coverage::Full;
        for Entry { fix, table } in &mut self.entries {
            match table.apply(&self.host, module.id, self.target.segment) {
                Ok(()) => {}
                Err(e) if !fix.required => {
                    warn!("Skipping optional fix {} ({}): {}", fix.name, fix.summary, e);
                    coverage = Coverage::Partial;
                }
                Err(e) => {
                    self.stage = Stage::Failed;
                    return Err(e);
                }
            }
        }

        self.stage = Stage::Patched(coverage);
        Ok(coverage)
    }

    /// Looks up the target module and checks its fingerprint
    fn resolve(&mut self) -> Result<ModuleInfo> {
        let name = self.target.module_name;
        let info = self
            .host
            .module_info(name)
            .map_err(|status| Error::ModuleNotFound { name, status })?;
        if info.fingerprint != self.target.fingerprint {
            return Err(Error::VersionMismatch {
                expected: self.target.fingerprint,
                actual: info.fingerprint,
            });
        }
        info!("Found {} ({:?})", info.name, info.id);
        self.module = Some(info.clone());
        Ok(info)
    }

    /// Loader entry point for stopping. Releases every applied entry of every table, whatever the current stage.
    pub fn stop(&mut self) -> StopStatus {
        for entry in &mut self.entries {
            entry.table.release(&self.host);
        }
        self.stage = Stage::Stopped;
        StopStatus::Success
    }
}

/// Holds the running plugin between the loader's start and stop callbacks.
///
/// A poisoned lock is recovered rather than reported, so a started plugin is never lost before it is stopped.
pub struct PluginSlot<H: Host> {
    /// The plugin, if one was started
    plugin: Mutex<Option<Plugin<H>>>,
}

impl<H: Host> PluginSlot<H> {
    /// Creates an empty slot
    pub fn new() -> Self {
        Self {
            plugin: Mutex::new(None),
        }
    }

    /// Stores `plugin`, replacing any previous one
    pub fn store(&self, plugin: Plugin<H>) {
        *self.plugin.lock().unwrap_or_else(PoisonError::into_inner) = Some(plugin);
    }

    /// Takes the stored plugin out of the slot
    pub fn take(&self) -> Option<Plugin<H>> {
        self.plugin
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl<H: Host> Default for PluginSlot<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use crate::catalog::{Fix, Target, BLACK_LABEL, CHARGEBOOTS_FIX, NO_NAGSCREENS};
    use crate::config::Config;
    use crate::error::Error;
    use crate::host::mock::MockHost;
    use crate::host::process::{ProcessHost, Segment};
    use crate::host::Status;
    use crate::patch::PatchDescriptor;
    use crate::plugin::{Coverage, Plugin, PluginSlot, Stage, StartStatus, StopStatus};

    /// Host that has the supported build loaded
    fn black_label_host() -> MockHost {
        MockHost::with_module("BootVita", BLACK_LABEL.fingerprint)
    }

    /// Every handle of every table
    fn all_handles<H: crate::host::Host>(plugin: &Plugin<H>) -> Vec<crate::host::InjectId> {
        plugin
            .tables()
            .flat_map(|t| t.handles().iter().flatten().copied())
            .collect()
    }

    #[test]
    /// Every table applies and stop releases each entry exactly once
    fn test_full_lifecycle() {
        let host = black_label_host();
        let mut plugin = Plugin::new(&host, BLACK_LABEL, &Config::default());
        assert_eq!(plugin.stage(), Stage::Unresolved);

        assert_eq!(plugin.start(), StartStatus::Success);
        assert_eq!(plugin.stage(), Stage::Patched(Coverage::Full));
        assert_eq!(plugin.module().unwrap().name, "BootVita");
        assert!(plugin.tables().all(|t| t.is_fully_applied()));
        assert_eq!(host.inject_count(), 19 + 1 + 12);

        let handles = all_handles(&plugin);
        assert_eq!(handles.len(), 19 + 1 + 12);

        assert_eq!(plugin.stop(), StopStatus::Success);
        assert_eq!(plugin.stage(), Stage::Stopped);
        assert!(plugin.tables().all(|t| t.applied() == 0));
        assert_eq!(host.releases.borrow().len(), handles.len());
        for id in handles {
            assert_eq!(host.release_count(id), 1);
        }

        // a second stop has nothing left to release
        plugin.stop();
        assert_eq!(host.releases.borrow().len(), 19 + 1 + 12);
    }

    #[test]
    /// A missing module aborts before any injection
    fn test_module_not_found() {
        let host = MockHost::default();
        let mut plugin = Plugin::new(&host, BLACK_LABEL, &Config::default());

        assert!(matches!(
            plugin.try_start(),
            Err(Error::ModuleNotFound {
                name: "BootVita",
                status: Status::NOT_FOUND
            })
        ));
        assert_eq!(plugin.stage(), Stage::Failed);
        assert_eq!(host.inject_count(), 0);
        assert!(plugin.module().is_none());
    }

    #[test]
    /// Only the exact supported fingerprint is accepted
    fn test_version_mismatch() {
        for fingerprint in [0, 0x7A1D621D, 0x7A1D621B, u32::MAX, !BLACK_LABEL.fingerprint] {
            let host = MockHost::with_module("BootVita", fingerprint);
            let mut plugin = Plugin::new(&host, BLACK_LABEL, &Config::default());
            assert_eq!(plugin.start(), StartStatus::NoResident);
            assert_eq!(plugin.stage(), Stage::Failed);
            assert_eq!(host.inject_count(), 0);
        }

        let host = black_label_host();
        let mut plugin = Plugin::new(&host, BLACK_LABEL, &Config::default());
        assert_eq!(plugin.start(), StartStatus::Success);
    }

    #[test]
    /// A mandatory failure aborts startup, leaves earlier tables applied and never reaches later ones
    fn test_mandatory_failure() {
        let host = black_label_host().fail_at(0xA53EC4, Status::PATCH_EXISTS);
        let mut plugin = Plugin::new(&host, BLACK_LABEL, &Config::default());

        assert_eq!(plugin.start(), StartStatus::NoResident);
        assert_eq!(plugin.stage(), Stage::Failed);

        let chargeboots = plugin.table("chargeboots_fix").unwrap();
        assert!(chargeboots.is_fully_applied());
        assert_eq!(plugin.table("ship_shack_fix").unwrap().applied(), 0);
        assert_eq!(plugin.table("no_nagscreens").unwrap().applied(), 0);

        // nothing was released, and the cosmetic table was never attempted
        assert!(host.releases.borrow().is_empty());
        assert_eq!(host.inject_count(), 19 + 1);

        // stop still cleans up what start left behind
        plugin.stop();
        assert_eq!(host.releases.borrow().len(), 19);
    }

    #[test]
    /// An optional failure is tolerated and leaves the table partially applied
    fn test_optional_failure() {
        let host = black_label_host().fail_at(NO_NAGSCREENS.offsets[5], Status::INVALID_ARGS);
        let mut plugin = Plugin::new(&host, BLACK_LABEL, &Config::default());

        assert_eq!(plugin.start(), StartStatus::Success);
        assert_eq!(plugin.stage(), Stage::Patched(Coverage::Partial));

        let table = plugin.table("no_nagscreens").unwrap();
        assert!(table.handles()[..5].iter().all(Option::is_some));
        assert!(table.handles()[5..].iter().all(Option::is_none));
        assert!(plugin.table("chargeboots_fix").unwrap().is_fully_applied());
        assert!(plugin.table("ship_shack_fix").unwrap().is_fully_applied());

        plugin.stop();
        assert_eq!(host.releases.borrow().len(), 19 + 1 + 5);
    }

    #[test]
    /// Disabled fixes get no table and are never injected
    fn test_disabled_fix() {
        let host = black_label_host();
        let config = Config {
            disabled: vec!["no_nagscreens".to_owned()],
        };
        let mut plugin = Plugin::new(&host, BLACK_LABEL, &config);

        assert_eq!(plugin.start(), StartStatus::Success);
        assert!(plugin.table("no_nagscreens").is_none());
        assert_eq!(host.inject_count(), 19 + 1);
    }

    #[test]
    /// Starting twice does not inject twice
    fn test_start_twice() {
        let host = black_label_host();
        let mut plugin = Plugin::new(&host, BLACK_LABEL, &Config::default());
        assert_eq!(plugin.start(), StartStatus::Success);
        assert!(matches!(plugin.try_start(), Err(Error::AlreadyStarted)));
        assert_eq!(host.inject_count(), 19 + 1 + 12);
        assert_eq!(plugin.stage(), Stage::Patched(Coverage::Full));
    }

    #[test]
    /// Stop before start is a no-op on the host
    fn test_stop_without_start() {
        let host = black_label_host();
        let mut plugin = Plugin::new(&host, BLACK_LABEL, &Config::default());
        assert_eq!(plugin.stop(), StopStatus::Success);
        assert!(host.releases.borrow().is_empty());
        assert_eq!(StartStatus::NoResident.code(), 1);
        assert_eq!(StopStatus::Success.code(), 0);
    }

    /// Small image used with a real in-process host
    const TINY_TARGET: Target = Target {
        module_name: "BootVita",
        fingerprint: 0x7A1D621C,
        segment: 0,
        fixes: &[
            Fix {
                name: "first",
                summary: "first",
                descriptor: PatchDescriptor::new(&[0xAF, 0xF3, 0x00, 0x80]),
                offsets: &[0x0, 0x8],
                required: true,
            },
            Fix {
                name: "second",
                summary: "second",
                descriptor: PatchDescriptor::new(&[0x40, 0xF2, 0x05, 0x0E]),
                offsets: &[0x4, 0xC],
                required: false,
            },
        ],
    };

    #[test]
    /// Start writes into the module image and stop restores it byte for byte
    fn test_process_host_roundtrip() {
        let mut image: Vec<u8> = (0u8..16).collect();
        let original = image.clone();
        let (ptr, size) = (image.as_mut_ptr(), image.len());

        let host = ProcessHost::new();
        unsafe {
            host.register("BootVita", 0x7A1D621C, vec![Segment::from_raw(ptr, size)])
                .unwrap();
        }

        let mut plugin = Plugin::new(&host, TINY_TARGET, &Config::default());
        assert_eq!(plugin.start(), StartStatus::Success);
        assert_eq!(
            unsafe { std::slice::from_raw_parts(ptr, size) },
            [
                0xAF, 0xF3, 0x00, 0x80, 0x40, 0xF2, 0x05, 0x0E, 0xAF, 0xF3, 0x00, 0x80, 0x40,
                0xF2, 0x05, 0x0E
            ]
        );
        assert_eq!(host.live_injections(), 4);

        plugin.stop();
        assert_eq!(unsafe { std::slice::from_raw_parts(ptr, size) }, original);
        assert_eq!(host.live_injections(), 0);

        drop(image);
    }

    #[test]
    /// Entries that do not fit the real segment fail like any other refused injection
    fn test_process_host_out_of_range() {
        let mut image = vec![0u8; 0x20];
        let (ptr, size) = (image.as_mut_ptr(), image.len());

        let host = ProcessHost::new();
        unsafe {
            host.register("BootVita", BLACK_LABEL.fingerprint, vec![Segment::from_raw(ptr, size)])
                .unwrap();
        }

        // the first charge boots offset is far outside a 32 byte segment
        let mut plugin = Plugin::new(&host, BLACK_LABEL, &Config::default());
        match plugin.try_start() {
            Err(Error::Inject {
                table,
                index,
                offset,
                status,
            }) => {
                assert_eq!(table, CHARGEBOOTS_FIX.name);
                assert_eq!(index, 0);
                assert_eq!(offset, CHARGEBOOTS_FIX.offsets[0]);
                assert_eq!(status, Status::INVALID_ARGS);
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(host.live_injections(), 0);

        drop(image);
    }

    #[test]
    /// Mandatory fixes are applied even when the configuration lists them as disabled
    fn test_mandatory_fix_cannot_be_disabled() {
        let host = black_label_host();
        let config =
            Config::from_json(r#"{"disabled": ["chargeboots_fix", "ship_shack_fix"]}"#).unwrap();
        let mut plugin = Plugin::new(&host, BLACK_LABEL, &config);

        assert_eq!(plugin.start(), StartStatus::Success);
        assert!(plugin.table("chargeboots_fix").unwrap().is_fully_applied());
        assert!(plugin.table("ship_shack_fix").unwrap().is_fully_applied());
        assert_eq!(host.inject_count(), 19 + 1 + 12);

        // and a mandatory failure still aborts startup
        let host = black_label_host().fail_at(0xA53EC4, Status::NOT_ALLOWED);
        let mut plugin = Plugin::new(&host, BLACK_LABEL, &config);
        assert_eq!(plugin.start(), StartStatus::NoResident);
        assert_eq!(plugin.stage(), Stage::Failed);
    }

    #[test]
    /// A started plugin survives a poisoned slot and can still be stopped
    fn test_slot_recovers_from_poison() {
        let host = black_label_host();
        let slot = PluginSlot::new();

        // poison the lock
        let poisoned = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = slot.plugin.lock();
            panic!("poison");
        }));
        assert!(poisoned.is_err());
        assert!(slot.plugin.is_poisoned());

        let mut plugin = Plugin::new(&host, BLACK_LABEL, &Config::default());
        assert_eq!(plugin.start(), StartStatus::Success);
        slot.store(plugin);

        let mut plugin = slot.take().unwrap();
        plugin.stop();
        assert_eq!(host.releases.borrow().len(), 19 + 1 + 12);
        assert!(slot.take().is_none());
    }
}
