//! taiHEN binding and the entry points the loader calls
//!
//! Only built with the `taihen` feature, when linking against the loader's stubs.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::io;
use std::mem;

use lazy_static::lazy_static;

use super::{Host, InjectId, ModuleId, ModuleInfo, Status};
use crate::catalog::{BLACK_LABEL, CREDITS};
use crate::config::Config;
use crate::plugin::{Plugin, PluginSlot, StopStatus};

/// `SceUID`
type SceUid = c_int;

/// `tai_module_info_t`
#[repr(C)]
#[allow(clippy::missing_docs_in_private_items)]
struct TaiModuleInfo {
    size: usize,
    modid: SceUid,
    module_nid: u32,
    name: [c_char; 27],
    exports_start: usize,
    exports_end: usize,
    imports_start: usize,
    imports_end: usize,
}

#[allow(clippy::missing_docs_in_private_items)]
extern "C" {
    fn taiGetModuleInfo(module: *const c_char, info: *mut TaiModuleInfo) -> c_int;
    fn taiInjectData(
        modid: SceUid,
        segidx: c_int,
        offset: u32,
        data: *const c_void,
        size: usize,
    ) -> SceUid;
    fn taiInjectRelease(tai_uid: SceUid) -> c_int;
    fn sceClibPrintf(fmt: *const c_char, ...) -> c_int;
}

/// [`Host`] backed by the taiHEN user API
#[derive(Debug, Default, Clone, Copy)]
pub struct TaiHost;

impl Host for TaiHost {
    fn module_info(&self, name: &str) -> Result<ModuleInfo, Status> {
        let c_name = CString::new(name).map_err(|_| Status::INVALID_ARGS)?;
        // Safety: all-zero is a valid `tai_module_info_t`
        let mut info: TaiModuleInfo = unsafe { mem::zeroed() };
        info.size = mem::size_of::<TaiModuleInfo>();

        let res = unsafe { taiGetModuleInfo(c_name.as_ptr(), &mut info) };
        if res < 0 {
            return Err(Status(res));
        }

        // the loader may fill all 27 bytes without a terminator
        let bytes: Vec<u8> = info
            .name
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        Ok(ModuleInfo {
            id: ModuleId(info.modid),
            fingerprint: info.module_nid,
            name: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }

    fn inject_data(
        &self,
        module: ModuleId,
        segment: u32,
        offset: u32,
        data: &[u8],
    ) -> Result<InjectId, Status> {
        let segment = c_int::try_from(segment).map_err(|_| Status::INVALID_ARGS)?;
        let res =
            unsafe { taiInjectData(module.0, segment, offset, data.as_ptr() as _, data.len()) };
        if res < 0 {
            return Err(Status(res));
        }
        // zero is not a handle the loader can release; see `InjectId::is_valid`
        Ok(InjectId(res))
    }

    fn inject_release(&self, id: InjectId) -> Result<(), Status> {
        let res = unsafe { taiInjectRelease(id.0) };
        if res < 0 {
            return Err(Status(res));
        }
        Ok(())
    }
}

/// Writer that forwards formatted log lines to `sceClibPrintf`
struct ClibWriter;

impl io::Write for ClibWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let line: Vec<u8> = buf.iter().copied().filter(|&b| b != 0).collect();
        let line = CString::new(line).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let fmt = CStr::from_bytes_with_nul(b"%s\0")
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        unsafe {
            sceClibPrintf(fmt.as_ptr(), line.as_ptr());
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Routes `tracing` output to the debug console. Does nothing if a subscriber is already set.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_writer(|| ClibWriter)
        .with_ansi(false)
        .without_time()
        .with_target(false)
        .try_init();
}

lazy_static! {
    /// The running plugin, between `module_start` and `module_stop`
    static ref PLUGIN: PluginSlot<TaiHost> = PluginSlot::new();
}

/// Called by the loader when the plugin is loaded
#[no_mangle]
pub extern "C" fn module_start(_argc: usize, _args: *const c_void) -> c_int {
    init_logging();
    for line in CREDITS {
        tracing::info!("{}", line);
    }
    tracing::info!("labelpatch {}", env!("CARGO_PKG_VERSION"));

    let mut plugin = Plugin::new(TaiHost, BLACK_LABEL, &Config::default());
    let status = plugin.start();

    // kept even on failure, so that stop can release what start left applied
    PLUGIN.store(plugin);
    status.code()
}

/// Called by the loader before the plugin is unloaded
#[no_mangle]
pub extern "C" fn module_stop(_argc: usize, _args: *const c_void) -> c_int {
    if let Some(mut plugin) = PLUGIN.take() {
        plugin.stop();
    }
    StopStatus::Success.code()
}
