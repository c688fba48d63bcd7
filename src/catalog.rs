//! # Catalog
//!
//! The supported game build and the fixes applied to it.
//! All offsets are into segment 0 (text) of `BootVita`.

use crate::patch::thumb::{movw, nop_w, Register};
use crate::patch::PatchDescriptor;

/// `nop.w`
const T2_NOP_W: &[u8] = &nop_w();

/// `movw lr, #5`
const T2_MOVW_LR_5: &[u8] = &movw(Register::Lr, 5);

/// Printed when the plugin starts
pub const CREDITS: &[&str] = &["PSP2GCBL by CreepNT", "Original BLMod by isaak & robo"];

/// Compile-time description of one patch table
#[derive(Debug, Clone, Copy)]
pub struct Fix {
    /// Name used in logs, errors and [`crate::config::Config::disabled`]
    pub name: &'static str,
    /// What the fix does
    pub summary: &'static str,
    /// Bytes written at every offset
    pub descriptor: PatchDescriptor,
    /// Offsets into the target segment
    pub offsets: &'static [u32],
    /// Whether failing to apply this fix aborts startup
    pub required: bool,
}

/// A module build and the fixes to apply to it, in priority order
#[derive(Debug, Clone, Copy)]
pub struct Target {
    /// Name the loader knows the module by
    pub module_name: &'static str,
    /// Fingerprint of the only supported build
    pub fingerprint: u32,
    /// Segment every fix is applied to
    pub segment: u32,
    /// Fixes in application order
    pub fixes: &'static [Fix],
}
impl Target {
    /// Looks up a fix by name
    pub fn fix(&self, name: &str) -> Option<&'static Fix> {
        self.fixes.iter().find(|fix| fix.name == name)
    }
}

/// When a charge ends, patched game versions set a timer that inhibits player actions to 30.
/// Black Label never sets it; NOP the `strh` that writes it on every planet.
pub const CHARGEBOOTS_FIX: Fix = Fix {
    name: "chargeboots_fix",
    summary: "Charge ending no longer locks player actions",
    descriptor: PatchDescriptor::new(T2_NOP_W),
    offsets: &[
        0x0DC62C, // Aranos 1
        0x0F4138, // Oozla
        0x47CE80, // Maktar Nebula
        0x972A48, // Jamming Array (also used by Ship Shack)
        0x5DA0E6, // Endako
        0x6767BA, // Barlow
        0x78B93C, // Notak
        0x7E4370, // Siberius
        0x85D04E, // Tabora
        0x8953C8, // Dobbo
        0x1C86FA, // Joba
        0x245C18, // Todano
        0x28473C, // Boldan
        0x304760, // Aranos 2
        0x35DA7A, // Snivelak
        0x3BB3D8, // Smolg
        0x3F8084, // Damosel
        0x445942, // Grelbin
        0x4DA510, // Yeedil
    ],
    required: true,
};

/// Ship Shack prices come from a lookup table.
/// Replace `ldr lr, [r4, #0x144]` with `movw lr, #5` for the 5 Raritanium items trick.
pub const SHIP_SHACK_FIX: Fix = Fix {
    name: "ship_shack_fix",
    summary: "Ship Shack items cost 5 Raritanium",
    descriptor: PatchDescriptor::new(T2_MOVW_LR_5),
    offsets: &[0xA53EC4],
    required: true,
};

/// Skips the epilepsy warning and publisher splash screens
pub const NO_NAGSCREENS: Fix = Fix {
    name: "no_nagscreens",
    summary: "Startup notice screens are skipped",
    descriptor: PatchDescriptor::new(T2_NOP_W),
    offsets: &[
        0x0009A2, 0x000A44, 0x000AE6, 0x000B8A, 0x000C5A, 0x000D04, 0x000DAE, 0x000E58, 0x000F00,
        0x000FA6, 0x001064, 0x0010DC,
    ],
    required: false,
};

/// The retail `BootVita` build this crate patches
pub const BLACK_LABEL: Target = Target {
    module_name: "BootVita",
    fingerprint: 0x7A1D621C,
    segment: 0,
    fixes: &[CHARGEBOOTS_FIX, SHIP_SHACK_FIX, NO_NAGSCREENS],
};
