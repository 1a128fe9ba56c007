//! Negotiated interface version.
//!
//! The firmware image carries an application version that the loader maps to
//! one of these interface revisions before the transport is constructed.
//! The revision selects the init-message geometry layout, the payload
//! allocation layout, and the engine-buffer descriptor shape; the record
//! header and unit id space are stable across all of them.

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    /// Oldest interface: no debug entry point, 32-bit frame-buffer bases.
    V0,
    /// Adds the OS debug entry point and frame-buffer sizes.
    V1,
    /// V1 layout with trailing reserved space and split 49-bit addresses.
    V2,
    /// Rearranged init geometry and 64-bit descriptor addresses.
    V3,
}

impl ProtocolVersion {
    /// Whether the init message advertises an OS debug entry point.
    pub fn has_os_debug_entry_point(self) -> bool {
        !matches!(self, ProtocolVersion::V0)
    }
}
