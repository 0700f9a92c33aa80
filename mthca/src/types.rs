//! Device discovery types: limits, adapter properties, capability flags.
//!
//! Everything here is produced by the discovery commands issued during
//! device creation and stays immutable for the lifetime of the device.

use bitflags::bitflags;

bitflags! {
    /// HCA capability flags reported by the device-limits query.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceCapFlags: u32 {
        /// Device supports Reliable Connection (RC) transport.
        const RC_TRANSPORT = 1 << 0;
        /// Device supports Unreliable Datagram (UD) transport.
        const UD_TRANSPORT = 1 << 1;
        /// Device supports Shared Receive Queues.
        const SRQ = 1 << 2;
        /// Device supports multicast groups.
        const MULTICAST = 1 << 3;
        /// Device supports atomic operations.
        const ATOMIC = 1 << 4;
        /// Device supports automatic path migration.
        const AUTO_PATH_MIG = 1 << 5;
        /// Device supports memory windows.
        const MEM_WINDOW = 1 << 6;
        /// Address vectors may live in the privileged on-device table.
        const PRIV_UDAV = 1 << 7;
    }
}

/// Per-resource upper bounds and firmware reservations.
///
/// Queried once at device creation. `reserved_*` counts are claimed by
/// firmware out of each table and are not available to the host; the
/// profile calculator adds them back before sizing tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Maximum number of queue pairs.
    pub max_qps: u32,
    /// QPs reserved by firmware.
    pub reserved_qps: u32,
    /// Maximum number of shared receive queues.
    pub max_srqs: u32,
    /// SRQs reserved by firmware.
    pub reserved_srqs: u32,
    /// Maximum number of completion queues.
    pub max_cqs: u32,
    /// CQs reserved by firmware.
    pub reserved_cqs: u32,
    /// Maximum number of event queues.
    pub max_eqs: u32,
    /// EQs reserved by firmware.
    pub reserved_eqs: u32,
    /// Maximum memory protection table entries (regions plus windows).
    pub max_mpts: u32,
    /// MPT entries reserved by firmware.
    pub reserved_mpts: u32,
    /// Maximum memory translation table segments.
    pub max_mtt_segs: u32,
    /// MTT segments reserved by firmware.
    pub reserved_mtt_segs: u32,
    /// Maximum number of protection domains.
    pub max_pds: u32,
    /// PDs reserved by firmware.
    pub reserved_pds: u32,
    /// Maximum number of multicast groups. Zero when multicast is absent.
    pub max_mcgs: u32,
    /// Maximum doorbell (user access region) pages.
    pub max_uars: u32,
    /// UAR pages reserved by firmware.
    pub reserved_uars: u32,
    /// Number of physical ports.
    pub num_ports: u8,
    /// Doorbell page shift (page size is `1 << db_page_shift`).
    pub db_page_shift: u8,
    /// QP context entry size in bytes.
    pub qpc_entry_size: u16,
    /// SRQ context entry size in bytes.
    pub srqc_entry_size: u16,
    /// CQ context entry size in bytes.
    pub cqc_entry_size: u16,
    /// EQ context entry size in bytes.
    pub eqc_entry_size: u16,
    /// Memory protection table entry size in bytes.
    pub mpt_entry_size: u16,
    /// Memory translation table segment size in bytes.
    pub mtt_seg_size: u16,
    /// Multicast group entry size in bytes.
    pub mcg_entry_size: u16,
    /// Capability flags.
    pub flags: DeviceCapFlags,
}

impl DeviceLimits {
    /// Whether the device supports multicast at all.
    pub fn has_multicast(&self) -> bool {
        self.flags.contains(DeviceCapFlags::MULTICAST) && self.max_mcgs > 0
    }

    /// Whether the device supports shared receive queues.
    pub fn has_srq(&self) -> bool {
        self.flags.contains(DeviceCapFlags::SRQ) && self.max_srqs > 0
    }
}

/// Extent of the adapter's on-board (DDR) memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DdrInfo {
    /// Bus address of the first byte of DDR.
    pub base: u64,
    /// Size of the DDR region in bytes. Zero when the memory is hidden
    /// from the host and must be assumed.
    pub size: u64,
}

/// Adapter identification, queried once at device creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    /// PCI vendor id.
    pub vendor_id: u32,
    /// PCI device id.
    pub device_id: u32,
    /// Hardware revision.
    pub revision: u32,
    /// Board identification string from the VSD.
    pub board_id: String,
}

/// Firmware properties reported when the device is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FwInfo {
    /// Firmware major version.
    pub major: u16,
    /// Firmware minor version.
    pub minor: u16,
    /// Firmware subminor version.
    pub subminor: u16,
    /// Firmware's own DDR footprint as `(base, len)`, reserved out of the
    /// capacity allocator before any host allocation.
    pub fw_area: Option<(u64, u64)>,
    /// Whether the firmware catastrophic-error buffer is mapped and can be
    /// read for a syndrome.
    pub error_buf_mapped: bool,
}

impl FwInfo {
    /// Whether the firmware version is at least `(major, minor, subminor)`.
    pub fn at_least(&self, min: (u16, u16, u16)) -> bool {
        (self.major, self.minor, self.subminor) >= min
    }
}

/// Properties granted by firmware after device initialization.
///
/// The initialization command may grant less than requested; the granted
/// values override what the profile asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGrants {
    /// Granted doorbell page shift.
    pub db_page_shift: u8,
    /// Number of event queues the firmware activated.
    pub active_eqs: u32,
}

/// Capability snapshot derived from device limits and the granted profile.
///
/// Counts are usable (reservations already subtracted). The node GUID is
/// obtained from a live management-datagram query, not cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    /// Node GUID from the live node-information query.
    pub node_guid: u64,
    /// Firmware version triple.
    pub fw_version: (u16, u16, u16),
    /// Number of physical ports.
    pub num_ports: u8,
    /// Usable queue pairs.
    pub max_qps: u32,
    /// Usable completion queues.
    pub max_cqs: u32,
    /// Usable shared receive queues.
    pub max_srqs: u32,
    /// Usable multicast groups. Zero when multicast is absent.
    pub max_mcgs: u32,
    /// Usable protection domains.
    pub max_pds: u32,
    /// Capability flags.
    pub flags: DeviceCapFlags,
}

/// Asynchronous device event delivered through the registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncEvent {
    /// Unrecoverable hardware fault. The device has been (or is being)
    /// halted; only destroy and restart remain valid.
    CatastrophicError {
        /// Hardware syndrome from the firmware error buffer, or the
        /// generic syndrome when the buffer is not mapped.
        syndrome: u32,
    },
    /// A port changed logical state.
    PortStateChange {
        /// Port number, 1-based.
        port: u8,
        /// Whether the port is now active.
        active: bool,
    },
}
