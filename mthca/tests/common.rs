//! Common test utilities: an in-memory firmware model and a recording
//! child factory for driving the lifecycle controller without hardware.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use mthca::cmd::MAD_NODE_GUID_OFFSET;
use mthca::{
    AdapterInfo, ChildContext, ChildFactory, ChildKind, ChildManager, ChildUsage, CmdError,
    CmdResult, CommandChannel, DdrInfo, DdrSlice, DeviceCapFlags, DeviceGrants, DeviceLimits,
    Error, FwInfo, HcaBus, HcaConfig, HcaHandle, ResourceProfile, Result,
};

/// Node GUID the firmware model reports.
pub const NODE_GUID: u64 = 0x0002_c900_1357_9bdf;

/// Limits of the modeled device.
pub fn test_limits() -> DeviceLimits {
    DeviceLimits {
        max_qps: 1 << 16,
        reserved_qps: 32,
        max_srqs: 1 << 10,
        reserved_srqs: 8,
        max_cqs: 1 << 13,
        reserved_cqs: 16,
        max_eqs: 64,
        reserved_eqs: 4,
        max_mpts: 1 << 17,
        reserved_mpts: 16,
        max_mtt_segs: 1 << 20,
        reserved_mtt_segs: 32,
        max_pds: 1 << 16,
        reserved_pds: 4,
        max_mcgs: 1 << 13,
        max_uars: 1 << 10,
        reserved_uars: 2,
        num_ports: 2,
        db_page_shift: 12,
        qpc_entry_size: 256,
        srqc_entry_size: 64,
        cqc_entry_size: 64,
        eqc_entry_size: 64,
        mpt_entry_size: 64,
        mtt_seg_size: 64,
        mcg_entry_size: 64,
        flags: DeviceCapFlags::RC_TRANSPORT
            | DeviceCapFlags::UD_TRANSPORT
            | DeviceCapFlags::SRQ
            | DeviceCapFlags::MULTICAST
            | DeviceCapFlags::PRIV_UDAV,
    }
}

struct FwState {
    limits: DeviceLimits,
    ddr: DdrInfo,
    fw: FwInfo,
    /// Command name that fails, and how.
    fail: Option<(&'static str, CmdError)>,
    commands: Vec<&'static str>,
    enabled: bool,
    inited: bool,
    released: bool,
    halts: u32,
    resets: u32,
    failed_outstanding: u32,
    syndrome: Option<u32>,
    mapped_db: Vec<u64>,
    next_db: u64,
}

/// In-memory firmware model implementing the command channel.
pub struct MockFirmware {
    state: Mutex<FwState>,
}

impl MockFirmware {
    /// A device with the default limits and 256 MB of DDR, 4 MB of which
    /// belong to firmware.
    pub fn new() -> Arc<Self> {
        Self::with_ddr(256 << 20)
    }

    /// Same device with a custom DDR size.
    pub fn with_ddr(ddr_size: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FwState {
                limits: test_limits(),
                ddr: DdrInfo {
                    base: 0,
                    size: ddr_size,
                },
                fw: FwInfo {
                    major: 3,
                    minor: 2,
                    subminor: 0,
                    fw_area: Some((0, 4 << 20)),
                    error_buf_mapped: false,
                },
                fail: None,
                commands: Vec::new(),
                enabled: false,
                inited: false,
                released: false,
                halts: 0,
                resets: 0,
                failed_outstanding: 0,
                syndrome: None,
                mapped_db: Vec::new(),
                next_db: 0xf000_0000,
            }),
        })
    }

    pub fn set_fw_version(&self, major: u16, minor: u16, subminor: u16) {
        let mut st = self.state.lock().unwrap();
        st.fw.major = major;
        st.fw.minor = minor;
        st.fw.subminor = subminor;
    }

    /// Make the named command fail until cleared.
    pub fn set_fail(&self, command: &'static str, err: CmdError) {
        self.state.lock().unwrap().fail = Some((command, err));
    }

    pub fn clear_fail(&self) {
        self.state.lock().unwrap().fail = None;
    }

    /// Map the error buffer and give it a syndrome.
    pub fn set_syndrome(&self, syndrome: u32) {
        let mut st = self.state.lock().unwrap();
        st.fw.error_buf_mapped = true;
        st.syndrome = Some(syndrome);
    }

    pub fn commands(&self) -> Vec<&'static str> {
        self.state.lock().unwrap().commands.clone()
    }

    /// How many times the named command was issued.
    pub fn count(&self, command: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|c| **c == command)
            .count()
    }

    pub fn halts(&self) -> u32 {
        self.state.lock().unwrap().halts
    }

    pub fn resets(&self) -> u32 {
        self.state.lock().unwrap().resets
    }

    pub fn failed_outstanding(&self) -> u32 {
        self.state.lock().unwrap().failed_outstanding
    }

    pub fn released(&self) -> bool {
        self.state.lock().unwrap().released
    }

    pub fn mapped_doorbells(&self) -> usize {
        self.state.lock().unwrap().mapped_db.len()
    }

    fn command(&self, name: &'static str) -> CmdResult<()> {
        let mut st = self.state.lock().unwrap();
        st.commands.push(name);
        match st.fail {
            Some((fail_name, err)) if fail_name == name => Err(err),
            _ => Ok(()),
        }
    }
}

impl CommandChannel for MockFirmware {
    fn init(&self) -> CmdResult<()> {
        self.command("init")
    }

    fn enable(&self) -> CmdResult<FwInfo> {
        self.command("enable")?;
        let mut st = self.state.lock().unwrap();
        st.enabled = true;
        Ok(st.fw)
    }

    fn query_limits(&self) -> CmdResult<DeviceLimits> {
        self.command("query_limits")?;
        Ok(self.state.lock().unwrap().limits.clone())
    }

    fn query_ddr(&self) -> CmdResult<DdrInfo> {
        self.command("query_ddr")?;
        Ok(self.state.lock().unwrap().ddr)
    }

    fn query_adapter(&self) -> CmdResult<AdapterInfo> {
        self.command("query_adapter")?;
        Ok(AdapterInfo {
            vendor_id: 0x15b3,
            device_id: 0x5a44,
            revision: 0xa1,
            board_id: "MT_TEST0".to_string(),
        })
    }

    fn init_device(&self, _profile: &ResourceProfile, _tables: &[DdrSlice]) -> CmdResult<()> {
        self.command("init_device")?;
        self.state.lock().unwrap().inited = true;
        Ok(())
    }

    fn query_device(&self) -> CmdResult<DeviceGrants> {
        self.command("query_device")?;
        let st = self.state.lock().unwrap();
        Ok(DeviceGrants {
            db_page_shift: st.limits.db_page_shift,
            active_eqs: 32,
        })
    }

    fn close_port(&self, _port: u8) -> CmdResult<()> {
        self.command("close_port")
    }

    fn close_device(&self) -> CmdResult<()> {
        self.command("close_device")?;
        self.state.lock().unwrap().inited = false;
        Ok(())
    }

    fn shutdown(&self) -> CmdResult<()> {
        self.command("shutdown")?;
        self.state.lock().unwrap().enabled = false;
        Ok(())
    }

    fn mad_ifc(&self, _port: u8, _request: &[u8], response: &mut [u8]) -> CmdResult<()> {
        self.command("mad_ifc")?;
        response[MAD_NODE_GUID_OFFSET..MAD_NODE_GUID_OFFSET + 8]
            .copy_from_slice(&NODE_GUID.to_be_bytes());
        Ok(())
    }

    fn fail_outstanding(&self) {
        self.state.lock().unwrap().failed_outstanding += 1;
    }

    fn halt(&self) {
        self.state.lock().unwrap().halts += 1;
    }

    fn reset(&self) {
        self.state.lock().unwrap().resets += 1;
    }

    fn catas_syndrome(&self) -> Option<u32> {
        let st = self.state.lock().unwrap();
        if st.fw.error_buf_mapped {
            st.syndrome
        } else {
            None
        }
    }

    fn map_doorbell_page(&self, shift: u8) -> CmdResult<u64> {
        self.command("map_doorbell_page")?;
        let mut st = self.state.lock().unwrap();
        let addr = st.next_db;
        st.next_db += 1 << shift;
        st.mapped_db.push(addr);
        Ok(addr)
    }

    fn unmap_doorbell_page(&self, addr: u64) {
        let mut st = self.state.lock().unwrap();
        st.mapped_db.retain(|&a| a != addr);
    }

    fn release(&self) {
        self.state.lock().unwrap().released = true;
    }
}

/// Child factory recording every create and destroy.
pub struct RecordingFactory {
    events: Arc<Mutex<Vec<(&'static str, &'static str)>>>,
    fail_kind: Mutex<Option<ChildKind>>,
    create_delay: Mutex<Option<Duration>>,
}

impl RecordingFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Arc::new(Mutex::new(Vec::new())),
            fail_kind: Mutex::new(None),
            create_delay: Mutex::new(None),
        })
    }

    /// Make creation of the given manager kind fail.
    pub fn fail_on(&self, kind: ChildKind) {
        *self.fail_kind.lock().unwrap() = Some(kind);
    }

    /// Sleep in every create call, to hold the device lock in tests.
    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = Some(delay);
    }

    /// All `(event, kind)` pairs in order.
    pub fn events(&self) -> Vec<(&'static str, &'static str)> {
        self.events.lock().unwrap().clone()
    }

    /// Kind names passed to create, in order.
    pub fn created(&self) -> Vec<&'static str> {
        self.events()
            .into_iter()
            .filter(|(ev, _)| *ev == "create")
            .map(|(_, kind)| kind)
            .collect()
    }

    /// Kind names destroyed, in order.
    pub fn destroyed(&self) -> Vec<&'static str> {
        self.events()
            .into_iter()
            .filter(|(ev, _)| *ev == "destroy")
            .map(|(_, kind)| kind)
            .collect()
    }

    fn record(&self, event: &'static str, kind: ChildKind) {
        self.events.lock().unwrap().push((event, kind.name()));
    }
}

impl ChildFactory for RecordingFactory {
    fn create(&self, kind: ChildKind, ctx: &ChildContext<'_>) -> Result<Box<dyn ChildManager>> {
        if let Some(delay) = *self.create_delay.lock().unwrap() {
            thread::sleep(delay);
        }
        if *self.fail_kind.lock().unwrap() == Some(kind) {
            return Err(Error::Failure("injected child creation failure"));
        }
        self.record("create", kind);
        let capacity = match kind {
            ChildKind::Uar => 1,
            ChildKind::Memory => ctx.profile.num_mpts,
            ChildKind::CompletionQueue => ctx.profile.num_cqs,
            ChildKind::QueuePair => ctx.profile.num_qps,
            ChildKind::SharedReceiveQueue => ctx.profile.num_srqs,
            ChildKind::Multicast => ctx.profile.num_mcgs,
            ChildKind::EventQueue => ctx.profile.num_eqs,
        };
        Ok(Box::new(RecordingChild {
            kind,
            capacity,
            events: Arc::clone(&self.events),
        }))
    }
}

struct RecordingChild {
    kind: ChildKind,
    capacity: u32,
    events: Arc<Mutex<Vec<(&'static str, &'static str)>>>,
}

impl ChildManager for RecordingChild {
    fn kind(&self) -> ChildKind {
        self.kind
    }

    fn query(&self) -> ChildUsage {
        ChildUsage {
            in_use: 0,
            capacity: self.capacity,
        }
    }

    fn destroy(&mut self, _ctx: &ChildContext<'_>) -> Result<()> {
        self.events.lock().unwrap().push(("destroy", self.kind.name()));
        Ok(())
    }
}

/// Probe one device on a fresh bus with the default configuration.
pub fn setup() -> (HcaBus, Arc<MockFirmware>, Arc<RecordingFactory>, HcaHandle) {
    let _ = env_logger::builder().is_test(true).try_init();
    let fw = MockFirmware::new();
    let factory = RecordingFactory::new();
    let bus = HcaBus::new();
    let handle = bus
        .probe(fw.clone(), factory.clone(), HcaConfig::default())
        .expect("probe device");
    (bus, fw, factory, handle)
}
