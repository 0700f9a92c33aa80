//! Device lifecycle controller.
//!
//! The controller owns all per-device state and drives the device through
//! create, open, close, destroy and fatal recovery. Lifecycle operations
//! serialize on one interruptible lock per device; forward progress during
//! create and open is tracked on an explicit undo stack so any failure
//! unwinds exactly the steps that completed, in reverse order. A fatal
//! condition raised mid-operation preempts the normal unwind: hardware is
//! left to the fatal supervisor and the eventual destroy, while the DDR
//! accounting on the undo stack is still settled per entry.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::children::{ChildContext, ChildFactory, ChildKind, ChildManager, ChildUsage};
use crate::cmd::{node_info_guid, node_info_request, CommandChannel, MAD_BLOCK_SIZE};
use crate::ddr::{DdrAllocator, DdrSlice};
use crate::error::{Error, Result};
use crate::fatal::{EventHandler, FatalShared, FatalState, FatalSupervisor};
use crate::lock::{CancelToken, DeviceLock};
use crate::profile::{ProfileHint, ResourceProfile, TABLE_ALIGN, UDAV_ENTRY_SIZE};
use crate::types::{
    AdapterInfo, AsyncEvent, Capabilities, DdrInfo, DeviceGrants, DeviceLimits, FwInfo,
};

/// Oldest firmware the controller will drive.
pub const MIN_FW_VERSION: (u16, u16, u16) = (3, 1, 0);

/// Lifecycle state of a device. The fatal sub-state is orthogonal, see
/// [`FatalState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Discovery in progress; the device is not registered yet.
    Creating,
    /// Created but not initialized; open is the only way forward.
    Closed,
    /// An open is in flight.
    Opening,
    /// Initialized with a granted profile; child managers are live.
    Running,
    /// A close is in flight.
    Closing,
    /// Torn down. Terminal.
    Destroying,
}

/// DDR size assumed when firmware hides the on-board memory extent.
pub const FALLBACK_DDR_SIZE: u64 = 128 << 20;

/// How long destroy waits for the supervisor to finish halting.
const DESTROY_HALT_WAIT: Duration = Duration::from_secs(5);

/// Controller configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HcaConfig {
    /// Minimum acceptable firmware version.
    pub min_fw_version: (u16, u16, u16),
    /// Leave the halt register write to an outer agent on fatal.
    pub defer_fatal_halt: bool,
}

impl Default for HcaConfig {
    fn default() -> Self {
        Self {
            min_fw_version: MIN_FW_VERSION,
            defer_fatal_halt: false,
        }
    }
}

impl HcaConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the minimum acceptable firmware version.
    pub fn with_min_fw_version(mut self, v: (u16, u16, u16)) -> Self {
        self.min_fw_version = v;
        self
    }

    /// Defer the halt register write to an outer agent on fatal.
    pub fn with_defer_fatal_halt(mut self, defer: bool) -> Self {
        self.defer_fatal_halt = defer;
        self
    }
}

/// One recorded forward step, undone in reverse order on teardown.
#[derive(Debug)]
enum Undo {
    /// Free one DDR allocation. Executed unconditionally: accounting must
    /// balance even when the hardware is no longer touched.
    FreeDdr(DdrSlice),
    /// Destroy the most recently created child manager.
    DestroyChild,
    /// Unmap the kernel doorbell page.
    UnmapDoorbell(u64),
    /// Issue the device teardown command.
    CloseDevice,
}

struct Inner {
    state: DeviceState,
    limits: DeviceLimits,
    fw: FwInfo,
    adapter: AdapterInfo,
    alloc: DdrAllocator,
    profile: Option<ResourceProfile>,
    grants: Option<DeviceGrants>,
    children: Vec<Box<dyn ChildManager>>,
    undo: Vec<Undo>,
}

/// One managed HCA device.
///
/// Created via [`Hca::create`] (normally through
/// [`HcaBus::probe`](crate::bus::HcaBus::probe), which also registers the
/// device). Lifecycle operations never run concurrently for one device;
/// callers blocked on the device lock can be cancelled through the
/// `*_cancellable` variants.
pub struct Hca {
    cmd: Arc<dyn CommandChannel>,
    factory: Arc<dyn ChildFactory>,
    cfg: HcaConfig,
    lock: DeviceLock,
    inner: Mutex<Inner>,
    fatal: Arc<FatalShared>,
    supervisor: Mutex<Option<FatalSupervisor>>,
    handler: EventHandler,
}

impl Hca {
    /// Bring the device up to the closed state.
    ///
    /// Enables the device, gates on the firmware version, discovers limits
    /// and the DDR extent, reserves firmware's own DDR footprint and
    /// starts the fatal supervisor. Any failure unwinds the completed
    /// steps in reverse; no partial device remains.
    ///
    /// # Errors
    /// `Failure` for a firmware version below the configured minimum or a
    /// failed discovery command; `Fatal` if the device died during
    /// discovery.
    pub fn create(
        cmd: Arc<dyn CommandChannel>,
        factory: Arc<dyn ChildFactory>,
        cfg: HcaConfig,
    ) -> Result<Arc<Self>> {
        cmd.init().map_err(Error::from)?;
        let fw = match cmd.enable() {
            Ok(fw) => fw,
            Err(e) => {
                cmd.release();
                return Err(e.into());
            }
        };
        // From here on every failure disables the device again.
        let bail = |e: Error| -> Error {
            if let Err(e) = cmd.shutdown() {
                warn!("shutdown during create unwind failed: {:?}", e);
            }
            cmd.release();
            e
        };

        if !fw.at_least(cfg.min_fw_version) {
            error!(
                "firmware {}.{}.{} below supported minimum {}.{}.{}",
                fw.major,
                fw.minor,
                fw.subminor,
                cfg.min_fw_version.0,
                cfg.min_fw_version.1,
                cfg.min_fw_version.2
            );
            return Err(bail(Error::Failure("firmware version below minimum")));
        }

        let limits = cmd.query_limits().map_err(|e| bail(e.into()))?;
        let mut ddr = cmd.query_ddr().map_err(|e| bail(e.into()))?;
        if ddr.size == 0 {
            warn!("DDR extent hidden by firmware, assuming {} bytes", FALLBACK_DDR_SIZE);
            ddr = DdrInfo {
                base: 0,
                size: FALLBACK_DDR_SIZE,
            };
        }
        let adapter = cmd.query_adapter().map_err(|e| bail(e.into()))?;

        let mut alloc = DdrAllocator::new(ddr.base, ddr.size);
        if let Some((base, len)) = fw.fw_area {
            alloc.reserve(base, len).map_err(bail)?;
        }

        let fatal = Arc::new(FatalShared::new());
        let handler: EventHandler = Arc::new(Mutex::new(None));
        let supervisor = FatalSupervisor::spawn(
            Arc::clone(&fatal),
            Arc::clone(&cmd),
            Arc::clone(&handler),
            cfg.defer_fatal_halt,
        )
        .map_err(|_| bail(Error::Failure("fatal supervisor spawn")))?;

        info!(
            "device up: fw {}.{}.{}, board {}, {} MB DDR",
            fw.major,
            fw.minor,
            fw.subminor,
            adapter.board_id,
            ddr.size >> 20
        );

        let mut inner = Inner {
            state: DeviceState::Creating,
            limits,
            fw,
            adapter,
            alloc,
            profile: None,
            grants: None,
            children: Vec::new(),
            undo: Vec::new(),
        };
        inner.state = DeviceState::Closed;
        Ok(Arc::new(Self {
            cmd,
            factory,
            cfg,
            lock: DeviceLock::new(),
            inner: Mutex::new(inner),
            fatal,
            supervisor: Mutex::new(Some(supervisor)),
            handler,
        }))
    }

    /// Open the device with an optional resource hint, returning the
    /// granted profile.
    ///
    /// # Errors
    /// `Busy` when the device is not closed, `Fatal` when a catastrophic
    /// condition is outstanding or raised mid-open, plus everything
    /// [`ResourceProfile::compute`] rejects.
    pub fn open(&self, hint: Option<&ProfileHint>) -> Result<ResourceProfile> {
        self.open_cancellable(hint, &CancelToken::new())
    }

    /// [`open`](Hca::open) with a cancellable lock wait.
    pub fn open_cancellable(
        &self,
        hint: Option<&ProfileHint>,
        cancel: &CancelToken,
    ) -> Result<ResourceProfile> {
        let _guard = self.lock.acquire(cancel)?;
        let mut inner = self.inner.lock().unwrap();
        if self.fatal.is_fatal() {
            return Err(Error::Fatal);
        }
        match inner.state {
            DeviceState::Closed => {}
            DeviceState::Destroying => return Err(Error::InvalidHandle),
            _ => return Err(Error::Busy),
        }
        inner.state = DeviceState::Opening;
        match self.open_locked(&mut inner, hint) {
            Ok(profile) => {
                inner.state = DeviceState::Running;
                info!(
                    "device open: {} qps, {} cqs, {} DDR bytes",
                    profile.num_qps, profile.num_cqs, profile.ddr_total
                );
                Ok(profile)
            }
            Err(e) => {
                inner.state = DeviceState::Closed;
                Err(e)
            }
        }
    }

    fn open_locked(&self, inner: &mut Inner, hint: Option<&ProfileHint>) -> Result<ResourceProfile> {
        let avail = inner.alloc.query().free;
        let profile = ResourceProfile::compute(&inner.limits, avail, hint)?;
        inner.profile = Some(profile.clone());
        match self.open_steps(inner, &profile) {
            Ok(grants) => {
                inner.grants = Some(grants);
                Ok(profile)
            }
            Err(e) if e == Error::Fatal || self.fatal.is_fatal() => {
                // Defer to the fatal supervisor: hardware is not touched
                // again here, the undo stack stays for destroy to settle.
                self.signal_fatal();
                warn!("open preempted by catastrophic error");
                Err(Error::Fatal)
            }
            Err(e) => {
                self.unwind(inner, true);
                inner.profile = None;
                Err(e)
            }
        }
    }

    fn open_steps(&self, inner: &mut Inner, profile: &ResourceProfile) -> Result<DeviceGrants> {
        self.fatal_check()?;
        let tables = inner.alloc.alloc_vector(&profile.ddr_requests)?;
        for t in &tables {
            inner.undo.push(Undo::FreeDdr(*t));
        }

        self.fatal_check()?;
        self.cmd.init_device(profile, &tables).map_err(Error::from)?;
        inner.undo.push(Undo::CloseDevice);

        self.fatal_check()?;
        let grants = self.cmd.query_device().map_err(Error::from)?;

        for kind in [
            ChildKind::Uar,
            ChildKind::Memory,
            ChildKind::CompletionQueue,
            ChildKind::QueuePair,
        ] {
            self.create_child(inner, profile, kind)?;
        }
        if profile.num_srqs > 0 {
            self.create_child(inner, profile, ChildKind::SharedReceiveQueue)?;
        }

        if profile.privileged_udav {
            self.fatal_check()?;
            let len = profile.num_udavs as u64 * UDAV_ENTRY_SIZE;
            let addr = inner.alloc.alloc(len, TABLE_ALIGN)?;
            inner.undo.push(Undo::FreeDdr(DdrSlice {
                name: "udav",
                addr,
                len,
            }));
        }

        self.fatal_check()?;
        let db = self
            .cmd
            .map_doorbell_page(grants.db_page_shift)
            .map_err(Error::from)?;
        inner.undo.push(Undo::UnmapDoorbell(db));

        if profile.num_mcgs > 0 {
            self.create_child(inner, profile, ChildKind::Multicast)?;
        }
        // The event queue manager comes last so every earlier manager can
        // be wired to its queues; it is the first to go on teardown.
        self.create_child(inner, profile, ChildKind::EventQueue)?;

        self.fatal_check()?;
        Ok(grants)
    }

    fn create_child(
        &self,
        inner: &mut Inner,
        profile: &ResourceProfile,
        kind: ChildKind,
    ) -> Result<()> {
        self.fatal_check()?;
        let child = {
            let ctx = ChildContext {
                cmd: &*self.cmd,
                profile,
                alloc: &inner.alloc,
            };
            self.factory.create(kind, &ctx)?
        };
        debug!("created {} manager", kind.name());
        inner.children.push(child);
        inner.undo.push(Undo::DestroyChild);
        Ok(())
    }

    fn fatal_check(&self) -> Result<()> {
        if self.fatal.is_fatal() {
            Err(Error::Fatal)
        } else {
            Ok(())
        }
    }

    /// Drain the undo stack in reverse order. With `touch_hw` false only
    /// host-side bookkeeping runs; DDR frees always run so every entry is
    /// freed exactly once.
    fn unwind(&self, inner: &mut Inner, touch_hw: bool) {
        let profile = inner.profile.clone();
        while let Some(undo) = inner.undo.pop() {
            match undo {
                Undo::DestroyChild => {
                    if let Some(mut child) = inner.children.pop() {
                        if touch_hw {
                            if let Some(profile) = &profile {
                                let ctx = ChildContext {
                                    cmd: &*self.cmd,
                                    profile,
                                    alloc: &inner.alloc,
                                };
                                if let Err(e) = child.destroy(&ctx) {
                                    warn!("{} manager teardown: {}", child.kind().name(), e);
                                }
                            }
                        }
                        debug!("destroyed {} manager", child.kind().name());
                    }
                }
                Undo::UnmapDoorbell(addr) => {
                    if touch_hw {
                        self.cmd.unmap_doorbell_page(addr);
                    }
                }
                Undo::CloseDevice => {
                    if touch_hw {
                        if let Err(e) = self.cmd.close_device() {
                            warn!("device teardown command: {:?}", e);
                        }
                    }
                }
                Undo::FreeDdr(slice) => {
                    if let Err(e) = inner.alloc.free(slice.addr, slice.len) {
                        error!("ddr accounting for {}: {}", slice.name, e);
                    }
                }
            }
        }
    }

    fn close_locked(&self, inner: &mut Inner) {
        let fatal = self.fatal.is_fatal();
        if fatal {
            // Further device communication is unsafe; substitute a halt
            // for the orderly shutdown. The write is idempotent.
            self.cmd.halt();
        } else {
            for port in 1..=inner.limits.num_ports {
                if let Err(e) = self.cmd.close_port(port) {
                    warn!("close port {}: {:?}", port, e);
                }
            }
        }
        self.unwind(inner, !fatal);
        inner.profile = None;
        inner.grants = None;
    }

    /// Close a running device back to the closed state.
    ///
    /// # Errors
    /// `Busy` when the device is not running; `InvalidHandle` after
    /// destroy. Never silently accepted.
    pub fn close(&self) -> Result<()> {
        self.close_cancellable(&CancelToken::new())
    }

    /// [`close`](Hca::close) with a cancellable lock wait.
    pub fn close_cancellable(&self, cancel: &CancelToken) -> Result<()> {
        let _guard = self.lock.acquire(cancel)?;
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            DeviceState::Running => {}
            DeviceState::Destroying => return Err(Error::InvalidHandle),
            _ => return Err(Error::Busy),
        }
        inner.state = DeviceState::Closing;
        self.close_locked(&mut inner);
        inner.state = DeviceState::Closed;
        info!("device closed");
        Ok(())
    }

    /// Tear the device down completely, closing it first if needed.
    ///
    /// With a fatal condition outstanding the device is hard-reset before
    /// any resource is released, so the abandoned device generates no
    /// further bus activity.
    ///
    /// # Errors
    /// `InvalidHandle` when already destroyed.
    pub fn destroy(&self) -> Result<()> {
        self.destroy_cancellable(&CancelToken::new())
    }

    /// [`destroy`](Hca::destroy) with a cancellable lock wait.
    pub fn destroy_cancellable(&self, cancel: &CancelToken) -> Result<()> {
        let _guard = self.lock.acquire(cancel)?;
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            DeviceState::Running => {
                inner.state = DeviceState::Closing;
                self.close_locked(&mut inner);
            }
            DeviceState::Closed => {}
            DeviceState::Destroying => return Err(Error::InvalidHandle),
            _ => return Err(Error::Busy),
        }
        inner.state = DeviceState::Destroying;

        let fatal = self.fatal.is_fatal();
        if fatal {
            if self.fatal.get() == FatalState::Start && !self.fatal.wait_halted(DESTROY_HALT_WAIT) {
                warn!("halt did not complete before destroy, resetting anyway");
            }
            self.cmd.reset();
        }

        // Settle accounting left behind by a fatal-deferred open.
        self.unwind(&mut inner, false);
        let leaked = inner.alloc.outstanding();
        if leaked != 0 {
            error!("{} DDR allocations outstanding at destroy", leaked);
        }
        inner.alloc = DdrAllocator::new(0, 0);
        inner.profile = None;
        inner.grants = None;

        if !fatal {
            if let Err(e) = self.cmd.shutdown() {
                warn!("device disable failed: {:?}", e);
            }
        }
        if let Some(sup) = self.supervisor.lock().unwrap().take() {
            sup.shutdown();
        }
        self.cmd.release();
        info!("device destroyed");
        Ok(())
    }

    /// Record a catastrophic condition and wake the fatal supervisor.
    ///
    /// Callable from interrupt-like contexts: only the fatal flag's own
    /// lock is taken, never the device lock.
    pub fn signal_fatal(&self) {
        if self.fatal.raise() {
            if let Some(sup) = self.supervisor.lock().unwrap().as_ref() {
                sup.notify_fatal();
            }
        }
    }

    /// Capability snapshot from limits and the granted profile, with a
    /// live node-identifier query.
    ///
    /// # Errors
    /// `Fatal` when a catastrophic condition is outstanding,
    /// `InvalidHandle` after destroy, `Failure` for a MAD failure.
    pub fn query_capabilities(&self) -> Result<Capabilities> {
        if self.fatal.is_fatal() {
            return Err(Error::Fatal);
        }
        let (limits, fw, profile) = {
            let inner = self.inner.lock().unwrap();
            if inner.state == DeviceState::Destroying {
                return Err(Error::InvalidHandle);
            }
            (inner.limits.clone(), inner.fw, inner.profile.clone())
        };

        let request = node_info_request();
        let mut response = [0u8; MAD_BLOCK_SIZE];
        self.cmd
            .mad_ifc(1, &request, &mut response)
            .map_err(Error::from)?;
        let node_guid =
            node_info_guid(&response).ok_or(Error::Failure("malformed node info response"))?;

        let caps = match &profile {
            Some(p) => Capabilities {
                node_guid,
                fw_version: (fw.major, fw.minor, fw.subminor),
                num_ports: limits.num_ports,
                max_qps: p.num_qps.saturating_sub(limits.reserved_qps),
                max_cqs: p.num_cqs.saturating_sub(limits.reserved_cqs),
                max_srqs: p.num_srqs.saturating_sub(limits.reserved_srqs),
                max_mcgs: p.num_mcgs,
                max_pds: limits.max_pds.saturating_sub(limits.reserved_pds),
                flags: limits.flags,
            },
            None => Capabilities {
                node_guid,
                fw_version: (fw.major, fw.minor, fw.subminor),
                num_ports: limits.num_ports,
                max_qps: limits.max_qps.saturating_sub(limits.reserved_qps),
                max_cqs: limits.max_cqs.saturating_sub(limits.reserved_cqs),
                max_srqs: limits.max_srqs.saturating_sub(limits.reserved_srqs),
                max_mcgs: limits.max_mcgs,
                max_pds: limits.max_pds.saturating_sub(limits.reserved_pds),
                flags: limits.flags,
            },
        };
        Ok(caps)
    }

    /// Occupancy of one child manager on an open device.
    ///
    /// # Errors
    /// `Busy` unless the device is running, `InvalidArgument` when the
    /// plan has no manager of that kind.
    pub fn child_usage(&self, kind: ChildKind) -> Result<ChildUsage> {
        let inner = self.inner.lock().unwrap();
        if inner.state != DeviceState::Running {
            return Err(Error::Busy);
        }
        inner
            .children
            .iter()
            .find(|c| c.kind() == kind)
            .map(|c| c.query())
            .ok_or(Error::InvalidArgument("no manager of this kind"))
    }

    /// Register the asynchronous event callback. The fatal supervisor
    /// delivers the catastrophic-error event through it.
    pub fn set_event_handler<F>(&self, f: F)
    where
        F: Fn(AsyncEvent) + Send + 'static,
    {
        *self.handler.lock().unwrap() = Some(Box::new(f));
    }

    /// Remove the asynchronous event callback.
    pub fn clear_event_handler(&self) {
        *self.handler.lock().unwrap() = None;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DeviceState {
        self.inner.lock().unwrap().state
    }

    /// Current fatal sub-state.
    pub fn fatal_state(&self) -> FatalState {
        self.fatal.get()
    }

    /// Block until the fatal supervisor finishes halting, or `timeout`
    /// expires. Returns `true` once halted.
    pub fn wait_fatal_halted(&self, timeout: Duration) -> bool {
        self.fatal.wait_halted(timeout)
    }

    /// Properties granted by firmware for the current open, if any.
    pub fn grants(&self) -> Option<DeviceGrants> {
        self.inner.lock().unwrap().grants
    }

    /// Number of outstanding DDR allocations. Zero after close or destroy.
    pub fn ddr_outstanding(&self) -> usize {
        self.inner.lock().unwrap().alloc.outstanding()
    }

    /// Device limits discovered at creation.
    pub fn limits(&self) -> DeviceLimits {
        self.inner.lock().unwrap().limits.clone()
    }

    /// Adapter identification discovered at creation.
    pub fn adapter(&self) -> AdapterInfo {
        self.inner.lock().unwrap().adapter.clone()
    }

    /// The collaborators this device was created with, for restart.
    pub(crate) fn collaborators(
        &self,
    ) -> (Arc<dyn CommandChannel>, Arc<dyn ChildFactory>, HcaConfig) {
        (Arc::clone(&self.cmd), Arc::clone(&self.factory), self.cfg)
    }
}
