//! Device registry.
//!
//! The bus layer owns the table of live devices, indexed by public
//! handle. Probing a device runs the full create sequence and registers
//! the result; a create failure leaves nothing registered. Restart is the
//! recovery path out of the fatal-halted state: the old device is
//! destroyed and a fresh one is created with the same collaborators,
//! keeping the handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use log::info;

use crate::children::ChildFactory;
use crate::cmd::CommandChannel;
use crate::device::{Hca, HcaConfig};
use crate::error::{Error, Result};
use crate::fatal::FatalState;

/// Public handle naming a registered device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HcaHandle(u32);

/// Registry of live devices.
#[derive(Default)]
pub struct HcaBus {
    devices: Mutex<HashMap<u32, Arc<Hca>>>,
    next_id: AtomicU32,
}

impl HcaBus {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a device and register it.
    ///
    /// # Errors
    /// Everything [`Hca::create`] can return; on error nothing is
    /// registered.
    pub fn probe(
        &self,
        cmd: Arc<dyn CommandChannel>,
        factory: Arc<dyn ChildFactory>,
        cfg: HcaConfig,
    ) -> Result<HcaHandle> {
        let hca = Hca::create(cmd, factory, cfg)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.devices.lock().unwrap().insert(id, hca);
        info!("registered device {}", id);
        Ok(HcaHandle(id))
    }

    /// Look up a registered device.
    ///
    /// # Errors
    /// `InvalidHandle` when the handle names no live device.
    pub fn get(&self, handle: HcaHandle) -> Result<Arc<Hca>> {
        self.devices
            .lock()
            .unwrap()
            .get(&handle.0)
            .cloned()
            .ok_or(Error::InvalidHandle)
    }

    /// Destroy a device and unregister it.
    ///
    /// The device stays registered if destroy fails, so the caller can
    /// retry.
    ///
    /// # Errors
    /// `InvalidHandle` for an unknown handle, plus everything
    /// [`Hca::destroy`] can return.
    pub fn remove(&self, handle: HcaHandle) -> Result<()> {
        let hca = self.get(handle)?;
        hca.destroy()?;
        self.devices.lock().unwrap().remove(&handle.0);
        info!("unregistered device {}", handle.0);
        Ok(())
    }

    /// Destroy and re-create a fatal-halted device, keeping its handle.
    ///
    /// # Errors
    /// `InvalidArgument` unless the device is fatal-halted;
    /// `InvalidHandle` for an unknown handle; create errors leave the
    /// handle unregistered.
    pub fn restart(&self, handle: HcaHandle) -> Result<()> {
        let hca = self.get(handle)?;
        if hca.fatal_state() != FatalState::Halted {
            return Err(Error::InvalidArgument("device not fatal-halted"));
        }
        let (cmd, factory, cfg) = hca.collaborators();
        hca.destroy()?;
        self.devices.lock().unwrap().remove(&handle.0);
        let fresh = Hca::create(cmd, factory, cfg)?;
        self.devices.lock().unwrap().insert(handle.0, fresh);
        info!("restarted device {}", handle.0);
        Ok(())
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.devices.lock().unwrap().len()
    }

    /// Whether no device is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
