//! # vigil-supervisor
//!
//! The supervision layer of the Vigil framework. An [`app::App`] owns an
//! ordered set of [`proc::Process`] instances and aggregates their fault
//! classifications into application-level actions; the
//! [`registry::AppRegistry`] owns the applications and routes child-status
//! changes; the [`events::Dispatcher`] is the single-threaded control loop
//! that turns signals and timer deadlines into those calls.
//!
//! All collaborators are passed in through [`SupervisorCtx`], never reached
//! through globals, so tests can construct isolated instances with fakes.

pub mod app;
pub mod events;
pub mod fault_record;
pub mod launcher;
pub mod proc;
pub mod registry;
pub mod timer;

use vigil_common::config::ConfigStore;
use vigil_core::rlimits::AppLimiter;
use vigil_core::sandbox::Sandbox;
use vigil_core::users::UserRegistry;

use crate::fault_record::FaultRecord;
use crate::launcher::Launcher;

/// The collaborator set threaded through every lifecycle operation.
pub struct SupervisorCtx<'a> {
    /// Read-only configuration store.
    pub cfg: &'a dyn ConfigStore,
    /// Process launch and signalling seam.
    pub launcher: &'a mut dyn Launcher,
    /// Sandbox construction collaborator.
    pub sandbox: &'a mut dyn Sandbox,
    /// Application-wide resource limit collaborator.
    pub limiter: &'a mut dyn AppLimiter,
    /// User/group provisioning collaborator.
    pub users: &'a mut dyn UserRegistry,
    /// The persisted reboot-fault record.
    pub fault_record: &'a FaultRecord,
}
