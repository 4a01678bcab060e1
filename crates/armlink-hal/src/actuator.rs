//! The [`ArmController`] trait: the capability surface of one industrial
//! manipulator controller session.
//!
//! Drivers implement this trait; the rest of the gateway only ever talks to
//! it through an [`ArmHandle`][crate::handle::ArmHandle], so a vendor SDK
//! binding and the [`SimArm`][crate::sim::SimArm] are interchangeable.
//!
//! Every method is synchronous: controller SDKs block on the network round
//! trip, and the handle runs each call on a blocking worker thread.

use armlink_types::{ArmError, ArmState, Pose};

/// Interpolation used when testing a candidate pose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MotionType {
    Joint,
    Linear,
}

/// Frame in which the W/P/R orientation of a candidate pose is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrientType {
    World,
    Tool,
}

/// Motion/orientation mode passed to [`ArmController::is_reachable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MotionMode {
    pub motion: MotionType,
    pub orientation: OrientType,
}

impl MotionMode {
    /// Joint interpolation with world-frame orientation, the mode used for
    /// client-supplied pose updates.
    pub const JOINT_WORLD: Self = Self {
        motion: MotionType::Joint,
        orientation: OrientType::World,
    };
}

/// One controller session.
///
/// Pose targets are written into a numbered position register; the
/// controller program running on the robot tracks that register.
pub trait ArmController: Send {
    /// Open the session to the controller at `host`.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::ActuatorUnavailable`] if the controller cannot be
    /// reached.
    fn connect(&mut self, host: &str) -> Result<(), ArmError>;

    /// Refresh and return the current joint angles and world pose.
    fn current_state(&mut self) -> Result<ArmState, ArmError>;

    /// Test whether `pose` can be reached under `mode` if written into
    /// position register `register`.
    fn is_reachable(&mut self, register: u16, pose: &Pose, mode: MotionMode)
    -> Result<bool, ArmError>;

    /// Write `pose` into position register `register` and commit it.
    fn apply_pose(&mut self, register: u16, pose: &Pose) -> Result<(), ArmError>;

    /// Abort every running task on the controller.
    fn abort_all(&mut self) -> Result<(), ArmError>;

    /// Clear active alarms.
    fn reset_alarms(&mut self) -> Result<(), ArmError>;

    /// Make `name` the selected teach-pendant program.
    fn select_program(&mut self, name: &str) -> Result<(), ArmError>;

    /// Run the currently selected program.
    fn run_selected(&mut self) -> Result<(), ArmError>;

    /// Read digital output `index` (1-based on most controllers).
    fn read_digital_output(&mut self, index: u32) -> Result<bool, ArmError>;
}
