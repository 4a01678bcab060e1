//! In-process simulated manipulator for headless runs and CI.
//!
//! [`SimArm`] implements [`ArmController`] without any hardware.  A pose is
//! reachable when its distance from the base origin lies inside a spherical
//! shell envelope; applying a pose moves the simulated tool instantly.
//!
//! `SimArm` is cheap to clone and every clone shares the same simulated
//! controller, so a test can keep one clone for inspection while the gateway
//! owns another.
//!
//! # Example
//!
//! ```rust
//! use armlink_hal::{ArmController, MotionMode, SimArm};
//! use armlink_types::Pose;
//!
//! let mut arm = SimArm::new();
//! arm.connect("127.0.0.1").unwrap();
//! let target = Pose::new(630.0, -70.0, 835.273, 0.0, 62.596, -180.0);
//! assert!(arm.is_reachable(3, &target, MotionMode::JOINT_WORLD).unwrap());
//! arm.apply_pose(3, &target).unwrap();
//! assert_eq!(arm.current_state().unwrap().pose, target);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use armlink_types::{ArmError, ArmState, JointAngles, Pose};

use crate::actuator::{ArmController, MotionMode};

/// Pose the simulated tool rests at before any command.
pub const REST_POSE: Pose = Pose::new(1133.0, 400.0, 1060.0, -10.0, 0.0, 90.0);

/// Observable state of the simulated controller.
#[derive(Debug, Clone, PartialEq)]
pub struct SimSnapshot {
    pub connected: bool,
    pub host: Option<String>,
    pub pose: Pose,
    pub registers: HashMap<u16, Pose>,
    pub selected_program: Option<String>,
    pub running: bool,
    pub alarms_cleared: u32,
    pub aborts: u32,
    pub applied: Vec<Pose>,
}

struct SimState {
    snapshot: SimSnapshot,
    outputs: HashMap<u32, bool>,
    min_reach: f64,
    max_reach: f64,
    fail_connect: bool,
    fail_sampling: bool,
}

/// Simulated controller.  Always succeeds unless a failure is injected.
#[derive(Clone)]
pub struct SimArm {
    state: Arc<Mutex<SimState>>,
}

impl SimArm {
    /// A simulated arm with a 200–2000 mm reach envelope.
    pub fn new() -> Self {
        Self::with_envelope(200.0, 2000.0)
    }

    /// A simulated arm reaching every position whose distance from the base
    /// lies in `[min_reach, max_reach]` millimetres.
    pub fn with_envelope(min_reach: f64, max_reach: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                snapshot: SimSnapshot {
                    connected: false,
                    host: None,
                    pose: REST_POSE,
                    registers: HashMap::new(),
                    selected_program: None,
                    running: false,
                    alarms_cleared: 0,
                    aborts: 0,
                    applied: Vec::new(),
                },
                outputs: HashMap::new(),
                min_reach,
                max_reach,
                fail_connect: false,
                fail_sampling: false,
            })),
        }
    }

    /// Make every subsequent [`connect`][ArmController::connect] fail.
    pub fn fail_connect(self, fail: bool) -> Self {
        self.lock().fail_connect = fail;
        self
    }

    /// Make every subsequent state read fail, as a dropped session would.
    pub fn set_sampling_failure(&self, fail: bool) {
        self.lock().fail_sampling = fail;
    }

    /// Drive digital output `index` to `value`.
    pub fn set_digital_output(&self, index: u32, value: bool) {
        self.lock().outputs.insert(index, value);
    }

    /// Copy of the current simulated controller state.
    pub fn snapshot(&self) -> SimSnapshot {
        self.lock().snapshot.clone()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A poisoned simulator only means a test panicked mid-call; the data
        // is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn connected(&self, operation: &str) -> Result<MutexGuard<'_, SimState>, ArmError> {
        let state = self.lock();
        if state.snapshot.connected {
            Ok(state)
        } else {
            Err(ArmError::ActuatorUnavailable(format!(
                "{operation}: simulated controller is not connected"
            )))
        }
    }
}

impl Default for SimArm {
    fn default() -> Self {
        Self::new()
    }
}

/// Display-only joint angles derived from a world pose.
fn joints_for(pose: &Pose) -> JointAngles {
    let planar = pose.x.hypot(pose.y);
    JointAngles([
        pose.y.atan2(pose.x).to_degrees(),
        90.0 - pose.z.atan2(planar).to_degrees(),
        0.0,
        pose.w,
        pose.p,
        pose.r,
    ])
}

impl ArmController for SimArm {
    fn connect(&mut self, host: &str) -> Result<(), ArmError> {
        let mut state = self.lock();
        if state.fail_connect {
            return Err(ArmError::ActuatorUnavailable(format!(
                "simulated controller at {host} refused the connection"
            )));
        }
        state.snapshot.connected = true;
        state.snapshot.host = Some(host.to_string());
        Ok(())
    }

    fn current_state(&mut self) -> Result<ArmState, ArmError> {
        let state = self.connected("current_state")?;
        if state.fail_sampling {
            return Err(ArmError::fault("current_state", "simulated refresh failure"));
        }
        let pose = state.snapshot.pose;
        Ok(ArmState {
            joints: joints_for(&pose),
            pose,
        })
    }

    fn is_reachable(
        &mut self,
        _register: u16,
        pose: &Pose,
        _mode: MotionMode,
    ) -> Result<bool, ArmError> {
        let state = self.connected("is_reachable")?;
        let d = pose.radial_distance();
        Ok(d >= state.min_reach && d <= state.max_reach)
    }

    fn apply_pose(&mut self, register: u16, pose: &Pose) -> Result<(), ArmError> {
        let mut state = self.connected("apply_pose")?;
        state.snapshot.registers.insert(register, *pose);
        state.snapshot.pose = *pose;
        state.snapshot.applied.push(*pose);
        Ok(())
    }

    fn abort_all(&mut self) -> Result<(), ArmError> {
        let mut state = self.connected("abort_all")?;
        state.snapshot.running = false;
        state.snapshot.aborts += 1;
        Ok(())
    }

    fn reset_alarms(&mut self) -> Result<(), ArmError> {
        let mut state = self.connected("reset_alarms")?;
        state.snapshot.alarms_cleared += 1;
        Ok(())
    }

    fn select_program(&mut self, name: &str) -> Result<(), ArmError> {
        let mut state = self.connected("select_program")?;
        state.snapshot.selected_program = Some(name.to_string());
        Ok(())
    }

    fn run_selected(&mut self) -> Result<(), ArmError> {
        let mut state = self.connected("run_selected")?;
        if state.snapshot.selected_program.is_none() {
            return Err(ArmError::fault("run_selected", "no program selected"));
        }
        state.snapshot.running = true;
        Ok(())
    }

    fn read_digital_output(&mut self, index: u32) -> Result<bool, ArmError> {
        let state = self.connected("read_digital_output")?;
        Ok(state.outputs.get(&index).copied().unwrap_or(false))
    }
}
