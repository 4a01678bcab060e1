//! [`ArmHandle`] – exclusive-access guard around the controller session.
//!
//! The broadcaster and every connection share one controller.  Each logical
//! operation ("sample state", "test reachability then apply", "run the home
//! recipe") executes as a single critical section on a blocking worker
//! thread, so two operations never interleave against the same session.
//!
//! The [`ReachabilityState`] flag is written inside the critical section that
//! performed the test.  Its value therefore always reflects the most recent
//! *completed* reachability test, ordered by lock acquisition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use armlink_types::{ArmError, DiscreteCommand, Pose, TelemetryFrame};
use tracing::{debug, info};

use crate::actuator::{ArmController, MotionMode};

// ────────────────────────────────────────────────────────────────────────────
// ReachabilityState
// ────────────────────────────────────────────────────────────────────────────

/// Process-wide outcome of the most recent reachability test.
///
/// Starts out `true` so that a fresh gateway does not report a fault before
/// any pose has been commanded.
#[derive(Debug, Clone)]
pub struct ReachabilityState(Arc<AtomicBool>);

impl ReachabilityState {
    pub fn new(initial: bool) -> Self {
        Self(Arc::new(AtomicBool::new(initial)))
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn store(&self, reachable: bool) {
        self.0.store(reachable, Ordering::SeqCst);
    }
}

impl Default for ReachabilityState {
    fn default() -> Self {
        Self::new(true)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Procedures
// ────────────────────────────────────────────────────────────────────────────

/// Parameters of the discrete-command recipes.
#[derive(Debug, Clone, PartialEq)]
pub struct Procedures {
    /// Position register that pose targets are written into.
    pub register: u16,
    /// Fixed reference pose used by `home` and `run`.
    pub home_pose: Pose,
    /// Teach-pendant program selected and started by `run`.
    pub program: String,
    /// Pause between recipe steps, giving the controller time to settle.
    pub settle_delay: Duration,
}

impl Default for Procedures {
    fn default() -> Self {
        Self {
            register: 3,
            home_pose: Pose::new(1133.0, 400.0, 1060.0, -10.0, 0.0, 90.0),
            program: "DAMIEN".to_string(),
            settle_delay: Duration::from_millis(500),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ArmHandle
// ────────────────────────────────────────────────────────────────────────────

/// Cloneable, shared handle to the single controller session.
#[derive(Clone)]
pub struct ArmHandle {
    controller: Arc<Mutex<Box<dyn ArmController>>>,
    reachable: ReachabilityState,
}

impl ArmHandle {
    pub fn new(controller: Box<dyn ArmController>) -> Self {
        Self {
            controller: Arc::new(Mutex::new(controller)),
            reachable: ReachabilityState::default(),
        }
    }

    /// The shared reachability flag maintained by [`try_apply`][Self::try_apply].
    pub fn reachability(&self) -> ReachabilityState {
        self.reachable.clone()
    }

    /// Run `f` with exclusive access to the controller on a blocking thread.
    ///
    /// # Errors
    ///
    /// Propagates the error returned by `f`, or reports
    /// [`ArmError::ActuatorUnavailable`] if the lock was poisoned by a
    /// panicking operation.
    pub async fn with_controller<T, F>(&self, operation: &'static str, f: F) -> Result<T, ArmError>
    where
        F: FnOnce(&mut dyn ArmController) -> Result<T, ArmError> + Send + 'static,
        T: Send + 'static,
    {
        let controller = Arc::clone(&self.controller);
        tokio::task::spawn_blocking(move || {
            let mut guard = controller.lock().map_err(|_| {
                ArmError::ActuatorUnavailable(format!("controller lock poisoned during {operation}"))
            })?;
            f(&mut **guard)
        })
        .await
        .map_err(|e| ArmError::fault(operation, format!("worker task failed: {e}")))?
    }

    /// Open the controller session and, when `run_program` is set, run the
    /// full `run` recipe so the robot starts tracking the position register.
    pub async fn startup(
        &self,
        host: &str,
        procedures: &Procedures,
        run_program: bool,
    ) -> Result<(), ArmError> {
        let host = host.to_string();
        let procedures = procedures.clone();
        self.with_controller("startup", move |arm| {
            arm.connect(&host)?;
            info!(host = %host, "connected to controller");
            if run_program {
                run_recipe(arm, &procedures)?;
                info!(program = %procedures.program, "controller program started");
            }
            Ok(())
        })
        .await
    }

    /// Sample joints and world pose, plus digital output `signal` when
    /// configured, as one consistent snapshot.
    pub async fn sample(&self, signal: Option<u32>) -> Result<TelemetryFrame, ArmError> {
        self.with_controller("sample", move |arm| {
            let state = arm.current_state()?;
            let bit = match signal {
                Some(index) => Some(arm.read_digital_output(index)?),
                None => None,
            };
            Ok(TelemetryFrame::new(state, bit))
        })
        .await
    }

    /// Test `pose` for reachability and apply it only when reachable.
    ///
    /// Returns the test outcome.  The shared [`ReachabilityState`] is updated
    /// before the lock is released, whether or not the pose was applied.
    pub async fn try_apply(&self, register: u16, pose: Pose) -> Result<bool, ArmError> {
        let reachable = self.reachable.clone();
        self.with_controller("try_apply", move |arm| {
            let ok = arm.is_reachable(register, &pose, MotionMode::JOINT_WORLD)?;
            reachable.store(ok);
            if ok {
                arm.apply_pose(register, &pose)?;
            } else {
                debug!(?pose, "pose rejected as unreachable");
            }
            Ok(ok)
        })
        .await
    }

    /// Execute one discrete command recipe.
    pub async fn execute(
        &self,
        command: DiscreteCommand,
        procedures: &Procedures,
    ) -> Result<(), ArmError> {
        let procedures = procedures.clone();
        self.with_controller("execute", move |arm| match command {
            DiscreteCommand::Run => run_recipe(arm, &procedures),
            DiscreteCommand::Home => home_recipe(arm, &procedures),
            DiscreteCommand::Reset => arm.reset_alarms(),
            DiscreteCommand::Stop => arm.abort_all(),
        })
        .await
    }
}

fn settle(procedures: &Procedures) {
    if !procedures.settle_delay.is_zero() {
        thread::sleep(procedures.settle_delay);
    }
}

fn home_recipe(arm: &mut dyn ArmController, procedures: &Procedures) -> Result<(), ArmError> {
    settle(procedures);
    arm.apply_pose(procedures.register, &procedures.home_pose)?;
    settle(procedures);
    Ok(())
}

fn run_recipe(arm: &mut dyn ArmController, procedures: &Procedures) -> Result<(), ArmError> {
    home_recipe(arm, procedures)?;
    arm.abort_all()?;
    settle(procedures);
    arm.reset_alarms()?;
    arm.select_program(&procedures.program)?;
    arm.run_selected()
}

#[cfg(test)]
mod tests {
    use super::*;
    use armlink_types::ArmState;

    /// Records every call so recipes can be asserted step by step.
    struct ScriptedArm {
        calls: Arc<Mutex<Vec<String>>>,
        reachable: bool,
    }

    impl ScriptedArm {
        fn new(reachable: bool) -> (Box<Self>, Arc<Mutex<Vec<String>>>) {
            let calls = Arc::new(Mutex::new(Vec::new()));
            let arm = Box::new(Self {
                calls: Arc::clone(&calls),
                reachable,
            });
            (arm, calls)
        }

        fn log(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }
    }

    impl ArmController for ScriptedArm {
        fn connect(&mut self, host: &str) -> Result<(), ArmError> {
            self.log(format!("connect {host}"));
            Ok(())
        }
        fn current_state(&mut self) -> Result<ArmState, ArmError> {
            self.log("state");
            Ok(ArmState::default())
        }
        fn is_reachable(&mut self, register: u16, _: &Pose, _: MotionMode) -> Result<bool, ArmError> {
            self.log(format!("reachable? pr{register}"));
            Ok(self.reachable)
        }
        fn apply_pose(&mut self, register: u16, pose: &Pose) -> Result<(), ArmError> {
            self.log(format!("apply pr{register} x={}", pose.x));
            Ok(())
        }
        fn abort_all(&mut self) -> Result<(), ArmError> {
            self.log("abort");
            Ok(())
        }
        fn reset_alarms(&mut self) -> Result<(), ArmError> {
            self.log("reset");
            Ok(())
        }
        fn select_program(&mut self, name: &str) -> Result<(), ArmError> {
            self.log(format!("select {name}"));
            Ok(())
        }
        fn run_selected(&mut self) -> Result<(), ArmError> {
            self.log("run");
            Ok(())
        }
        fn read_digital_output(&mut self, index: u32) -> Result<bool, ArmError> {
            self.log(format!("do{index}"));
            Ok(true)
        }
    }

    fn fast_procedures() -> Procedures {
        Procedures {
            settle_delay: Duration::ZERO,
            ..Procedures::default()
        }
    }

    #[tokio::test]
    async fn try_apply_applies_reachable_pose() {
        let (arm, calls) = ScriptedArm::new(true);
        let handle = ArmHandle::new(arm);
        let ok = handle.try_apply(3, Pose::new(630.0, 0.0, 0.0, 0.0, 0.0, 0.0)).await.unwrap();
        assert!(ok);
        assert!(handle.reachability().get());
        assert_eq!(*calls.lock().unwrap(), vec!["reachable? pr3", "apply pr3 x=630"]);
    }

    #[tokio::test]
    async fn try_apply_never_applies_unreachable_pose() {
        let (arm, calls) = ScriptedArm::new(false);
        let handle = ArmHandle::new(arm);
        let ok = handle.try_apply(3, Pose::default()).await.unwrap();
        assert!(!ok);
        assert!(!handle.reachability().get());
        assert!(calls.lock().unwrap().iter().all(|c| !c.starts_with("apply")));
    }

    #[tokio::test]
    async fn run_recipe_homes_then_starts_program() {
        let (arm, calls) = ScriptedArm::new(true);
        let handle = ArmHandle::new(arm);
        handle.execute(DiscreteCommand::Run, &fast_procedures()).await.unwrap();
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["apply pr3 x=1133", "abort", "reset", "select DAMIEN", "run"]
        );
    }

    #[tokio::test]
    async fn home_reset_and_stop_recipes() {
        let (arm, calls) = ScriptedArm::new(true);
        let handle = ArmHandle::new(arm);
        let procedures = fast_procedures();
        handle.execute(DiscreteCommand::Home, &procedures).await.unwrap();
        handle.execute(DiscreteCommand::Reset, &procedures).await.unwrap();
        handle.execute(DiscreteCommand::Stop, &procedures).await.unwrap();
        assert_eq!(*calls.lock().unwrap(), vec!["apply pr3 x=1133", "reset", "abort"]);
    }

    #[tokio::test]
    async fn sample_reads_signal_only_when_configured() {
        let (arm, calls) = ScriptedArm::new(true);
        let handle = ArmHandle::new(arm);
        let frame = handle.sample(None).await.unwrap();
        assert_eq!(frame.digital_signal, None);
        let frame = handle.sample(Some(7)).await.unwrap();
        assert_eq!(frame.digital_signal, Some(true));
        assert_eq!(*calls.lock().unwrap(), vec!["state", "state", "do7"]);
    }

    #[tokio::test]
    async fn startup_connects_and_optionally_runs() {
        let (arm, calls) = ScriptedArm::new(true);
        let handle = ArmHandle::new(arm);
        handle.startup("10.0.0.5", &fast_procedures(), false).await.unwrap();
        assert_eq!(*calls.lock().unwrap(), vec!["connect 10.0.0.5"]);
        handle.startup("10.0.0.5", &fast_procedures(), true).await.unwrap();
        assert_eq!(calls.lock().unwrap().last().map(String::as_str), Some("run"));
    }

    #[tokio::test]
    async fn concurrent_operations_do_not_interleave() {
        let (arm, calls) = ScriptedArm::new(true);
        let handle = ArmHandle::new(arm);
        let mut tasks = Vec::new();
        for i in 0..16 {
            let h = handle.clone();
            tasks.push(tokio::spawn(async move {
                h.try_apply(3, Pose::new(i as f64, 0.0, 0.0, 0.0, 0.0, 0.0)).await
            }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 32);
        // Every reachability test is immediately followed by its own apply.
        for pair in calls.chunks(2) {
            assert!(pair[0].starts_with("reachable?"));
            assert!(pair[1].starts_with("apply"));
        }
    }
}
