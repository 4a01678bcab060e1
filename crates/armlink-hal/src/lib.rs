//! `armlink-hal` – Actuator Capability Port
//!
//! The gateway never talks to a robot controller SDK directly.  It talks to
//! the [`ArmController`] trait through a shared [`ArmHandle`], which
//! serializes every logical operation against the single controller session.
//!
//! # Modules
//!
//! - [`actuator`] – the [`ArmController`] trait and [`MotionMode`].
//! - [`handle`] – [`ArmHandle`], [`ReachabilityState`], and the
//!   [`Procedures`] recipes behind the discrete commands.
//! - [`sim`] – [`SimArm`][sim::SimArm], an in-process simulated manipulator
//!   for headless runs and tests.

pub mod actuator;
pub mod handle;
pub mod sim;

pub use actuator::{ArmController, MotionMode, MotionType, OrientType};
pub use handle::{ArmHandle, Procedures, ReachabilityState};
pub use sim::{SimArm, SimSnapshot};
