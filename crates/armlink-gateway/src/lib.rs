//! `armlink-gateway` – the concurrent core between the arm and its clients
//!
//! A line-oriented TCP gateway.  One [`TelemetryBroadcaster`] samples the
//! actuator and fans change-only telemetry out to every client, while each
//! connection runs its own read loop that classifies inbound lines and acts
//! on them:
//!
//! - `x,y,z,w,p,r` – reachability-gated pose update.
//! - 13 numbers – scene calibration frame.
//! - `run` / `reset` / `stop` / `home` – discrete actuator recipes.
//! - any other single field – natural-language prompt, queued for the
//!   conversation worker without blocking the read loop.
//!
//! Outbound lines are `True`/`False` when reachability changes and
//! `j1..j6,x,y,z,w,p,r[,bit]` when the sampled state changes.
//!
//! # Modules
//!
//! - [`registry`] – [`ConnectionRegistry`] with per-connection fault isolation.
//! - [`broadcaster`] – [`TelemetryBroadcaster`] and the late-joiner
//!   [`TelemetryCache`].
//! - [`demux`] – [`classify`], [`CommandContext`] and the read loop.
//! - [`server`] – [`GatewayServer`], the accept loop.

pub mod broadcaster;
pub mod demux;
pub mod registry;
pub mod server;

pub use broadcaster::{CycleReport, TelemetryBroadcaster, TelemetryCache};
pub use demux::{
    CommandContext, Dispatch, Inbound, LoopExit, MAX_LINE_LENGTH, classify, read_commands,
};
pub use registry::{BroadcastReport, ClientConnection, ConnectionRegistry};
pub use server::{DEFAULT_PORT, GatewayConfig, GatewayServer};
