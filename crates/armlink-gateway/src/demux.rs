//! Inbound message classification and the per-connection command loop.
//!
//! [`classify`] is the single place the wire precedence lives:
//!
//! | Shape | Variant |
//! |---|---|
//! | exactly 6 comma-separated fields | [`Inbound::Pose`] |
//! | exactly 13 comma-separated fields | [`Inbound::Calibration`] |
//! | `run` / `reset` / `stop` / `home` (case-sensitive) | [`Inbound::Command`] |
//! | any other single field | [`Inbound::Prompt`] |
//! | everything else | [`Inbound::Ignored`] |
//!
//! The variant depends only on field count and literal content.  Field
//! values are parsed afterwards, so a 6-field message with a bad number is
//! still a (malformed) pose and never falls through to another category.

use std::sync::Arc;

use armlink_hal::{ArmHandle, Procedures};
use armlink_runtime::{EnqueueError, PromptQueue};
use armlink_types::{
    CALIBRATION_FIELDS, CalibrationFrame, ConnectionId, DiscreteCommand, POSE_FIELDS, ParseError,
    Pose,
};
use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::RwLock;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tracing::{debug, info, warn};

/// Longest accepted inbound line, in bytes.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

// ────────────────────────────────────────────────────────────────────────────
// Classification
// ────────────────────────────────────────────────────────────────────────────

/// One classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound<'a> {
    Pose(Result<Pose, ParseError>),
    Calibration(Result<CalibrationFrame, ParseError>),
    Command(DiscreteCommand),
    Prompt(&'a str),
    Ignored,
}

/// Classify one inbound line.  Surrounding whitespace is ignored.
pub fn classify(message: &str) -> Inbound<'_> {
    let message = message.trim();
    if message.is_empty() {
        return Inbound::Ignored;
    }
    let fields: Vec<&str> = message.split(',').collect();
    match fields.len() {
        POSE_FIELDS => Inbound::Pose(Pose::from_fields(&fields)),
        CALIBRATION_FIELDS => Inbound::Calibration(CalibrationFrame::from_fields(&fields)),
        1 => match DiscreteCommand::from_keyword(message) {
            Some(command) => Inbound::Command(command),
            None => Inbound::Prompt(message),
        },
        _ => Inbound::Ignored,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Dispatch
// ────────────────────────────────────────────────────────────────────────────

/// What handling one message amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    PoseApplied,
    PoseRejected,
    Calibrated,
    Executed(DiscreteCommand),
    PromptQueued,
    /// The prompt could not be queued (no conversation backend, full queue).
    PromptDropped,
    /// A 6- or 13-field message with an unparsable field.
    Malformed,
    /// The actuator reported an error while handling the message.
    ActuatorFailed,
    Ignored,
}

/// Everything a connection loop needs to act on inbound messages.  Cheap to
/// clone; one copy per connection.
#[derive(Clone)]
pub struct CommandContext {
    arm: ArmHandle,
    procedures: Procedures,
    calibration: Arc<RwLock<Option<CalibrationFrame>>>,
    prompts: Option<PromptQueue>,
    include_calibration: bool,
}

impl CommandContext {
    pub fn new(arm: ArmHandle, procedures: Procedures) -> Self {
        Self {
            arm,
            procedures,
            calibration: Arc::new(RwLock::new(None)),
            prompts: None,
            include_calibration: false,
        }
    }

    /// Forward prompts to `queue`.  Without a queue prompts are dropped.
    pub fn with_prompts(mut self, queue: PromptQueue) -> Self {
        self.prompts = Some(queue);
        self
    }

    /// Append the latest scene calibration summary to every prompt.
    pub fn with_calibration_in_prompts(mut self, include: bool) -> Self {
        self.include_calibration = include;
        self
    }

    /// The most recently received calibration frame.
    pub async fn calibration(&self) -> Option<CalibrationFrame> {
        *self.calibration.read().await
    }

    /// Classify and handle one message.  Never fails: problems are logged
    /// and reported through the returned [`Dispatch`].
    pub async fn dispatch(&self, message: &str) -> Dispatch {
        match classify(message) {
            Inbound::Pose(Ok(pose)) => self.apply_pose(pose).await,
            Inbound::Calibration(Ok(frame)) => {
                *self.calibration.write().await = Some(frame);
                info!(surface_distance = frame.surface_distance, "calibration frame replaced");
                Dispatch::Calibrated
            }
            Inbound::Pose(Err(e)) | Inbound::Calibration(Err(e)) => {
                warn!(error = %e, message = %message.trim(), "malformed message dropped");
                Dispatch::Malformed
            }
            Inbound::Command(command) => match self.arm.execute(command, &self.procedures).await {
                Ok(()) => {
                    info!(%command, "discrete command executed");
                    Dispatch::Executed(command)
                }
                Err(e) => {
                    warn!(%command, error = %e, "discrete command failed");
                    Dispatch::ActuatorFailed
                }
            },
            Inbound::Prompt(text) => self.forward_prompt(text).await,
            Inbound::Ignored => {
                debug!(message = %message.trim(), "message ignored");
                Dispatch::Ignored
            }
        }
    }

    async fn apply_pose(&self, pose: Pose) -> Dispatch {
        match self.arm.try_apply(self.procedures.register, pose).await {
            Ok(true) => {
                debug!(?pose, "pose applied");
                Dispatch::PoseApplied
            }
            Ok(false) => {
                info!(?pose, "pose unreachable; not applied");
                Dispatch::PoseRejected
            }
            Err(e) => {
                warn!(?pose, error = %e, "pose update failed");
                Dispatch::ActuatorFailed
            }
        }
    }

    async fn forward_prompt(&self, text: &str) -> Dispatch {
        let Some(queue) = &self.prompts else {
            warn!(prompt = %text, "no conversation backend configured; prompt dropped");
            return Dispatch::PromptDropped;
        };

        let mut instruction = text.to_string();
        if self.include_calibration
            && let Some(frame) = self.calibration().await
        {
            instruction.push('\n');
            instruction.push_str(&frame.summary());
        }

        match queue.enqueue(instruction) {
            // The worker logs the outcome; the read loop moves on.
            Ok(_ticket) => {
                info!(prompt = %text, "prompt queued");
                Dispatch::PromptQueued
            }
            Err(EnqueueError::Full) => {
                warn!(prompt = %text, "prompt queue full; prompt dropped");
                Dispatch::PromptDropped
            }
            Err(EnqueueError::Closed) => {
                warn!(prompt = %text, "prompt worker stopped; prompt dropped");
                Dispatch::PromptDropped
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Connection loop
// ────────────────────────────────────────────────────────────────────────────

/// Why a connection's read loop ended.
#[derive(Debug)]
pub enum LoopExit {
    /// The client closed its side of the stream.
    Closed,
    /// The connection was dropped by the gateway, e.g. after a failed write.
    Dropped,
    /// Reading failed or the client sent an over-long line.
    Transport(String),
}

/// Read newline-delimited messages from `reader` and dispatch each in
/// arrival order until the stream ends, fails, or `closed` resolves.
///
/// Lines are decoded leniently: invalid UTF-8 becomes `U+FFFD` and the line
/// is classified like any other.  Surrounding whitespace (including a
/// trailing `\r`) is ignored and a final unterminated line is still handled
/// at end of stream.
pub async fn read_commands<R, C>(
    reader: R,
    conn_id: ConnectionId,
    ctx: CommandContext,
    closed: C,
) -> LoopExit
where
    R: AsyncRead + Unpin,
    C: Future<Output = ()>,
{
    let codec = AnyDelimiterCodec::new_with_max_length(vec![b'\n'], vec![b'\n'], MAX_LINE_LENGTH);
    let mut lines = FramedRead::new(reader, codec);
    tokio::pin!(closed);
    loop {
        let next = tokio::select! {
            biased;
            () = &mut closed => return LoopExit::Dropped,
            next = lines.next() => next,
        };
        match next {
            Some(Ok(raw)) => {
                let line = String::from_utf8_lossy(&raw);
                let outcome = ctx.dispatch(&line).await;
                debug!(%conn_id, ?outcome, "message handled");
            }
            Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)) => {
                return LoopExit::Transport(format!(
                    "inbound line exceeded {MAX_LINE_LENGTH} bytes"
                ));
            }
            Some(Err(AnyDelimiterCodecError::Io(e))) => return LoopExit::Transport(e.to_string()),
            None => return LoopExit::Closed,
        }
    }
}
