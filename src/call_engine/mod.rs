//! Call Engine Module - Session State Machine
//!
//! Dieses Modul verwaltet:
//! - Anruf- und Gruppenzustand (IDLE, CALLING, RINGING, IN_CALL, IN_GROUP)
//! - Start/Stopp der Capture-Pipelines
//! - Annahmefilter für empfangene Medien
//! - Parsing der Benutzerbefehle

mod command;
mod engine;
mod state;

pub use command::{Command, DeviceAction, VideoAction};
pub use engine::{
    CallFailure, PipelineMode, SessionChannels, SessionConfig, SessionController, SessionError,
    SessionEvent, StatusReport, TimerEvent,
};
pub use state::{CallSession, CallState, TransmissionFlags};
