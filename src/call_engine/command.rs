//! Zeilenbasierte Befehle der interaktiven Oberfläche
//!
//! Einbuchstabige Kürzel (`t`, `s`, `a`, `r`), Slash-Befehle und freier
//! Text als Chat-Nachricht.

use crate::devices::DeviceSelector;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoAction {
    On,
    Off,
    /// Lokale Vorschau ohne Senden
    Test,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceAction {
    List,
    Test,
    Select(DeviceSelector),
}

/// Ein geparster Eingabebefehl
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    StartTalking,
    StopTalking,
    Answer,
    Reject,
    Call(String),
    Hangup,
    JoinGroup,
    LeaveGroup,
    Video(VideoAction),
    Camera(DeviceAction),
    Mic(DeviceAction),
    Mute,
    Unmute,
    Peers,
    Status,
    Help,
    Quit,
    Chat(String),
    /// Leere Zeile
    Empty,
    /// Bekannter Befehl mit falschen Argumenten (enthält die Usage)
    Invalid(&'static str),
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();

        match line {
            "" => return Command::Empty,
            "t" => return Command::StartTalking,
            "s" => return Command::StopTalking,
            "a" => return Command::Answer,
            "r" => return Command::Reject,
            _ => {}
        }

        let Some(rest) = line.strip_prefix('/') else {
            return Command::Chat(line.to_string());
        };

        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };

        match name.to_lowercase().as_str() {
            "call" if arg.is_empty() => Command::Invalid("/call <name>"),
            "call" => Command::Call(arg.to_string()),
            "answer" => Command::Answer,
            "reject" => Command::Reject,
            "hangup" => Command::Hangup,
            "voice" => Command::JoinGroup,
            "leave" => Command::LeaveGroup,
            "video" => match arg.to_lowercase().as_str() {
                "on" => Command::Video(VideoAction::On),
                "off" => Command::Video(VideoAction::Off),
                "test" => Command::Video(VideoAction::Test),
                _ => Command::Invalid("/video on|off|test"),
            },
            "camera" => Command::Camera(device_action(arg)),
            "mic" => Command::Mic(device_action(arg)),
            "mute" => Command::Mute,
            "unmute" => Command::Unmute,
            "peers" => Command::Peers,
            "status" => Command::Status,
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            _ => Command::Unknown(name.to_string()),
        }
    }
}

fn device_action(arg: &str) -> DeviceAction {
    match arg.to_lowercase().as_str() {
        "" | "list" => DeviceAction::List,
        "test" => DeviceAction::Test,
        _ => DeviceAction::Select(DeviceSelector::parse(arg)),
    }
}

// ============================================================================
// TESTS
// ============================================================================
