//! In-chat control commands

use super::{RunState, Shared};
use crate::config::BotConfig;
use crate::filter::ControlCommand;

/// Run a command and return the text to send back
pub(super) fn execute(shared: &Shared, command: ControlCommand, bot: &BotConfig) -> String {
    tracing::info!(?command, "control command");
    match command {
        ControlCommand::Pause(reason) => {
            let suffix = reason.as_deref().map(|r| format!(" ({r})")).unwrap_or_default();
            match shared.pause(reason) {
                Ok(()) => format!("Auto replies paused{suffix}"),
                Err(_) => format!("Cannot pause while {}", shared.state.get()),
            }
        }
        ControlCommand::Resume => match shared.resume() {
            Ok(()) => "Auto replies resumed".to_string(),
            Err(_) => format!("Cannot resume while {}", shared.state.get()),
        },
        ControlCommand::Status => status_text(shared),
        ControlCommand::Help => ControlCommand::help_text(&bot.control_command_prefix),
    }
}

fn status_text(shared: &Shared) -> String {
    let status = shared.status();
    let mut lines = vec![format!("State: {}", status.state)];
    if status.state == RunState::Paused
        && let Some(reason) = &status.pause_reason
    {
        lines.push(format!("Paused: {reason}"));
    }
    lines.push(format!(
        "Preset: {}",
        status.active_preset.as_deref().unwrap_or("none")
    ));
    lines.push(format!("Replies: {}", status.stats.total_replies));
    lines.push(format!("Failed: {}", status.stats.failed_turns));
    lines.push(format!("Uptime: {}", format_uptime(status.stats.uptime_secs)));
    lines.join("\n")
}

fn format_uptime(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m}m")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_formatting() {
        assert_eq!(format_uptime(5), "5s");
        assert_eq!(format_uptime(125), "2m 5s");
        assert_eq!(format_uptime(7300), "2h 1m");
    }
}
