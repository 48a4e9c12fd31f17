use anyhow::{bail, Result};

use kartnet::{Difficulty, GameMode};

/// Who may run a command. Levels are ordered: the crown holder can do
/// everything a usual player can, and hammer (admin) rights include
/// the crown's.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PermissionLevel {
    Usual,
    Crowned,
    Hammer,
}

/// Chat commands understood by the lobby. Typed in chat with a leading
/// `/`; the dispatcher checks the sender's permission level before
/// executing.
#[derive(Clone, Debug, PartialEq)]
pub enum LobbyCommand {
    /// Print a reference of available commands.
    ///
    /// Usage: `/help`
    Help,

    /// Print information about the server.
    ///
    /// Usage: `/info`
    Info,

    /// List the players muted by the sender.
    ///
    /// Usage: `/mutelist`
    MuteList,

    /// Stop hearing a player.
    ///
    /// Usage: `/mute <name>`
    Mute { name: String },

    /// Hear a player again.
    ///
    /// Usage: `/unmute <name>`
    Unmute { name: String },

    /// Restrict own messages to the named recipients.
    ///
    /// Usage: `/to <name> [name…]`
    To { names: Vec<String> },

    /// Speak to everyone again.
    ///
    /// Usage: `/public`
    Public,

    /// Speak to own team only.
    ///
    /// Usage: `/teamchat`
    TeamChat,

    /// Enter or leave self-imposed spectator mode.
    ///
    /// Usage: `/spectate on|off`
    Spectate { on: bool },

    /// Begin selection for the next match.
    ///
    /// Usage: `/start`
    Start,

    /// Kick a player from the server.
    ///
    /// Usage: `/kick <name>`
    Kick { name: String },

    /// Ban a connected player (by address, and online id if any),
    /// then kick them.
    ///
    /// Usage: `/ban <name> [reason…]`
    Ban { name: String, reason: String },

    /// Change the game mode for the next matches.
    ///
    /// Usage: `/mode <normal-race|time-trial|free-for-all|capture-the-flag|soccer>`
    SetMode { mode: GameMode },

    /// Change the difficulty for the next matches.
    ///
    /// Usage: `/difficulty <novice|intermediate|expert|supreme>`
    SetDifficulty { difficulty: Difficulty },

    /// Allow or forbid starting matches.
    ///
    /// Usage: `/allowstart on|off`
    AllowStart { on: bool },
}

impl LobbyCommand {
    /// Parse a chat command; `None` means the text is no known command.
    pub fn parse(text: &str) -> Option<LobbyCommand> {
        use LobbyCommand::*;

        let parts: Vec<&str> = text.split_whitespace().collect();

        match &parts[..] {
            ["/help"] => Some(Help),
            ["/info"] => Some(Info),
            ["/mutelist"] => Some(MuteList),
            ["/mute", name] => Some(Mute {
                name: name.to_string(),
            }),
            ["/unmute", name] => Some(Unmute {
                name: name.to_string(),
            }),
            ["/to", names @ ..] if !names.is_empty() => Some(To {
                names: names.iter().map(|n| n.to_string()).collect(),
            }),
            ["/public"] => Some(Public),
            ["/teamchat"] => Some(TeamChat),
            ["/spectate", state] => parse_switch(state).map(|on| Spectate { on }),
            ["/start"] => Some(Start),
            ["/kick", name] => Some(Kick {
                name: name.to_string(),
            }),
            ["/ban", name, reason @ ..] => Some(Ban {
                name: name.to_string(),
                reason: reason.join(" "),
            }),
            ["/mode", mode] => parse_mode(mode).ok().map(|mode| SetMode { mode }),
            ["/difficulty", difficulty] => parse_difficulty(difficulty)
                .ok()
                .map(|difficulty| SetDifficulty { difficulty }),
            ["/allowstart", state] => parse_switch(state).map(|on| AllowStart { on }),
            _ => None,
        }
    }

    /// The minimum level needed to run this command.
    pub fn required_permission(&self) -> PermissionLevel {
        use LobbyCommand::*;
        match self {
            Help | Info | MuteList | Mute { .. } | Unmute { .. } | To { .. } | Public
            | TeamChat | Spectate { .. } => PermissionLevel::Usual,
            Start | Kick { .. } => PermissionLevel::Crowned,
            Ban { .. } | SetMode { .. } | SetDifficulty { .. } | AllowStart { .. } => {
                PermissionLevel::Hammer
            }
        }
    }
}

fn parse_switch(text: &str) -> Option<bool> {
    match text {
        "on" | "1" => Some(true),
        "off" | "0" => Some(false),
        _ => None,
    }
}

pub fn parse_mode(text: &str) -> Result<GameMode> {
    Ok(match text {
        "normal-race" | "race" => GameMode::NormalRace,
        "time-trial" | "tt" => GameMode::TimeTrial,
        "free-for-all" | "ffa" => GameMode::FreeForAll,
        "capture-the-flag" | "ctf" => GameMode::CaptureTheFlag,
        "soccer" => GameMode::Soccer,
        other => bail!("unknown mode {:?}", other),
    })
}

pub fn parse_difficulty(text: &str) -> Result<Difficulty> {
    Ok(match text {
        "novice" => Difficulty::Novice,
        "intermediate" => Difficulty::Intermediate,
        "expert" => Difficulty::Expert,
        "supreme" => Difficulty::Supreme,
        other => bail!("unknown difficulty {:?}", other),
    })
}

/// Command reference that can be printed in-game.
pub const COMMAND_REFERENCE: &str = "\
/help                 Display this list.
/info                 Display information about the server.
/mute <name>          Stop hearing a player.  /unmute undoes it.
/mutelist             List the players you muted.
/to <name> [name...]  Talk to the named players only.
/public               Talk to everyone again.
/teamchat             Talk to your team only.
/spectate on|off      Watch instead of racing.
/start                (crown) Begin selection for the next match.
/kick <name>          (crown) Kick a player.
/ban <name> [reason]  (admin) Ban and kick a player.
/mode <mode>          (admin) Change the game mode.
/difficulty <d>       (admin) Change the difficulty.
/allowstart on|off    (admin) Allow or forbid starting matches.
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse_with_arguments() {
        assert_eq!(LobbyCommand::parse("/help"), Some(LobbyCommand::Help));
        assert_eq!(
            LobbyCommand::parse("/mute carl"),
            Some(LobbyCommand::Mute {
                name: "carl".to_string()
            })
        );
        assert_eq!(
            LobbyCommand::parse("/to ayla berta"),
            Some(LobbyCommand::To {
                names: vec!["ayla".to_string(), "berta".to_string()]
            })
        );
        assert_eq!(
            LobbyCommand::parse("/ban carl rammed everyone"),
            Some(LobbyCommand::Ban {
                name: "carl".to_string(),
                reason: "rammed everyone".to_string()
            })
        );
        assert_eq!(
            LobbyCommand::parse("/mode soccer"),
            Some(LobbyCommand::SetMode {
                mode: GameMode::Soccer
            })
        );
        assert_eq!(
            LobbyCommand::parse("/spectate on"),
            Some(LobbyCommand::Spectate { on: true })
        );
    }

    #[test]
    fn unknown_or_malformed_commands_do_not_parse() {
        assert_eq!(LobbyCommand::parse("/frobnicate"), None);
        assert_eq!(LobbyCommand::parse("/mute"), None);
        assert_eq!(LobbyCommand::parse("/to"), None);
        assert_eq!(LobbyCommand::parse("/mode chess"), None);
        assert_eq!(LobbyCommand::parse("/spectate sideways"), None);
        assert_eq!(LobbyCommand::parse("hello there"), None);
    }

    #[test]
    fn permissions_are_ordered() {
        assert!(PermissionLevel::Hammer > PermissionLevel::Crowned);
        assert!(PermissionLevel::Crowned > PermissionLevel::Usual);

        assert_eq!(
            LobbyCommand::parse("/help").unwrap().required_permission(),
            PermissionLevel::Usual
        );
        assert_eq!(
            LobbyCommand::parse("/kick x").unwrap().required_permission(),
            PermissionLevel::Crowned
        );
        assert_eq!(
            LobbyCommand::parse("/mode soccer")
                .unwrap()
                .required_permission(),
            PermissionLevel::Hammer
        );
    }
}
