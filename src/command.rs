use std::path::Path;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Result};
use serde::{de, Deserialize};

use crate::message::{Group, Message, RecentUser, User};

/// What a command does once it passes validation.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Replies with the canned `response` and nothing else.
    #[default]
    Static,
    /// Registers one vote against this command's threshold.
    Vote,
    /// Re-arms the vote command named in `target`.
    Reset,
}

#[derive(Clone, PartialEq, Deserialize, Debug)]
pub struct Command {
    pub cmd: String, // Mandatory

    // Runtime state, never defined in commands.yaml
    #[serde(skip)]
    pub recent_users: Vec<RecentUser>,
    #[serde(skip, default = "SystemTime::now")]
    pub can_be_used_at: SystemTime,

    #[serde(default)]
    pub kind: CommandKind,

    /// Unique voters required to trigger; only meaningful for vote commands.
    #[serde(default = "Command::default_threshold")]
    pub threshold: u32,

    /// For reset commands, the vote command they re-arm.
    #[serde(default)]
    pub target: Option<String>,

    #[serde(default)]
    pub alternative_cmds: Vec<String>,

    #[serde(default)]
    pub response: Option<String>,

    /// Said in chat when a vote command's threshold is reached.
    #[serde(default)]
    pub triggered_response: Option<String>,

    #[serde(default, deserialize_with = "Command::cast_cooldown")]
    pub global_cooldown: Duration,

    #[serde(default, deserialize_with = "Command::cast_cooldown")]
    pub user_cooldown: Duration,

    #[serde(default = "Command::default_permitted_by")]
    #[serde(deserialize_with = "Command::build_permitted_by")]
    pub permitted_by: Vec<Group>,

    #[serde(default, deserialize_with = "Command::build_groups")]
    pub allowed_to_bypass: Vec<Group>,
}

impl Command {
    pub fn is_global_cooldown_active(&self) -> bool {
        SystemTime::now() < self.can_be_used_at
    }

    pub fn add_global_cooldown(&mut self) {
        self.can_be_used_at = SystemTime::now() + self.global_cooldown;
    }

    pub fn is_user_permitted(&self, user: &User) -> bool {
        user.is_in(&self.permitted_by)
    }

    pub fn can_user_bypass(&self, user: &User) -> bool {
        user.is_in(&self.allowed_to_bypass)
    }

    pub fn is_user_cooldown_active(&mut self, user: &User) -> bool {
        for recent_user in &mut self.recent_users {
            if recent_user.user.username != user.username {
                continue;
            }

            if recent_user.is_cooldown_active() {
                tracing::debug!(user = %user.username, cmd = %self.cmd, "user cooldown still active");
                return true;
            }
            recent_user.add_cooldown(self.user_cooldown);
            return false;
        }

        let mut recent_user = RecentUser::new(user.clone());
        recent_user.add_cooldown(self.user_cooldown);
        self.recent_users.push(recent_user);

        false
    }

    pub fn matches(&self, word: &str) -> bool {
        word == self.cmd || self.alternative_cmds.iter().any(|alt| alt == word)
    }

    fn default_threshold() -> u32 {
        1
    }

    fn cast_cooldown<'de, D>(input: D) -> Result<Duration, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        let n = u64::deserialize(input)?;
        Ok(Duration::from_secs(n))
    }

    fn default_permitted_by() -> Vec<Group> {
        vec![Group::Everyone]
    }

    fn build_permitted_by<'de, D>(input: D) -> Result<Vec<Group>, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        let mut groups = Self::build_groups(input)?;
        if groups.is_empty() {
            groups.push(Group::Everyone);
        }
        Ok(groups)
    }

    fn build_groups<'de, D>(input: D) -> Result<Vec<Group>, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        let names = Vec::<String>::deserialize(input)?;
        names
            .iter()
            .map(|name| {
                Group::parse(name).ok_or_else(|| de::Error::custom(format!("unknown group '{name}'")))
            })
            .collect()
    }
}

/// Loads and sanity-checks the command table.
pub fn load_commands<P: AsRef<Path>>(path: P) -> Result<Vec<Command>> {
    let path = path.as_ref();
    let commands_yaml = match std::fs::read_to_string(path) {
        Ok(cmds) => cmds,
        Err(e) => bail!("{e}:\nFile {} not found, can't continue.", path.display()),
    };

    let commands: Vec<Command> = match serde_yaml::from_str(&commands_yaml) {
        Ok(cmds) => cmds,
        Err(e) => bail!("Syntax of defined commands in {} is wrong.\nIn specific: {e}", path.display()),
    };

    validate_table(&commands)?;
    Ok(commands)
}

fn validate_table(commands: &[Command]) -> Result<()> {
    for command in commands {
        match command.kind {
            CommandKind::Vote if command.threshold == 0 => {
                bail!("vote command '{}' needs a threshold of at least 1", command.cmd)
            }
            CommandKind::Reset => {
                let Some(target) = &command.target else {
                    bail!("reset command '{}' names no vote command to re-arm", command.cmd)
                };
                if !commands
                    .iter()
                    .any(|c| c.kind == CommandKind::Vote && &c.cmd == target)
                {
                    bail!("reset command '{}' targets unknown vote command '{target}'", command.cmd)
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Permission and cooldown gate. Returns the command only when this user is
/// allowed to run it right now, charging the cooldowns as a side effect.
pub fn validate_and_return_command<'a>(
    option: Option<&'a mut Command>,
    message: &Message,
) -> Option<&'a mut Command> {
    let cmd = option?;

    if !cmd.is_user_permitted(&message.user) {
        return None;
    }
    if cmd.can_user_bypass(&message.user) {
        if !cmd.is_global_cooldown_active() {
            cmd.add_global_cooldown();
        }
        return Some(cmd);
    }
    if cmd.is_global_cooldown_active() {
        return None;
    }
    if cmd.is_user_cooldown_active(&message.user) {
        return None;
    }

    cmd.add_global_cooldown();

    Some(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = r#"
- cmd: "!chatban"
  kind: vote
  threshold: 5
  user_cooldown: 30
- cmd: "!chatban-reset"
  kind: reset
  target: "!chatban"
  permitted_by: [streamer, moderator]
- cmd: "!discord"
  alternative_cmds: ["!dc"]
  response: "join us at discord.gg/somewhere"
  global_cooldown: 10
"#;

    fn table() -> Vec<Command> {
        let commands: Vec<Command> = serde_yaml::from_str(TABLE).unwrap();
        validate_table(&commands).unwrap();
        commands
    }

    fn viewer(name: &str) -> Message {
        Message::new(User::new(name.into(), vec![]), "!chatban".into())
    }

    #[test]
    fn yaml_table_parses_kinds_and_defaults() {
        let commands = table();
        assert_eq!(commands[0].kind, CommandKind::Vote);
        assert_eq!(commands[0].threshold, 5);
        assert_eq!(commands[1].kind, CommandKind::Reset);
        assert_eq!(commands[1].target.as_deref(), Some("!chatban"));
        assert_eq!(commands[1].permitted_by, vec![Group::Streamer, Group::Moderator]);
        assert_eq!(commands[2].kind, CommandKind::Static);
        assert_eq!(commands[2].permitted_by, vec![Group::Everyone]);
        assert!(commands[2].matches("!dc"));
    }

    #[test]
    fn reset_without_known_target_is_rejected() {
        let yaml = r#"
- cmd: "!oops"
  kind: reset
  target: "!missing"
"#;
        let commands: Vec<Command> = serde_yaml::from_str(yaml).unwrap();
        assert!(validate_table(&commands).is_err());
    }

    #[test]
    fn unknown_group_fails_to_parse() {
        let yaml = r#"
- cmd: "!x"
  permitted_by: [wizards]
"#;
        assert!(serde_yaml::from_str::<Vec<Command>>(yaml).is_err());
    }

    #[test]
    fn unpermitted_user_is_filtered_out() {
        let mut commands = table();
        let message = viewer("rando");
        let reset = commands.iter_mut().find(|c| c.cmd == "!chatban-reset");
        assert!(validate_and_return_command(reset, &message).is_none());
    }

    #[test]
    fn moderator_passes_the_permission_gate() {
        let mut commands = table();
        let message = Message::new(
            User::new("helper".into(), vec![Group::Moderator]),
            "!chatban-reset".into(),
        );
        let reset = commands.iter_mut().find(|c| c.cmd == "!chatban-reset");
        assert!(validate_and_return_command(reset, &message).is_some());
    }

    #[test]
    fn global_cooldown_blocks_the_second_caller() {
        let mut commands = table();
        {
            let discord = commands.iter_mut().find(|c| c.cmd == "!discord");
            assert!(validate_and_return_command(discord, &viewer("first")).is_some());
        }
        let discord = commands.iter_mut().find(|c| c.cmd == "!discord");
        assert!(validate_and_return_command(discord, &viewer("second")).is_none());
    }

    #[test]
    fn user_cooldown_blocks_repeat_calls_but_not_other_users() {
        let mut commands = table();
        {
            let vote = commands.iter_mut().find(|c| c.cmd == "!chatban");
            assert!(validate_and_return_command(vote, &viewer("alice")).is_some());
        }
        {
            let vote = commands.iter_mut().find(|c| c.cmd == "!chatban");
            assert!(validate_and_return_command(vote, &viewer("alice")).is_none());
        }
        let vote = commands.iter_mut().find(|c| c.cmd == "!chatban");
        assert!(validate_and_return_command(vote, &viewer("bob")).is_some());
    }
}
