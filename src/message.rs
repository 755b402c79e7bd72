use std::time::{Duration, SystemTime};

/// Permission group derived from Twitch badge tags. Every user implicitly
/// belongs to `Everyone`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Group {
    Streamer,
    Moderator,
    Vip,
    Everyone,
}

impl Group {
    pub fn parse(group: &str) -> Option<Group> {
        match group.to_uppercase().as_str() {
            "STREAMER" => Some(Group::Streamer),
            "MODERATOR" => Some(Group::Moderator),
            "VIP" => Some(Group::Vip),
            "EVERYONE" => Some(Group::Everyone),
            _ => None,
        }
    }
}

/// One parsed PRIVMSG: who said it and what they said.
#[derive(Clone, PartialEq, Debug)]
pub struct Message {
    pub user: User,
    pub text: String,
}

impl Message {
    pub fn new(user: User, text: String) -> Self {
        Message { user, text }
    }
}

#[derive(Clone, Debug)]
pub struct User {
    pub username: String,
    pub groups: Vec<Group>,
}

impl PartialEq for User {
    fn eq(&self, other: &Self) -> bool {
        self.username == other.username
    }
}

impl User {
    pub fn new(username: String, mut groups: Vec<Group>) -> Self {
        groups.push(Group::Everyone);
        User { username, groups }
    }

    /// Derives groups from the IRC tag blob that precedes a tagged PRIVMSG.
    pub fn from_tags(tags: &str, username: String) -> Self {
        let mut groups = vec![];
        if tags.contains("broadcaster/1") {
            groups.push(Group::Streamer);
        } else if tags.contains("mod=1") {
            groups.push(Group::Moderator);
        } else if tags.contains("vip=1") {
            groups.push(Group::Vip);
        }
        Self::new(username, groups)
    }

    pub fn is_in(&self, allowed: &[Group]) -> bool {
        self.groups.iter().any(|g| allowed.contains(g))
    }
}

/// Per-user cooldown bookkeeping for one command.
#[derive(Clone, PartialEq, Debug)]
pub struct RecentUser {
    pub user: User,
    pub can_use_at: SystemTime,
}

impl RecentUser {
    pub fn new(user: User) -> Self {
        RecentUser {
            user,
            can_use_at: SystemTime::now(),
        }
    }

    pub fn is_cooldown_active(&self) -> bool {
        SystemTime::now() < self.can_use_at
    }

    pub fn add_cooldown(&mut self, cooldown: Duration) {
        self.can_use_at = SystemTime::now() + cooldown;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn everyone_is_implicit() {
        let user = User::new("viewer".into(), vec![]);
        assert!(user.is_in(&[Group::Everyone]));
        assert!(!user.is_in(&[Group::Moderator]));
    }

    #[test]
    fn broadcaster_badge_wins_over_mod_flag() {
        let tags = "@badges=broadcaster/1;mod=0;vip=0";
        let user = User::from_tags(tags, "streamer".into());
        assert!(user.is_in(&[Group::Streamer]));
    }

    #[test]
    fn mod_flag_maps_to_moderator() {
        let tags = "@badges=;mod=1;vip=0";
        let user = User::from_tags(tags, "helper".into());
        assert!(user.is_in(&[Group::Moderator]));
        assert!(!user.is_in(&[Group::Streamer]));
    }

    #[test]
    fn plain_viewer_only_gets_everyone() {
        let user = User::from_tags("@badges=;mod=0", "viewer".into());
        assert_eq!(user.groups, vec![Group::Everyone]);
    }
}
