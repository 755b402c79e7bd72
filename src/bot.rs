use std::collections::HashMap;

use crate::chat::SessionHandle;
use crate::command::{self, Command, CommandKind};
use crate::message::Message;
use crate::overlay::{OverlayChannel, OverlayEvent};
use crate::vote::{VoteOutcome, VoteThreshold};

const OVERLAY_DOWN_REPLY: &str = "the overlay isn't connected right now, votes are paused";
const ALREADY_TRIGGERED_REPLY: &str = "that one already triggered, wait for a mod to reset it";

/// The chat side of the process: reads channel messages, routes them through
/// the command table, and drives the vote rounds.
pub struct Bot<O: OverlayChannel> {
    session: SessionHandle,
    /// Optional session on the streamer's own account; when present, the
    /// triggered announcement comes from the streamer instead of the bot.
    announcer: Option<SessionHandle>,
    active_commands: Vec<Command>,
    votes: HashMap<String, VoteThreshold>,
    overlay: O,
}

impl<O: OverlayChannel> Bot<O> {
    pub fn new(
        session: SessionHandle,
        announcer: Option<SessionHandle>,
        active_commands: Vec<Command>,
        overlay: O,
    ) -> Self {
        let votes = active_commands
            .iter()
            .filter(|c| c.kind == CommandKind::Vote)
            .map(|c| (c.cmd.clone(), VoteThreshold::new(c.cmd.clone(), c.threshold)))
            .collect();

        Bot {
            session,
            announcer,
            active_commands,
            votes,
            overlay,
        }
    }

    pub async fn run(&mut self) {
        loop {
            tokio::select! {
                message = self.session.next_message() => match message {
                    Some(message) => self.handle_message(message).await,
                    None => {
                        tracing::warn!("chat session ended, stopping");
                        break;
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown requested");
                    break;
                }
            }
        }
    }

    pub(crate) async fn handle_message(&mut self, message: Message) {
        let first_word = match message.text.split(' ').next() {
            Some(word) if !word.is_empty() => word.to_string(),
            _ => return,
        };

        let (kind, cmd, response, target, triggered_response) = {
            let found = self.active_commands.iter_mut().find(|c| c.matches(&first_word));
            let Some(cmd) = command::validate_and_return_command(found, &message) else {
                return;
            };
            (
                cmd.kind,
                cmd.cmd.clone(),
                cmd.response.clone(),
                cmd.target.clone(),
                cmd.triggered_response.clone(),
            )
        };

        if let Some(response) = response {
            self.session.say(response).await;
        }

        match kind {
            CommandKind::Static => {}
            CommandKind::Vote => {
                self.handle_vote(&cmd, triggered_response, &message.user.username).await
            }
            CommandKind::Reset => {
                if let Some(target) = target {
                    self.handle_reset(&target, &message.user.username).await;
                }
            }
        }
    }

    /// One vote attempt. Nobody watching the overlay means the triggered
    /// action would go nowhere, so the vote is not even registered.
    async fn handle_vote(&mut self, cmd: &str, triggered_response: Option<String>, voter: &str) {
        if self.overlay.listener_count() == 0 {
            self.session.say(OVERLAY_DOWN_REPLY).await;
            return;
        }

        let Some(vote) = self.votes.get_mut(cmd) else {
            return;
        };

        match vote.register_vote(voter) {
            VoteOutcome::Accepted { count, threshold } => {
                self.overlay.broadcast(&OverlayEvent::VoteProgress {
                    command: vote.name().to_string(),
                    count,
                    threshold,
                });
                self.session.say(format!("@{voter} vote counted ({count}/{threshold})")).await;
            }
            VoteOutcome::Duplicate { count, threshold } => {
                self.session
                    .say(format!("@{voter} you already voted ({count}/{threshold})"))
                    .await;
            }
            VoteOutcome::ThresholdReached => {
                let threshold = vote.threshold();
                tracing::info!(cmd, threshold, "vote threshold reached");
                self.overlay.broadcast(&OverlayEvent::ThresholdReached {
                    command: vote.name().to_string(),
                    threshold,
                });
                let line = triggered_response
                    .unwrap_or_else(|| format!("{cmd} triggered with {threshold} votes!"));
                match &self.announcer {
                    Some(announcer) => announcer.say(line).await,
                    None => self.session.say(line).await,
                }
            }
            VoteOutcome::AlreadyTriggered => {
                self.session.say(ALREADY_TRIGGERED_REPLY).await;
            }
        }
    }

    async fn handle_reset(&mut self, target: &str, operator: &str) {
        let Some(vote) = self.votes.get_mut(target) else {
            return;
        };
        vote.reset();
        tracing::info!(vote = target, operator, "vote round reset");
        self.overlay.broadcast(&OverlayEvent::VoteReset {
            command: target.to_string(),
        });
        self.session.say(format!("{target} is armed again")).await;
    }

    #[cfg(test)]
    pub(crate) fn vote_state(&self, cmd: &str) -> Option<&VoteThreshold> {
        self.votes.get(cmd)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use super::*;
    use crate::message::{Group, User};

    #[derive(Clone, Default)]
    struct RecordingOverlay {
        listeners: Arc<AtomicUsize>,
        events: Arc<Mutex<Vec<String>>>,
    }

    impl OverlayChannel for RecordingOverlay {
        fn listener_count(&self) -> usize {
            self.listeners.load(Ordering::SeqCst)
        }

        fn broadcast(&self, event: &OverlayEvent) {
            self.events.lock().push(serde_json::to_string(event).unwrap());
        }
    }

    fn commands() -> Vec<Command> {
        serde_yaml::from_str(
            r#"
- cmd: "!chatban"
  kind: vote
  threshold: 2
  triggered_response: "chat has spoken, streamer is banned from chat"
- cmd: "!chatban-reset"
  kind: reset
  target: "!chatban"
  permitted_by: [streamer, moderator]
- cmd: "!discord"
  response: "join the discord"
"#,
        )
        .unwrap()
    }

    struct Harness {
        bot: Bot<RecordingOverlay>,
        overlay: RecordingOverlay,
        replies: mpsc::Receiver<String>,
        _incoming: mpsc::Sender<Message>,
    }

    fn harness() -> Harness {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, out_rx) = mpsc::channel(16);
        let overlay = RecordingOverlay::default();
        overlay.listeners.store(1, Ordering::SeqCst);
        let bot = Bot::new(
            SessionHandle::new(in_rx, out_tx),
            None,
            commands(),
            overlay.clone(),
        );
        Harness {
            bot,
            overlay,
            replies: out_rx,
            _incoming: in_tx,
        }
    }

    fn chat(user: &str, groups: Vec<Group>, text: &str) -> Message {
        Message::new(User::new(user.into(), groups), text.into())
    }

    #[tokio::test]
    async fn static_command_replies_with_its_response() {
        let mut h = harness();
        h.bot.handle_message(chat("viewer", vec![], "!discord")).await;
        assert_eq!(h.replies.recv().await.unwrap(), "join the discord");
    }

    #[tokio::test]
    async fn unknown_text_is_ignored() {
        let mut h = harness();
        h.bot.handle_message(chat("viewer", vec![], "hello everyone")).await;
        assert!(h.replies.try_recv().is_err());
    }

    #[tokio::test]
    async fn votes_progress_and_trigger_through_chat() {
        let mut h = harness();

        h.bot.handle_message(chat("alice", vec![], "!chatban")).await;
        assert_eq!(h.replies.recv().await.unwrap(), "@alice vote counted (1/2)");

        h.bot.handle_message(chat("alice", vec![], "!chatban")).await;
        assert_eq!(h.replies.recv().await.unwrap(), "@alice you already voted (1/2)");

        h.bot.handle_message(chat("bob", vec![], "!chatban")).await;
        assert_eq!(
            h.replies.recv().await.unwrap(),
            "chat has spoken, streamer is banned from chat"
        );

        h.bot.handle_message(chat("carol", vec![], "!chatban")).await;
        assert_eq!(h.replies.recv().await.unwrap(), ALREADY_TRIGGERED_REPLY);

        let events = h.overlay.events.lock();
        assert_eq!(events.len(), 2);
        assert!(events[0].contains("vote_progress"));
        assert!(events[1].contains("threshold_reached"));
    }

    #[tokio::test]
    async fn no_overlay_listeners_pauses_voting() {
        let mut h = harness();
        h.overlay.listeners.store(0, Ordering::SeqCst);

        h.bot.handle_message(chat("alice", vec![], "!chatban")).await;
        assert_eq!(h.replies.recv().await.unwrap(), OVERLAY_DOWN_REPLY);
        assert_eq!(h.bot.vote_state("!chatban").unwrap().current_count(), 0);
    }

    #[tokio::test]
    async fn moderator_reset_rearms_the_round() {
        let mut h = harness();
        h.bot.handle_message(chat("alice", vec![], "!chatban")).await;
        h.bot.handle_message(chat("bob", vec![], "!chatban")).await;
        assert!(!h.bot.vote_state("!chatban").unwrap().is_listening());

        h.bot
            .handle_message(chat("helper", vec![Group::Moderator], "!chatban-reset"))
            .await;
        assert!(h.bot.vote_state("!chatban").unwrap().is_listening());

        let events = h.overlay.events.lock();
        assert!(events.last().unwrap().contains("vote_reset"));
    }

    #[tokio::test]
    async fn viewers_cannot_reset() {
        let mut h = harness();
        h.bot.handle_message(chat("alice", vec![], "!chatban")).await;
        h.bot.handle_message(chat("bob", vec![], "!chatban")).await;

        h.bot.handle_message(chat("rando", vec![], "!chatban-reset")).await;
        assert!(!h.bot.vote_state("!chatban").unwrap().is_listening());
    }
}
