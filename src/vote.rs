use std::collections::HashSet;

/// Result of a single vote attempt against a [`VoteThreshold`].
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum VoteOutcome {
    /// Vote counted, threshold not met yet.
    Accepted { count: u32, threshold: u32 },
    /// This participant already voted in the current round; nothing changed.
    Duplicate { count: u32, threshold: u32 },
    /// This vote was the one that met the threshold. Fires exactly once per round.
    ThresholdReached,
    /// The threshold was already met earlier in this round; vote ignored.
    AlreadyTriggered,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum VoteState {
    Listening,
    Caged,
}

/// Counts unique participants calling a command until a threshold is met,
/// then rejects everything until an operator resets the round.
///
/// Pure in-memory state, no I/O. Whoever receives the [`VoteOutcome`] decides
/// what to say in chat and what to push to the overlay.
pub struct VoteThreshold {
    name: String,
    threshold: u32,
    voters: HashSet<String>,
    count: u32,
    state: VoteState,
}

impl VoteThreshold {
    /// `threshold` must be at least 1; a threshold of 1 triggers on the first
    /// unique vote.
    pub fn new(name: impl Into<String>, threshold: u32) -> Self {
        assert!(threshold > 0, "vote threshold must be positive");
        VoteThreshold {
            name: name.into(),
            threshold,
            voters: HashSet::new(),
            count: 0,
            state: VoteState::Listening,
        }
    }

    /// Registers one vote for `participant_id`. The id is taken literally;
    /// an empty string is a valid (single) identity.
    ///
    /// Once the round is caged, new identities are not recorded at all.
    pub fn register_vote(&mut self, participant_id: &str) -> VoteOutcome {
        if self.state == VoteState::Caged {
            return VoteOutcome::AlreadyTriggered;
        }

        if self.voters.contains(participant_id) {
            return VoteOutcome::Duplicate {
                count: self.count,
                threshold: self.threshold,
            };
        }

        self.voters.insert(participant_id.to_string());
        self.count += 1;

        if self.count == self.threshold {
            self.state = VoteState::Caged;
            return VoteOutcome::ThresholdReached;
        }

        VoteOutcome::Accepted {
            count: self.count,
            threshold: self.threshold,
        }
    }

    /// Starts a fresh round. Idempotent; resetting a listening round is a no-op.
    pub fn reset(&mut self) {
        self.voters.clear();
        self.count = 0;
        self.state = VoteState::Listening;
    }

    pub fn is_listening(&self) -> bool {
        self.state == VoteState::Listening
    }

    pub fn current_count(&self) -> u32 {
        self.count
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
