//! Token-aware context truncation
//!
//! Fits a conversation into a node's prompt budget:
//!
//! 1. a leading system message is pinned and never touched;
//! 2. the final message (the active user turn) is pinned;
//! 3. history between them is evicted oldest-first, half of what remains at
//!    a time, until the conversation fits or one history message is left;
//! 4. if it still does not fit, the final message's content is cut to the
//!    token prefix that fits, possibly down to empty.
//!
//! The result is deterministic for a given conversation, budget and encoder.

use crate::protocol::Message;
use crate::registry::Node;
use crate::tokens::{TokenCounter, TOKENS_REPLY_PRIMING};
use chatrelay_common::error::Result;
use tracing::{debug, info};

/// Outcome of fitting a conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fitted {
    /// Conversation to forward
    pub messages: Vec<Message>,

    /// History messages evicted
    pub evicted: usize,

    /// Halving rounds performed
    pub rounds: usize,

    /// Whether the final message's content was cut
    pub final_truncated: bool,

    /// Estimated tokens of `messages`
    pub prompt_tokens: usize,
}

/// Fits conversations to node context windows
#[derive(Clone)]
pub struct ContextTruncator {
    counter: TokenCounter,
}

impl ContextTruncator {
    pub fn new(counter: TokenCounter) -> Self {
        Self { counter }
    }

    pub fn counter(&self) -> &TokenCounter {
        &self.counter
    }

    /// Fit `messages` into `node.context_window - reserved_tokens`
    pub fn fit(
        &self,
        messages: &[Message],
        node: &Node,
        reserved_tokens: usize,
    ) -> Result<Vec<Message>> {
        Ok(self.fit_with_report(messages, node, reserved_tokens)?.messages)
    }

    /// Like [`fit`](Self::fit), also reporting what was removed
    pub fn fit_with_report(
        &self,
        messages: &[Message],
        node: &Node,
        reserved_tokens: usize,
    ) -> Result<Fitted> {
        let budget = node.context_window.saturating_sub(reserved_tokens);
        debug!(
            "Fitting {} messages for {}: window {}, reserved {}, budget {}",
            messages.len(),
            node.endpoint,
            node.context_window,
            reserved_tokens,
            budget
        );
        self.fit_to_budget(messages, budget)
    }

    /// Fit `messages` into an effective token budget
    pub fn fit_to_budget(&self, messages: &[Message], budget: usize) -> Result<Fitted> {
        let (system, rest) = match messages.split_first() {
            Some((first, rest)) if first.is_system() => (Some(first), rest),
            _ => (None, messages),
        };

        let Some((last, history)) = rest.split_last() else {
            let messages: Vec<Message> = system.into_iter().cloned().collect();
            let prompt_tokens = self.counter.count(&messages)?;
            return Ok(Fitted {
                messages,
                evicted: 0,
                rounds: 0,
                final_truncated: false,
                prompt_tokens,
            });
        };

        // The count is additive, so each message is tokenized once and the
        // window is moved over precomputed costs.
        let system_cost = match system {
            Some(message) => self.counter.message_cost(message)?,
            None => 0,
        };
        let history_costs = history
            .iter()
            .map(|message| self.counter.message_cost(message))
            .collect::<Result<Vec<usize>>>()?;
        let last_cost = self.counter.message_cost(last)?;

        let pinned = TOKENS_REPLY_PRIMING + system_cost;
        let mut history_cost: usize = history_costs.iter().sum();
        let tokens_before = pinned + history_cost + last_cost;

        let mut start = 0;
        let mut rounds = 0;
        while pinned + history_cost + last_cost > budget && history.len() - start > 1 {
            let remove = ((history.len() - start) / 2).max(1);
            history_cost -= history_costs[start..start + remove].iter().sum::<usize>();
            start += remove;
            rounds += 1;
            debug!("Evicting {} oldest messages (round {})", remove, rounds);
        }

        let mut last = last.clone();
        let mut prompt_tokens = pinned + history_cost + last_cost;
        let final_truncated = prompt_tokens > budget;
        if final_truncated {
            prompt_tokens = self.truncate_final(&mut last, pinned + history_cost, budget)?;
        }

        info!(
            "Truncation: {} tokens in, {} tokens out (budget {}), {} messages evicted{}",
            tokens_before,
            prompt_tokens,
            budget,
            start,
            if final_truncated { ", final message cut" } else { "" }
        );

        let messages = system
            .into_iter()
            .cloned()
            .chain(history[start..].iter().cloned())
            .chain(std::iter::once(last))
            .collect();

        Ok(Fitted {
            messages,
            evicted: start,
            rounds,
            final_truncated,
            prompt_tokens,
        })
    }

    /// Cut `last.content` to the token prefix that fits next to `base` tokens.
    ///
    /// Returns the resulting conversation total.
    fn truncate_final(&self, last: &mut Message, base: usize, budget: usize) -> Result<usize> {
        let ids = self.counter.encode(&last.content)?;

        let mut empty = last.clone();
        empty.content.clear();
        let fixed = self.counter.message_cost(&empty)?;

        let mut keep = budget.saturating_sub(base + fixed).min(ids.len());
        debug!("Cutting final message to {} of {} tokens", keep, ids.len());

        // Decoding a prefix can re-encode to more tokens than it came from,
        // so shrink until the re-counted total fits.
        loop {
            last.content = if keep == 0 {
                String::new()
            } else {
                self.counter.decode(&ids[..keep])?
            };

            let total = base + self.counter.message_cost(last)?;
            if total <= budget || keep == 0 {
                return Ok(total);
            }
            keep -= (total - budget).clamp(1, keep);
        }
    }
}
