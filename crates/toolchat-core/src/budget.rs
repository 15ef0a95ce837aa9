//! Token Budgeting
//!
//! Trims conversation history so that a model call fits the provider's context window.
//! The system prompt and the turns of the current exchange are always sent; older
//! history is kept newest-first until the next turn would overflow.

use serde::{Deserialize, Serialize};

use crate::message::{Message, Role};

/// Fixed cost added to every turn for role and framing tokens
pub const PER_TURN_OVERHEAD: u32 = 4;

/// Default tokens held back for the model's reply
pub const DEFAULT_RESPONSE_RESERVE: u32 = 4096;

/// Context window and reply reserve for one model call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBudget {
    pub context_window: u32,
    pub response_reserve: u32,
}

impl TokenBudget {
    pub const fn new(context_window: u32, response_reserve: u32) -> Self {
        Self {
            context_window,
            response_reserve,
        }
    }

    /// Estimated cost of one turn
    pub fn turn_cost<F>(message: &Message, estimate: &F) -> u32
    where
        F: Fn(&str) -> u32,
    {
        estimate(&message.budget_text()).saturating_add(PER_TURN_OVERHEAD)
    }

    /// Trim `history` for a call carrying `system_prompt` and `new_message`
    pub fn fit<F>(&self, system_prompt: &Message, history: &[Message], new_message: &Message, estimate: F) -> Vec<Message>
    where
        F: Fn(&str) -> u32,
    {
        self.fit_pinned(system_prompt, history, std::slice::from_ref(new_message), estimate)
    }

    /// Like [`TokenBudget::fit`], with several pinned trailing turns (the user message
    /// plus everything the current turn has produced so far).
    pub fn fit_pinned<F>(&self, system_prompt: &Message, history: &[Message], pinned: &[Message], estimate: F) -> Vec<Message>
    where
        F: Fn(&str) -> u32,
    {
        let mut total = Self::turn_cost(system_prompt, &estimate);
        for message in pinned {
            total = total.saturating_add(Self::turn_cost(message, &estimate));
        }

        let mut start = history.len();
        for (idx, message) in history.iter().enumerate().rev() {
            let cost = Self::turn_cost(message, &estimate);
            if total
                .saturating_add(cost)
                .saturating_add(self.response_reserve)
                > self.context_window
            {
                break;
            }
            total = total.saturating_add(cost);
            start = idx;
        }

        // A tool result without its assistant call is rejected by every provider
        while start < history.len() && history[start].role == Role::Tool {
            start += 1;
        }

        if start > 0 {
            tracing::debug!(
                dropped = start,
                kept = history.len() - start,
                context_window = self.context_window,
                "Trimmed history to fit context window"
            );
        }

        history[start..].to_vec()
    }
}

/// Trim `history` to fit `context_window`, always keeping the system prompt and the
/// new message. Walks newest to oldest and stops at the first turn that would overflow.
pub fn fit<F>(
    system_prompt: &Message,
    history: &[Message],
    new_message: &Message,
    context_window: u32,
    response_reserve: u32,
    estimate: F,
) -> Vec<Message>
where
    F: Fn(&str) -> u32,
{
    TokenBudget::new(context_window, response_reserve).fit(system_prompt, history, new_message, estimate)
}
