//! Cross-crate integration tests for the Virtuoso virtual sound card

#[cfg(test)]
mod card_integration;
