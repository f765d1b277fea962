//! Clients for the external accounts/stats service

pub mod client;
pub mod matches;
pub mod skills;

pub use client::AccountsClient;
pub use matches::MatchStore;
pub use skills::SkillStore;
