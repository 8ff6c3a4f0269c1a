//! Check-in Assist: channel orchestration for a personal check-in assistant.

pub mod channels;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod selection;
