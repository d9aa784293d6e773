//! Paced bulk approval of pending attendance sessions.
//!
//! [`driver::BatchDriver`] walks the backend's approval queue one batch step at
//! a time through a [`client::StepClient`], cooling down between steps when the
//! backend asks for it ([`governor::PacingGovernor`]) and publishing a
//! [`model::RunProgress`] snapshot after every change.

pub mod client;
pub mod config;
pub mod driver;
pub mod governor;
pub mod model;
pub mod progress;
