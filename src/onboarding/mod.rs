//! Onboarding — the signup stage-progression engine.
//!
//! A registration moves an account through an ordered set of gates
//! (payment, profile, completion). The [`OnboardingManager`] validates and
//! applies each step against the store, the [`Reaper`] removes
//! registrations that stall, and [`signup_routes`] exposes both over HTTP.

pub mod manager;
pub mod model;
pub mod reaper;
pub mod routes;
pub mod state;

pub use manager::OnboardingManager;
pub use model::{Account, ProfileUpdate, Role};
pub use reaper::{ReapReport, Reaper, spawn_reaper_task};
pub use routes::{SignupRouteState, signup_routes};
pub use state::{AdvanceMode, Stage, Transition, advance};
