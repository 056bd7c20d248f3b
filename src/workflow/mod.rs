pub mod follow_up;
pub mod session_state;

pub use follow_up::{normalize_follow_up_label, FollowUpController, NextStep, Transition};
pub use session_state::{ControllerState, SessionState};
