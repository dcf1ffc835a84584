pub mod guard;

pub use guard::{ADMIN_PROFILE, AccessDecision, AccessGuard, Action, Caller, SYSTEM_CALLER_ID};
