pub mod conversation;
pub mod directives;
pub mod events;
pub mod protocol;
