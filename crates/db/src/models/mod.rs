pub mod ids;
pub mod scheduled_message;
pub mod user;
