pub mod events;
pub mod registration;
pub mod token;
