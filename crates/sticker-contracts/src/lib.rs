pub mod credentials;
pub mod errors;
pub mod events;
pub mod stickers;
pub mod styles;
