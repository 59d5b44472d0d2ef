pub mod conversation;
pub mod error;
pub mod models;

pub use conversation::*;
pub use error::*;
pub use models::*;
