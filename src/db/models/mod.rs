pub mod profile;
pub mod session;

pub use profile::{Profile, ProfileSnapshot, StrategyConfig};
pub use session::Session;
