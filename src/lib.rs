pub mod config;
pub mod networking;
pub mod node;

pub use config::SessionConfig;
pub use node::LocalNode;
