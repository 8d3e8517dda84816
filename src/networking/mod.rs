pub mod discovery;
pub mod error;
pub mod file_transfer;
pub mod handshake;
pub mod interface;
pub mod liveness;
pub mod protocol;
pub mod registry;

// Re-export key components for easier access
pub use discovery::{DiscoveryService, DiscoveryState};
pub use error::{ShareError, ShareResult};
pub use file_transfer::{
    AuthorizeCallback, FileTransferManager, StatusCallback, TransferReceipt, TransferStatus,
};
pub use registry::{Device, DeviceRegistry, PendingDiscoveries};
