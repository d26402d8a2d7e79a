pub mod adapter;
pub mod cloud;
pub mod credentials;
pub mod error;
pub mod fs;
pub mod local;
pub mod models;
pub mod webdav;

mod memory;
pub use memory::MemoryAdapter;

pub use adapter::{Backend, InitOutcome, PermissionMode, PermissionState, StorageAdapter};
pub use cloud::{CloudAdapter, CloudGateway, HttpCloudGateway, SyncMetadata, TokenProvider};
pub use credentials::{CredentialManager, WebdavCredentials};
pub use error::{Result, StorageError};
pub use fs::{FileSystemAdapter, PermissionAuthority, ProbeAuthority};
pub use local::LocalDbAdapter;
pub use models::{
    Dataset, Group, Meter, MeterType, Reading, Settings, StorageMode, Tariff, DATASET_VERSION,
};
pub use webdav::{
    ConflictCheck, DavTransport, HttpDavClient, RetryPolicy, ServerFlavor, WebDavAdapter,
};
