//! Bridge between an editor's scene and sandboxed extension scripts.

pub mod camera;
pub mod capability;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod extension_log;
pub mod host;
pub mod layer;
pub mod marshal;
pub mod property_override;
pub mod registry;
pub mod sandbox;
pub mod session;
pub mod shell;
pub mod snapshot;
pub mod surface_rhai;
pub mod sync;

pub mod cli;

pub use config::BridgeConfig;
pub use error::{BridgeError, BridgeResult};
pub use shell::{BridgeContext, EditorShell, MountRequest};
