//! # cleep-client
//!
//! Desktop control plane for Cleep devices:
//! - **Discovery**: the LAN bus feeds a persisted device registry
//! - **Install**: image catalog, download with integrity check, privileged
//!   flash and validation of a removable medium
//! - **Tool updates**: daily check and install of the flashing tool
//! - **Message plane**: in-process request/response bus and coalesced UI
//!   push topics tying the workers to the UI transport

pub mod app;
pub mod bus_bridge;
pub mod commands;
pub mod crash;
pub mod devices;
pub mod download;
pub mod events;
pub mod feeds;
pub mod install;
pub mod messagebus;
pub mod state;
pub mod updater;

pub use app::App;
pub use events::{UiPush, UiTopic};
pub use state::{AppContext, AppPaths, RuntimeOptions};
