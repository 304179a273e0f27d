//! WebSocket server for parley: phased sessions and the shared room

pub mod connection;
pub mod dispatch;
pub mod handlers;
pub mod registry;
pub mod room;
pub mod server;
pub mod state;
pub mod sweeper;

pub use dispatch::{DispatchFault, SessionDispatcher, SessionEnd};
pub use server::{build_router, run_server};
pub use state::AppState;
