// Roomcast API Library
//
// HTTP and WebSocket surface of the roomcast signaling server

pub mod http;

// Re-export commonly used types
pub use http::{create_router, AppState};
