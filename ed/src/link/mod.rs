//! Socket link between processes
//!
//! Events cross process boundaries as newline-terminated frames over a Unix
//! domain socket. The hub ([`listener::serve`]) relays every valid frame it
//! receives to all other connected clients; each process runs a [`Link`]
//! that feeds its dispatcher's `in` box and drains the frames the dispatcher
//! queues for sending.

use std::path::PathBuf;

pub mod client;
pub mod frame;
pub mod listener;

pub use client::{Link, LinkHandle, send_once};
pub use frame::{MAX_FRAME_SIZE, decode_frame, write_frame};
pub use listener::{cleanup_socket, create_listener, create_listener_at, serve};

/// Default hub socket path
pub fn get_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("eddi")
        .join("eddi.sock")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_path_ends_with_eddi_sock() {
        assert!(get_socket_path().ends_with("eddi/eddi.sock"));
    }
}
