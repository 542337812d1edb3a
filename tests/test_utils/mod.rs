//! Shared helpers for integration tests.

#![allow(dead_code)]

pub mod relay;
pub mod websocket;

use std::time::{Duration, Instant};

pub use relay::EchoRelay;
pub use websocket::WebSocketEcho;

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
