//! Websocket echo server built on `tungstenite`.

use std::{net::TcpListener, sync::Arc, thread};

use parking_lot::Mutex;
use streamrelay::Formatter;
use tungstenite::{
    Message,
    handshake::server::{ErrorResponse, Request, Response},
};

#[derive(Default)]
struct EchoState {
    paths: Vec<String>,
    messages: Vec<String>,
    closes: usize,
}

/// Echoes text frames back to the client and records each request path.
#[derive(Clone)]
pub struct WebSocketEcho {
    port: u16,
    state: Arc<Mutex<EchoState>>,
}

impl WebSocketEcho {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind websocket listener");
        let port = listener.local_addr().expect("websocket address").port();
        let state = Arc::new(Mutex::new(EchoState::default()));
        let accept_state = Arc::clone(&state);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                let conn_state = Arc::clone(&accept_state);
                thread::spawn(move || serve(stream, conn_state));
            }
        });
        Self { port, state }
    }

    pub fn url(&self) -> String {
        format!("ws://127.0.0.1:{}", self.port)
    }

    /// Request paths seen during handshakes.
    pub fn paths(&self) -> Vec<String> {
        self.state.lock().paths.clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.state.lock().messages.clone()
    }

    pub fn closes(&self) -> usize {
        self.state.lock().closes
    }
}

fn serve(stream: std::net::TcpStream, state: Arc<Mutex<EchoState>>) {
    let path_state = Arc::clone(&state);
    let callback = move |request: &Request, response: Response| {
        path_state.lock().paths.push(request.uri().path().to_owned());
        Ok::<_, ErrorResponse>(response)
    };
    let Ok(mut socket) = tungstenite::accept_hdr(stream, callback) else {
        return;
    };
    let formatter = Formatter::default();
    loop {
        match socket.read() {
            Ok(Message::Text(text)) => {
                if let Ok(record) = formatter.decode_record(text.as_bytes()) {
                    state.lock().messages.push(record.message().to_owned());
                }
                if socket.send(Message::Text(text)).is_err() {
                    return;
                }
            }
            Ok(Message::Close(_)) => {
                state.lock().closes += 1;
            }
            Ok(_) => {}
            Err(_) => return,
        }
    }
}
