//! In-process relay speaking the length-prefixed framing over TCP.
//!
//! Every DATA frame is decoded as a record, remembered and echoed back.
//! PING frames are answered with PONG and CLOSE ends the connection.

use std::{
    io::{Read, Write},
    net::{Shutdown, TcpListener, TcpStream},
    sync::Arc,
    thread,
};

use parking_lot::Mutex;
use streamrelay::{Formatter, Opcode, WireMessage};

#[derive(Default)]
struct RelayState {
    messages: Vec<String>,
    connections: usize,
    closes: usize,
    active: Option<TcpStream>,
}

/// Echo relay bound to an ephemeral localhost port.
#[derive(Clone)]
pub struct EchoRelay {
    port: u16,
    state: Arc<Mutex<RelayState>>,
}

impl EchoRelay {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind relay listener");
        let port = listener.local_addr().expect("relay address").port();
        let state = Arc::new(Mutex::new(RelayState::default()));
        let accept_state = Arc::clone(&state);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                let conn_state = Arc::clone(&accept_state);
                {
                    let mut state = conn_state.lock();
                    state.connections += 1;
                    state.active = stream.try_clone().ok();
                }
                thread::spawn(move || serve(stream, conn_state));
            }
        });
        Self { port, state }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn endpoint(&self) -> String {
        format!("tcp://127.0.0.1:{}", self.port)
    }

    /// Messages of every record received, in arrival order.
    pub fn messages(&self) -> Vec<String> {
        self.state.lock().messages.clone()
    }

    pub fn connections(&self) -> usize {
        self.state.lock().connections
    }

    pub fn closes(&self) -> usize {
        self.state.lock().closes
    }

    /// Write raw bytes to the current client connection.
    pub fn inject(&self, bytes: &[u8]) {
        let mut state = self.state.lock();
        let stream = state.active.as_mut().expect("relay has a client");
        stream.write_all(bytes).expect("inject bytes");
    }

    /// Forcefully terminate the current client connection.
    pub fn kick(&self) {
        if let Some(stream) = self.state.lock().active.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

fn serve(mut stream: TcpStream, state: Arc<Mutex<RelayState>>) {
    let formatter = Formatter::default();
    let mut decoder = formatter.decoder();
    let mut buf = [0u8; 4096];
    loop {
        let read = match stream.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        decoder.extend(&buf[..read]);
        while let Some(frame) = decoder.next_frame() {
            let Ok(message) = frame else { continue };
            let reply = match message.opcode {
                Opcode::Data => {
                    if let Ok(record) = formatter.decode_record(&message.payload) {
                        state.lock().messages.push(record.message().to_owned());
                    }
                    Some(message)
                }
                Opcode::Ping => Some(WireMessage::pong(message.payload)),
                Opcode::Close => {
                    state.lock().closes += 1;
                    let _ = stream.shutdown(Shutdown::Both);
                    return;
                }
                Opcode::Pong => None,
            };
            if let Some(reply) = reply {
                let Ok(bytes) = formatter.encode_frame(&reply) else {
                    continue;
                };
                if stream.write_all(&bytes).is_err() {
                    return;
                }
            }
        }
    }
}
