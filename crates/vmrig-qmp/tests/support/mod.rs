//! Scripted QMP peer for driving the client over a socketpair.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;

use serde_json::{Value, json};

/// The hypervisor side of the conversation, driven from a test thread.
pub struct Peer {
    reader: BufReader<UnixStream>,
}

/// Creates a connected channel/peer pair.
pub fn connected_pair() -> (UnixStream, Peer) {
    let (client_end, peer_end) = UnixStream::pair().expect("socketpair failed");
    (
        client_end,
        Peer {
            reader: BufReader::new(peer_end),
        },
    )
}

impl Peer {
    /// Sends one frame.
    pub fn send(&mut self, value: &Value) {
        let stream = self.reader.get_mut();
        stream
            .write_all(value.to_string().as_bytes())
            .expect("peer write failed");
        stream.write_all(b"\n").expect("peer write failed");
    }

    /// Receives one request; panics if the client hung up instead.
    pub fn recv(&mut self) -> Value {
        self.try_recv().expect("peer expected a request")
    }

    /// Receives one request, or `None` once the client hangs up.
    pub fn try_recv(&mut self) -> Option<Value> {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).expect("peer read failed");
        if read == 0 {
            None
        } else {
            Some(serde_json::from_str(line.trim_end()).expect("peer received invalid JSON"))
        }
    }

    /// Sends the greeting with the given capability list.
    pub fn greet(&mut self, capabilities: &[&str]) {
        self.send(&json!({"QMP": {"capabilities": capabilities}}));
    }

    /// Receives the negotiation command, acknowledges it, and returns
    /// the request for inspection.
    pub fn accept_negotiation(&mut self) -> Value {
        let request = self.recv();
        self.send(&json!({"return": {}}));
        request
    }

    /// Runs the full handshake with an `oob` greeting.
    pub fn handshake(&mut self) {
        self.greet(&["oob"]);
        let negotiation = self.accept_negotiation();
        assert_eq!(negotiation, json!({"execute": "qmp_capabilities"}));
    }

    /// Sends a success response.
    pub fn respond(&mut self, value: Value) {
        self.send(&json!({"return": value}));
    }

    /// Sends an error response.
    pub fn respond_error(&mut self, class: &str, desc: &str) {
        self.send(&json!({"error": {"class": class, "desc": desc}}));
    }

    /// Sends an event.
    pub fn event(&mut self, name: &str, data: Value) {
        self.send(&json!({"event": name, "data": data}));
    }

    /// Sends a `JOB_STATUS_CHANGE` event.
    pub fn job_status(&mut self, id: &str, status: &str) {
        self.event("JOB_STATUS_CHANGE", json!({"id": id, "status": status}));
    }
}
