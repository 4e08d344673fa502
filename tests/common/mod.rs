// Copyright 2020 Joyent, Inc.

//! An in-process stand-in for a server node. It answers info exchanges
//! from configurable values and streams canned records to scan commands,
//! which is enough to drive the whole client through discovery, gossip,
//! partition updates, eviction, and scans on loopback.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddrV4, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const PROTO_TYPE_INFO: u8 = 1;
const PROTO_TYPE_MESSAGE: u8 = 3;
const INFO3_LAST: u8 = 1;

pub struct FakeNodeState {
    pub name: Mutex<String>,
    pub partitions: u32,
    pub partition_generation: Mutex<u32>,
    pub services: Mutex<String>,
    pub replicas_read: Mutex<String>,
    pub replicas_write: Mutex<String>,
    /// Canned scan stream: one record per entry, each a list of
    /// (bin name, integer value) pairs.
    pub scan_records: Mutex<Vec<Vec<(String, i64)>>>,
    /// Non-zero makes every scan reply with this result code instead of
    /// records.
    pub scan_result_code: Mutex<u8>,
    /// When set, the trailing end-of-stream message is followed by extra
    /// record bytes in the same frame, which a correct parser must ignore.
    pub trailing_garbage_after_last: Mutex<bool>,
}

pub struct FakeNode {
    pub addr: SocketAddrV4,
    pub state: Arc<FakeNodeState>,
}

impl FakeNode {
    pub fn start(name: &str, partitions: u32) -> FakeNode {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = match listener.local_addr().unwrap() {
            std::net::SocketAddr::V4(sa) => sa,
            _ => unreachable!(),
        };

        let state = Arc::new(FakeNodeState {
            name: Mutex::new(name.to_string()),
            partitions,
            partition_generation: Mutex::new(1),
            services: Mutex::new(String::new()),
            replicas_read: Mutex::new(String::new()),
            replicas_write: Mutex::new(String::new()),
            scan_records: Mutex::new(Vec::new()),
            scan_result_code: Mutex::new(0),
            trailing_garbage_after_last: Mutex::new(false),
        });

        let accept_state = Arc::clone(&state);
        thread::spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let conn_state = Arc::clone(&accept_state);
                        thread::spawn(move || serve_connection(stream, conn_state));
                    }
                    Err(_) => break,
                }
            }
        });

        FakeNode { addr, state }
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn host_port(&self) -> String {
        format!("{}:{}", self.addr.ip(), self.addr.port())
    }

    pub fn set_name(&self, name: &str) {
        *self.state.name.lock().unwrap() = name.to_string();
    }

    pub fn set_services(&self, services: &str) {
        *self.state.services.lock().unwrap() = services.to_string();
    }

    pub fn set_generation(&self, generation: u32) {
        *self.state.partition_generation.lock().unwrap() = generation;
    }

    pub fn set_replicas(&self, read: &str, write: &str) {
        *self.state.replicas_read.lock().unwrap() = read.to_string();
        *self.state.replicas_write.lock().unwrap() = write.to_string();
    }

    pub fn set_scan_records(&self, records: Vec<Vec<(String, i64)>>) {
        *self.state.scan_records.lock().unwrap() = records;
    }

    pub fn int_records(n: usize) -> Vec<Vec<(String, i64)>> {
        (0..n)
            .map(|i| vec![("seq".to_string(), i as i64)])
            .collect()
    }

    pub fn set_scan_result_code(&self, code: u8) {
        *self.state.scan_result_code.lock().unwrap() = code;
    }
}

fn serve_connection(mut stream: TcpStream, state: Arc<FakeNodeState>) {
    loop {
        let mut header = [0u8; 8];
        if stream.read_exact(&mut header).is_err() {
            return;
        }
        let word = u64::from_be_bytes(header);
        let msg_type = (word >> 48) as u8;
        let size = (word & 0x0000_FFFF_FFFF_FFFF) as usize;

        let mut payload = vec![0u8; size];
        if stream.read_exact(&mut payload).is_err() {
            return;
        }

        let ok = match msg_type {
            PROTO_TYPE_INFO => serve_info(&mut stream, &state, &payload),
            PROTO_TYPE_MESSAGE => serve_scan(&mut stream, &state),
            _ => false,
        };
        if !ok {
            return;
        }
    }
}

fn serve_info(stream: &mut TcpStream, state: &FakeNodeState, payload: &[u8]) -> bool {
    let request = String::from_utf8_lossy(payload);
    let mut response = String::new();

    for name in request.split('\n') {
        let value = match name {
            "node" => state.name.lock().unwrap().clone(),
            "partitions" => state.partitions.to_string(),
            "partition-generation" => state.partition_generation.lock().unwrap().to_string(),
            "services" => state.services.lock().unwrap().clone(),
            "replicas-read" => state.replicas_read.lock().unwrap().clone(),
            "replicas-write" => state.replicas_write.lock().unwrap().clone(),
            _ => continue,
        };
        response.push_str(name);
        response.push('\t');
        response.push_str(&value);
        response.push('\n');
    }

    write_frame(stream, PROTO_TYPE_INFO, response.as_bytes())
}

fn serve_scan(stream: &mut TcpStream, state: &FakeNodeState) -> bool {
    let result_code = *state.scan_result_code.lock().unwrap();
    if result_code != 0 {
        let msg = encode_msg(result_code, 0, &[]);
        return write_frame(stream, PROTO_TYPE_MESSAGE, &msg);
    }

    let records = state.scan_records.lock().unwrap().clone();
    for bins in &records {
        let msg = encode_msg(0, 0, bins);
        if !write_frame(stream, PROTO_TYPE_MESSAGE, &msg) {
            return false;
        }
    }

    let mut trailer = encode_msg(0, INFO3_LAST, &[]);
    if *state.trailing_garbage_after_last.lock().unwrap() {
        trailer.extend_from_slice(&encode_msg(0, 0, &[("ghost".to_string(), 0)]));
    }
    write_frame(stream, PROTO_TYPE_MESSAGE, &trailer)
}

fn write_frame(stream: &mut TcpStream, msg_type: u8, payload: &[u8]) -> bool {
    let word = (2u64 << 56) | (u64::from(msg_type) << 48) | payload.len() as u64;
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&word.to_be_bytes());
    frame.extend_from_slice(payload);
    stream.write_all(&frame).is_ok()
}

// One record message: 22-byte header, a digest field, then integer bins.
fn encode_msg(result_code: u8, info3: u8, bins: &[(String, i64)]) -> Vec<u8> {
    let mut msg = Vec::new();
    let has_body = result_code == 0 && info3 == 0;

    msg.push(22u8);
    msg.push(0); // info1
    msg.push(0); // info2
    msg.push(info3);
    msg.push(0); // unused
    msg.push(result_code);
    msg.extend_from_slice(&1u32.to_be_bytes()); // generation
    msg.extend_from_slice(&0u32.to_be_bytes()); // record ttl
    msg.extend_from_slice(&0u32.to_be_bytes()); // transaction ttl
    let n_fields: u16 = if has_body { 1 } else { 0 };
    let n_ops: u16 = if has_body { bins.len() as u16 } else { 0 };
    msg.extend_from_slice(&n_fields.to_be_bytes());
    msg.extend_from_slice(&n_ops.to_be_bytes());

    if !has_body {
        return msg;
    }

    // Digest field (type 4).
    msg.extend_from_slice(&21u32.to_be_bytes());
    msg.push(4);
    msg.extend_from_slice(&[9u8; 20]);

    for (name, value) in bins {
        msg.extend_from_slice(&(name.len() as u32 + 4 + 8).to_be_bytes());
        msg.push(1); // operator read
        msg.push(1); // integer particle
        msg.push(0); // version
        msg.push(name.len() as u8);
        msg.extend_from_slice(name.as_bytes());
        msg.extend_from_slice(&value.to_be_bytes());
    }
    msg
}

/// Poll until the condition holds or the timeout passes.
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}
