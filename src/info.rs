// Copyright 2020 Joyent, Inc.

//! The info request/response exchange.
//!
//! An info request is a `\n`-separated list of names; the reply is
//! `name\tvalue\n...`. Both directions ride the standard 8-byte frame with
//! the info message type. Exchanges are short and blocking; the cluster
//! manager runs them on helper threads and consumes the parsed pairs from
//! its channel.

use std::io::{Read, Write};
use std::net::{SocketAddrV4, TcpStream};
use std::time::Duration;

use bytes::{Buf, BufMut};

use crate::error::Error;
use crate::proto::{
    proto_header, split_proto_header, PROTO_HEADER_SIZE, PROTO_SIZE_MAX, PROTO_TYPE_INFO,
    PROTO_VERSION,
};

/// Issue one info request and return the parsed `(name, value)` pairs.
pub fn exchange(
    addr: SocketAddrV4,
    names: &str,
    timeout: Duration,
) -> Result<Vec<(String, String)>, Error> {
    let mut stream = TcpStream::connect_timeout(&addr.into(), timeout)
        .map_err(|e| Error::Transient(format!("info connect {}: {}", addr, e)))?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    let mut payload = String::with_capacity(names.len() + 1);
    payload.push_str(names);
    if !payload.ends_with('\n') {
        payload.push('\n');
    }

    let mut request = Vec::with_capacity(PROTO_HEADER_SIZE + payload.len());
    request.put_u64(proto_header(PROTO_TYPE_INFO, payload.len()));
    request.put_slice(payload.as_bytes());
    stream.write_all(&request)?;

    let response = read_frame(&mut stream)?;
    let text = String::from_utf8(response)
        .map_err(|_| Error::ParseError("info response is not UTF-8".into()))?;
    Ok(parse_pairs(&text))
}

fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>, Error> {
    let mut header = [0u8; PROTO_HEADER_SIZE];
    stream.read_exact(&mut header)?;
    let (version, msg_type, size) = split_proto_header((&header[..]).get_u64());

    if version != PROTO_VERSION || msg_type != PROTO_TYPE_INFO {
        return Err(Error::ParseError(format!(
            "unexpected info frame: version {} type {}",
            version, msg_type
        )));
    }
    if size > PROTO_SIZE_MAX {
        return Err(Error::ParseError(format!("info frame of {} bytes", size)));
    }

    let mut payload = vec![0u8; size as usize];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}

/// Split `name\tvalue\n...` into pairs. Lines without a tab are dropped.
fn parse_pairs(text: &str) -> Vec<(String, String)> {
    text.split('\n')
        .filter_map(|line| {
            let mut parts = line.splitn(2, '\t');
            let name = parts.next()?;
            let value = parts.next()?;
            if name.is_empty() {
                None
            } else {
                Some((name.to_string(), value.to_string()))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn pairs_parse_and_skip_malformed_lines() {
        let pairs = parse_pairs("node\tBB9\npartitions\t4096\nnoise\n\t\n");
        assert_eq!(
            pairs,
            vec![
                ("node".to_string(), "BB9".to_string()),
                ("partitions".to_string(), "4096".to_string()),
            ]
        );
    }

    #[test]
    fn exchange_round_trips_one_request() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = match listener.local_addr().unwrap() {
            std::net::SocketAddr::V4(sa) => sa,
            _ => unreachable!(),
        };

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut header = [0u8; PROTO_HEADER_SIZE];
            stream.read_exact(&mut header).unwrap();
            let (_, msg_type, size) = split_proto_header((&header[..]).get_u64());
            assert_eq!(msg_type, PROTO_TYPE_INFO);
            let mut request = vec![0u8; size as usize];
            stream.read_exact(&mut request).unwrap();
            assert_eq!(&request, b"node\npartitions\n");

            let body = b"node\tBB9020011AC4202\npartitions\t4096\n";
            let mut reply = Vec::new();
            reply.put_u64(proto_header(PROTO_TYPE_INFO, body.len()));
            reply.put_slice(body);
            stream.write_all(&reply).unwrap();
        });

        let pairs =
            exchange(addr, "node\npartitions", Duration::from_secs(2)).unwrap();
        server.join().unwrap();

        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, "node");
        assert_eq!(pairs[1], ("partitions".to_string(), "4096".to_string()));
    }

    #[test]
    fn unreachable_host_is_transient() {
        let addr = "127.0.0.1:1".parse().unwrap();
        match exchange(addr, "node", Duration::from_millis(200)) {
            Err(Error::Transient(_)) => (),
            other => panic!("expected transient error, got {:?}", other),
        }
    }
}
