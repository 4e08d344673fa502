// Copyright 2020 Joyent, Inc.

//! Wire protocol for the record-message channel.
//!
//! Every message is framed by an 8-byte header carrying the protocol
//! version, a message type, and a 48-bit big-endian payload size. Info
//! exchanges use the same frame with their own message type (see the
//! `info` module); record traffic wraps one or more 22-byte message
//! headers, each followed by its fields and bin operations.

use bytes::{Buf, BufMut};

use crate::error::Error;
use crate::partition::Digest;
use crate::scan::{Scan, ScanPolicy};

pub(crate) const PROTO_HEADER_SIZE: usize = 8;
pub(crate) const MSG_HEADER_SIZE: usize = 22;

pub(crate) const PROTO_VERSION: u8 = 2;
pub(crate) const PROTO_TYPE_INFO: u8 = 1;
pub(crate) const PROTO_TYPE_MESSAGE: u8 = 3;

// Upper bound on any frame this client will buffer.
pub(crate) const PROTO_SIZE_MAX: u64 = 128 * 1024 * 1024;

pub(crate) const INFO1_READ: u8 = 1;
pub(crate) const INFO1_GET_NOBINDATA: u8 = 1 << 5;
pub(crate) const INFO2_WRITE: u8 = 1;
pub(crate) const INFO3_LAST: u8 = 1;

pub(crate) const RESULT_OK: u8 = 0;
pub(crate) const RESULT_NOT_FOUND: u8 = 2;

const FIELD_NAMESPACE: u8 = 0;
const FIELD_SETNAME: u8 = 1;
const FIELD_KEY: u8 = 2;
const FIELD_DIGEST: u8 = 4;
const FIELD_TASK_ID: u8 = 7;
const FIELD_SCAN_OPTIONS: u8 = 8;
const FIELD_UDF_PACKAGE_NAME: u8 = 30;
const FIELD_UDF_FUNCTION: u8 = 31;
const FIELD_UDF_ARGLIST: u8 = 32;
const FIELD_UDF_OP: u8 = 33;

const UDF_OP_BACKGROUND: u8 = 2;

const OPERATOR_READ: u8 = 1;

const PARTICLE_NULL: u8 = 0;
const PARTICLE_INTEGER: u8 = 1;
const PARTICLE_DOUBLE: u8 = 2;
const PARTICLE_STRING: u8 = 3;
const PARTICLE_BLOB: u8 = 4;
const PARTICLE_MAP: u8 = 19;
const PARTICLE_LIST: u8 = 20;

const SCAN_OPTION_FAIL_ON_CLUSTER_CHANGE: u8 = 0x08;

/// Encode the 8-byte frame header.
pub(crate) fn proto_header(msg_type: u8, size: usize) -> u64 {
    (u64::from(PROTO_VERSION) << 56) | (u64::from(msg_type) << 48) | size as u64
}

/// Split a frame header into (version, type, payload size).
pub(crate) fn split_proto_header(header: u64) -> (u8, u8, u64) {
    (
        (header >> 56) as u8,
        (header >> 48) as u8,
        header & 0x0000_FFFF_FFFF_FFFF,
    )
}

/// The fixed header of one record message within a frame.
#[derive(Debug)]
pub(crate) struct MsgHeader {
    pub info3: u8,
    pub result_code: u8,
    pub generation: u32,
    pub record_ttl: u32,
    pub n_fields: u16,
    pub n_ops: u16,
}

impl MsgHeader {
    pub(crate) fn read(buf: &mut &[u8]) -> Result<MsgHeader, Error> {
        if buf.remaining() < MSG_HEADER_SIZE {
            return Err(Error::ParseError(format!(
                "message header truncated: {} bytes",
                buf.remaining()
            )));
        }
        let header_sz = buf.get_u8();
        if usize::from(header_sz) != MSG_HEADER_SIZE {
            return Err(Error::ParseError(format!(
                "unexpected message header size {}",
                header_sz
            )));
        }
        let _info1 = buf.get_u8();
        let _info2 = buf.get_u8();
        let info3 = buf.get_u8();
        let _unused = buf.get_u8();
        let result_code = buf.get_u8();
        let generation = buf.get_u32();
        let record_ttl = buf.get_u32();
        let _transaction_ttl = buf.get_u32();
        let n_fields = buf.get_u16();
        let n_ops = buf.get_u16();

        Ok(MsgHeader {
            info3,
            result_code,
            generation,
            record_ttl,
            n_fields,
            n_ops,
        })
    }
}

/// A typed bin value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Nil,
    Int(i64),
    Float(f64),
    Str(String),
    Blob(Vec<u8>),
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
    /// A particle the client did not decode: an unknown particle type, or
    /// a list/map the scan did not ask to deserialize. The particle type
    /// byte is kept alongside the raw bytes.
    Raw(u8, Vec<u8>),
}

/// A named value attached to a record.
#[derive(Clone, Debug, PartialEq)]
pub struct Bin {
    pub name: String,
    pub value: Value,
}

/// The key fields the server echoes back with each scanned record.
#[derive(Clone, Debug, Default)]
pub struct RecordKey {
    pub namespace: String,
    pub set: String,
    pub digest: Option<Digest>,
    pub user_key: Option<Value>,
}

/// One record streamed back by a scan.
#[derive(Clone, Debug)]
pub struct Record {
    pub key: RecordKey,
    pub generation: u32,
    /// Raw server void-time. Zero means the record never expires.
    pub expiration: u32,
    pub bins: Vec<Bin>,
}

/// Parse the fields and bin operations following a message header.
pub(crate) fn parse_record(
    buf: &mut &[u8],
    header: &MsgHeader,
    deserialize_list_map: bool,
) -> Result<Record, Error> {
    let mut key = RecordKey::default();

    for _ in 0..header.n_fields {
        if buf.remaining() < 5 {
            return Err(Error::ParseError("field header truncated".into()));
        }
        let field_sz = buf.get_u32() as usize;
        if field_sz == 0 || buf.remaining() < field_sz {
            return Err(Error::ParseError("field data truncated".into()));
        }
        let field_type = buf.get_u8();
        let data_len = field_sz - 1;
        match field_type {
            FIELD_NAMESPACE => key.namespace = take_string(buf, data_len)?,
            FIELD_SETNAME => key.set = take_string(buf, data_len)?,
            FIELD_DIGEST => {
                if data_len != 20 {
                    return Err(Error::ParseError(format!(
                        "digest field of {} bytes",
                        data_len
                    )));
                }
                let mut d = [0u8; 20];
                buf.copy_to_slice(&mut d);
                key.digest = Some(Digest(d));
            }
            FIELD_KEY => {
                if data_len < 1 {
                    return Err(Error::ParseError("empty key field".into()));
                }
                let ptype = buf.get_u8();
                let data = take_bytes(buf, data_len - 1);
                key.user_key = Some(decode_particle(ptype, data, false)?);
            }
            _ => buf.advance(data_len),
        }
    }

    let mut bins = Vec::with_capacity(usize::from(header.n_ops));

    for _ in 0..header.n_ops {
        if buf.remaining() < 8 {
            return Err(Error::ParseError("bin op truncated".into()));
        }
        let op_sz = buf.get_u32() as usize;
        if op_sz < 4 || buf.remaining() < op_sz {
            return Err(Error::ParseError("bin op data truncated".into()));
        }
        let _op = buf.get_u8();
        let ptype = buf.get_u8();
        let _version = buf.get_u8();
        let name_len = usize::from(buf.get_u8());
        if op_sz < 4 + name_len {
            return Err(Error::ParseError("bin name overruns op".into()));
        }
        let name = take_string(buf, name_len)?;
        let data = take_bytes(buf, op_sz - 4 - name_len);
        let value = decode_particle(ptype, data, deserialize_list_map)?;
        bins.push(Bin { name, value });
    }

    Ok(Record {
        key,
        generation: header.generation,
        expiration: header.record_ttl,
        bins,
    })
}

fn take_bytes(buf: &mut &[u8], len: usize) -> Vec<u8> {
    let mut v = vec![0u8; len];
    buf.copy_to_slice(&mut v);
    v
}

fn take_string(buf: &mut &[u8], len: usize) -> Result<String, Error> {
    String::from_utf8(take_bytes(buf, len))
        .map_err(|_| Error::ParseError("invalid UTF-8 in message".into()))
}

fn decode_particle(ptype: u8, data: Vec<u8>, deserialize: bool) -> Result<Value, Error> {
    match ptype {
        PARTICLE_NULL => Ok(Value::Nil),
        PARTICLE_INTEGER => {
            if data.len() != 8 {
                return Err(Error::ParseError(format!(
                    "integer particle of {} bytes",
                    data.len()
                )));
            }
            let mut b = [0u8; 8];
            b.copy_from_slice(&data);
            Ok(Value::Int(i64::from_be_bytes(b)))
        }
        PARTICLE_DOUBLE => {
            if data.len() != 8 {
                return Err(Error::ParseError(format!(
                    "double particle of {} bytes",
                    data.len()
                )));
            }
            let mut b = [0u8; 8];
            b.copy_from_slice(&data);
            Ok(Value::Float(f64::from_bits(u64::from_be_bytes(b))))
        }
        PARTICLE_STRING => String::from_utf8(data)
            .map(Value::Str)
            .map_err(|_| Error::ParseError("invalid UTF-8 in string particle".into())),
        PARTICLE_BLOB => Ok(Value::Blob(data)),
        PARTICLE_LIST | PARTICLE_MAP if deserialize => {
            let mut rd = &data[..];
            let v = rmpv::decode::read_value(&mut rd)
                .map_err(|e| Error::ParseError(format!("msgpack particle: {}", e)))?;
            Ok(from_msgpack(v))
        }
        _ => Ok(Value::Raw(ptype, data)),
    }
}

fn from_msgpack(v: rmpv::Value) -> Value {
    match v {
        rmpv::Value::Nil => Value::Nil,
        rmpv::Value::Boolean(b) => Value::Int(i64::from(b)),
        rmpv::Value::Integer(i) => match i.as_i64() {
            Some(n) => Value::Int(n),
            None => Value::Float(i.as_f64().unwrap_or(0.0)),
        },
        rmpv::Value::F32(f) => Value::Float(f64::from(f)),
        rmpv::Value::F64(f) => Value::Float(f),
        rmpv::Value::String(s) => match s.into_str() {
            Some(s) => Value::Str(s),
            None => Value::Nil,
        },
        rmpv::Value::Binary(b) => Value::Blob(b),
        rmpv::Value::Array(a) => Value::List(a.into_iter().map(from_msgpack).collect()),
        rmpv::Value::Map(m) => Value::Map(
            m.into_iter()
                .map(|(k, v)| (from_msgpack(k), from_msgpack(v)))
                .collect(),
        ),
        rmpv::Value::Ext(_, b) => Value::Blob(b),
    }
}

/// Build the complete scan command frame. The buffer is immutable once
/// built and safe to share across workers; scans carry no retries, so
/// nothing in it is ever rewritten.
pub(crate) fn write_scan_command(
    policy: &ScanPolicy,
    scan: &Scan,
    task_id: u64,
) -> Result<Vec<u8>, Error> {
    if scan.namespace.is_empty() {
        return Err(Error::InvalidParameter("scan namespace is empty".into()));
    }
    if scan.percent == 0 || scan.percent > 100 {
        return Err(Error::InvalidParameter(format!(
            "scan percent {} out of range",
            scan.percent
        )));
    }
    for name in &scan.select {
        if name.len() > 255 {
            return Err(Error::InvalidParameter(format!(
                "bin name of {} bytes",
                name.len()
            )));
        }
    }

    let mut n_fields: u16 = 3; // namespace, scan options, task id
    if scan.set.is_some() {
        n_fields += 1;
    }
    if scan.udf.is_some() {
        n_fields += 4;
    }

    let mut body: Vec<u8> = Vec::with_capacity(256);

    // 22-byte message header.
    let (info1, info2) = if scan.udf.is_some() {
        // Background: read and write attributes, exists-ignore,
        // gen-ignore, commit-all and consistency-one all encode to zero
        // bits in this protocol revision.
        (INFO1_READ, INFO2_WRITE)
    } else if scan.no_bins {
        (INFO1_READ | INFO1_GET_NOBINDATA, 0)
    } else {
        (INFO1_READ, 0)
    };
    let n_ops = if scan.udf.is_some() {
        0
    } else {
        scan.select.len() as u16
    };

    body.put_u8(MSG_HEADER_SIZE as u8);
    body.put_u8(info1);
    body.put_u8(info2);
    body.put_u8(0); // info3
    body.put_u8(0); // unused
    body.put_u8(RESULT_OK);
    body.put_u32(0); // generation
    body.put_u32(0); // record ttl
    body.put_u32(policy.timeout_ms);
    body.put_u16(n_fields);
    body.put_u16(n_ops);

    put_field_str(&mut body, FIELD_NAMESPACE, &scan.namespace);
    if let Some(set) = &scan.set {
        put_field_str(&mut body, FIELD_SETNAME, set);
    }

    let mut options = (scan.priority as u8) << 4;
    if policy.fail_on_cluster_change {
        options |= SCAN_OPTION_FAIL_ON_CLUSTER_CHANGE;
    }
    put_field_header(&mut body, FIELD_SCAN_OPTIONS, 2);
    body.put_u8(options);
    body.put_u8(scan.percent);

    put_field_header(&mut body, FIELD_TASK_ID, 8);
    body.put_u64(task_id);

    if let Some(udf) = &scan.udf {
        put_field_header(&mut body, FIELD_UDF_OP, 1);
        body.put_u8(UDF_OP_BACKGROUND);
        put_field_str(&mut body, FIELD_UDF_PACKAGE_NAME, &udf.module);
        put_field_str(&mut body, FIELD_UDF_FUNCTION, &udf.function);
        put_field_bytes(&mut body, FIELD_UDF_ARGLIST, &udf.arglist);
    } else {
        for name in &scan.select {
            put_bin_name(&mut body, name);
        }
    }

    let mut cmd = Vec::with_capacity(PROTO_HEADER_SIZE + body.len());
    cmd.put_u64(proto_header(PROTO_TYPE_MESSAGE, body.len()));
    cmd.extend_from_slice(&body);
    Ok(cmd)
}

fn put_field_header(buf: &mut Vec<u8>, ftype: u8, data_len: usize) {
    buf.put_u32(data_len as u32 + 1);
    buf.put_u8(ftype);
}

fn put_field_str(buf: &mut Vec<u8>, ftype: u8, s: &str) {
    put_field_header(buf, ftype, s.len());
    buf.put_slice(s.as_bytes());
}

fn put_field_bytes(buf: &mut Vec<u8>, ftype: u8, data: &[u8]) {
    put_field_header(buf, ftype, data.len());
    buf.put_slice(data);
}

fn put_bin_name(buf: &mut Vec<u8>, name: &str) {
    buf.put_u32(name.len() as u32 + 4);
    buf.put_u8(OPERATOR_READ);
    buf.put_u8(0); // particle type
    buf.put_u8(0); // version
    buf.put_u8(name.len() as u8);
    buf.put_slice(name.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::{ScanPriority, ScanUdf};

    fn base_scan() -> Scan {
        Scan::new("test")
    }

    #[test]
    fn proto_header_round_trip() {
        let h = proto_header(PROTO_TYPE_MESSAGE, 1234);
        assert_eq!(split_proto_header(h), (2, 3, 1234));
    }

    #[test]
    fn scan_command_frame_declares_body_size() {
        let cmd =
            write_scan_command(&ScanPolicy::default(), &base_scan(), 99).unwrap();
        let mut buf = &cmd[..];
        let (version, msg_type, size) = split_proto_header(buf.get_u64());
        assert_eq!(version, PROTO_VERSION);
        assert_eq!(msg_type, PROTO_TYPE_MESSAGE);
        assert_eq!(size as usize, cmd.len() - PROTO_HEADER_SIZE);
    }

    #[test]
    fn foreground_scan_is_read_only() {
        let mut scan = base_scan();
        scan.set = Some("demo".into());
        scan.priority = ScanPriority::High;
        let cmd = write_scan_command(&ScanPolicy::default(), &scan, 1).unwrap();
        let body = &cmd[PROTO_HEADER_SIZE..];
        assert_eq!(body[1], INFO1_READ);
        assert_eq!(body[2], 0);
        // namespace, set, options, task id
        assert_eq!(u16::from_be_bytes([body[18], body[19]]), 4);
    }

    #[test]
    fn no_bins_sets_nobindata() {
        let mut scan = base_scan();
        scan.no_bins = true;
        let cmd = write_scan_command(&ScanPolicy::default(), &scan, 1).unwrap();
        let body = &cmd[PROTO_HEADER_SIZE..];
        assert_eq!(body[1], INFO1_READ | INFO1_GET_NOBINDATA);
    }

    #[test]
    fn background_scan_sets_write_attributes() {
        let mut scan = base_scan();
        scan.udf = Some(ScanUdf {
            module: "mod".into(),
            function: "f".into(),
            arglist: vec![0x90],
        });
        let cmd = write_scan_command(&ScanPolicy::default(), &scan, 1).unwrap();
        let body = &cmd[PROTO_HEADER_SIZE..];
        assert_eq!(body[1], INFO1_READ);
        assert_eq!(body[2], INFO2_WRITE);
        // namespace, options, task id, udf-op, package, function, arglist
        assert_eq!(u16::from_be_bytes([body[18], body[19]]), 7);
    }

    #[test]
    fn scan_options_carry_priority_and_percent() {
        let mut scan = base_scan();
        scan.priority = ScanPriority::Medium;
        scan.percent = 40;
        let policy = ScanPolicy {
            fail_on_cluster_change: true,
            ..ScanPolicy::default()
        };
        let cmd = write_scan_command(&policy, &scan, 1).unwrap();
        let expected = (ScanPriority::Medium as u8) << 4
            | SCAN_OPTION_FAIL_ON_CLUSTER_CHANGE;
        // The options field is the second field: skip the header and the
        // namespace field.
        let ns_field = 4 + 1 + scan.namespace.len();
        let options_at = PROTO_HEADER_SIZE + MSG_HEADER_SIZE + ns_field + 5;
        assert_eq!(cmd[options_at], expected);
        assert_eq!(cmd[options_at + 1], 40);
    }

    #[test]
    fn percent_out_of_range_is_rejected() {
        let mut scan = base_scan();
        scan.percent = 101;
        assert!(matches!(
            write_scan_command(&ScanPolicy::default(), &scan, 1),
            Err(Error::InvalidParameter(_))
        ));
    }

    fn put_test_record(buf: &mut Vec<u8>, last: bool, result_code: u8, bins: &[(&str, i64)]) {
        buf.put_u8(MSG_HEADER_SIZE as u8);
        buf.put_u8(INFO1_READ);
        buf.put_u8(0);
        buf.put_u8(if last { INFO3_LAST } else { 0 });
        buf.put_u8(0);
        buf.put_u8(result_code);
        buf.put_u32(3); // generation
        buf.put_u32(0); // ttl
        buf.put_u32(0);
        if last || result_code != RESULT_OK {
            buf.put_u16(0);
            buf.put_u16(0);
            return;
        }
        buf.put_u16(2); // namespace + digest
        buf.put_u16(bins.len() as u16);
        put_field_str(buf, FIELD_NAMESPACE, "test");
        put_field_header(buf, FIELD_DIGEST, 20);
        buf.put_slice(&[7u8; 20]);
        for (name, val) in bins {
            buf.put_u32(name.len() as u32 + 4 + 8);
            buf.put_u8(OPERATOR_READ);
            buf.put_u8(PARTICLE_INTEGER);
            buf.put_u8(0);
            buf.put_u8(name.len() as u8);
            buf.put_slice(name.as_bytes());
            buf.put_u64(*val as u64);
        }
    }

    #[test]
    fn record_message_parses_key_and_bins() {
        let mut payload = Vec::new();
        put_test_record(&mut payload, false, RESULT_OK, &[("a", 42), ("b", -1)]);

        let mut buf = &payload[..];
        let header = MsgHeader::read(&mut buf).unwrap();
        assert_eq!(header.result_code, RESULT_OK);
        assert_eq!(header.generation, 3);
        let rec = parse_record(&mut buf, &header, false).unwrap();
        assert_eq!(rec.key.namespace, "test");
        assert_eq!(rec.key.digest.unwrap().0, [7u8; 20]);
        assert_eq!(rec.bins.len(), 2);
        assert_eq!(rec.bins[0], Bin { name: "a".into(), value: Value::Int(42) });
        assert_eq!(rec.bins[1], Bin { name: "b".into(), value: Value::Int(-1) });
        assert!(!buf.has_remaining());
    }

    #[test]
    fn truncated_message_is_a_parse_error() {
        let mut payload = Vec::new();
        put_test_record(&mut payload, false, RESULT_OK, &[("a", 42)]);
        payload.truncate(payload.len() - 3);

        let mut buf = &payload[..];
        let header = MsgHeader::read(&mut buf).unwrap();
        assert!(matches!(
            parse_record(&mut buf, &header, false),
            Err(Error::ParseError(_))
        ));
    }

    #[test]
    fn msgpack_list_decodes_when_asked() {
        // [1, "x"]
        let data = vec![0x92, 0x01, 0xa1, b'x'];
        let v = decode_particle(PARTICLE_LIST, data.clone(), true).unwrap();
        assert_eq!(v, Value::List(vec![Value::Int(1), Value::Str("x".into())]));
        let raw = decode_particle(PARTICLE_LIST, data.clone(), false).unwrap();
        assert_eq!(raw, Value::Raw(PARTICLE_LIST, data));
    }
}
