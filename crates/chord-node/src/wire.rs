//! Line protocol shared by the UDP routing plane and the TCP data plane.
//!
//! Every message is one ASCII line of space-separated tokens. Binary
//! payloads travel base64-encoded; hashes are 40 lowercase hex digits;
//! addresses are `HOST:PORT`.

use crate::id::Id;
use crate::id::ParseIdError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("unknown verb `{0}`")]
    UnknownVerb(String),
    #[error("wrong number of tokens for `{0}`")]
    Arity(String),
    #[error("malformed id token")]
    BadId(#[from] ParseIdError),
    #[error("malformed base64 payload")]
    BadPayload(#[from] base64::DecodeError),
}

/// A datagram exchanged between peers on the routing plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// `origin` wants to know who is responsible for `hash`.
    Find { hash: Id, origin: String, trans: String },
    /// `owner` is responsible for the requested `hash`.
    Found { hash: Id, owner: String, trans: String },
    /// `from` wants our predecessor.
    Getp { from: String },
    /// Reply to `GETP`: my predecessor is `prev`.
    Pred { prev: String },
    /// `from` suggests itself as our predecessor.
    Notify { from: String },
    /// Ring roll call started by `origin`, gossiped successor to successor.
    Show { origin: String, trans: String },
    /// Direct reply to the roll-call originator.
    Peer { from: String, trans: String },
    Ping { from: String },
    Pong { from: String },
}

impl Packet {
    pub fn parse(line: &str) -> Result<Packet, ParseError> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let tokens: Vec<&str> = line.split(' ').collect();
        match tokens.as_slice() {
            ["FIND", hash, origin, trans] => Ok(Packet::Find {
                hash: hash.parse()?,
                origin: (*origin).to_string(),
                trans: (*trans).to_string(),
            }),
            ["FOUND", hash, owner, trans] => Ok(Packet::Found {
                hash: hash.parse()?,
                owner: (*owner).to_string(),
                trans: (*trans).to_string(),
            }),
            ["GETP", from] => Ok(Packet::Getp { from: (*from).to_string() }),
            ["PRED", prev] => Ok(Packet::Pred { prev: (*prev).to_string() }),
            ["NOTIFY", from] => Ok(Packet::Notify { from: (*from).to_string() }),
            ["SHOW", origin, trans] => Ok(Packet::Show {
                origin: (*origin).to_string(),
                trans: (*trans).to_string(),
            }),
            ["PEER", from, trans] => Ok(Packet::Peer {
                from: (*from).to_string(),
                trans: (*trans).to_string(),
            }),
            ["PING", from] => Ok(Packet::Ping { from: (*from).to_string() }),
            ["PONG", from] => Ok(Packet::Pong { from: (*from).to_string() }),
            [verb, ..]
                if matches!(
                    *verb,
                    "FIND" | "FOUND" | "GETP" | "PRED" | "NOTIFY" | "SHOW" | "PEER" | "PING"
                        | "PONG"
                ) =>
            {
                Err(ParseError::Arity((*verb).to_string()))
            }
            [verb, ..] => Err(ParseError::UnknownVerb((*verb).to_string())),
            [] => Err(ParseError::UnknownVerb(String::new())),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Packet::Find { hash, origin, trans } => format!("FIND {hash} {origin} {trans}"),
            Packet::Found { hash, owner, trans } => format!("FOUND {hash} {owner} {trans}"),
            Packet::Getp { from } => format!("GETP {from}"),
            Packet::Pred { prev } => format!("PRED {prev}"),
            Packet::Notify { from } => format!("NOTIFY {from}"),
            Packet::Show { origin, trans } => format!("SHOW {origin} {trans}"),
            Packet::Peer { from, trans } => format!("PEER {from} {trans}"),
            Packet::Ping { from } => format!("PING {from}"),
            Packet::Pong { from } => format!("PONG {from}"),
        }
    }
}

/// A line on a stream socket: peer-to-peer data transfer or the operator
/// protocol. Connections carry one operation and are closed by the
/// responder when it is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMsg {
    /// Fetch the item stored under `hash`.
    Get { hash: Id, trans: String },
    /// Item payload reply to `GET`.
    Data { payload: Vec<u8>, trans: String },
    /// Error reply, e.g. `data.not.found`.
    Error { reason: String, trans: String },
    /// Store an item; the responder derives the hash itself.
    Put { payload: Vec<u8>, trans: String },
    /// Store acknowledgement (`OK` on the wire).
    StoreOk { hash: Id, trans: String },
    /// Hand back every item in `(low, high]` by ring distance.
    Retr { low: Id, high: Id },
    /// One item pushed in response to `RETR`.
    Xfer { hash: Id, payload: Vec<u8> },
    ClientGet { hash: Id },
    ClientPut { payload: Vec<u8> },
    ClientShow,
    ClientData { payload: Vec<u8> },
    ClientError { reason: String },
    ClientOk { hash: Id },
    ClientPeer { hash: Id, addr: String },
}

impl StreamMsg {
    pub fn parse(line: &str) -> Result<StreamMsg, ParseError> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let tokens: Vec<&str> = line.split(' ').collect();
        match tokens.as_slice() {
            ["GET", hash, trans] => Ok(StreamMsg::Get {
                hash: hash.parse()?,
                trans: (*trans).to_string(),
            }),
            ["DATA", payload, trans] => Ok(StreamMsg::Data {
                payload: BASE64.decode(payload)?,
                trans: (*trans).to_string(),
            }),
            ["ERROR", reason, trans] => Ok(StreamMsg::Error {
                reason: (*reason).to_string(),
                trans: (*trans).to_string(),
            }),
            ["PUT", payload, trans] => Ok(StreamMsg::Put {
                payload: BASE64.decode(payload)?,
                trans: (*trans).to_string(),
            }),
            ["OK", hash, trans] => Ok(StreamMsg::StoreOk {
                hash: hash.parse()?,
                trans: (*trans).to_string(),
            }),
            ["RETR", low, high] => Ok(StreamMsg::Retr {
                low: low.parse()?,
                high: high.parse()?,
            }),
            ["XFER", hash, payload] => Ok(StreamMsg::Xfer {
                hash: hash.parse()?,
                payload: BASE64.decode(payload)?,
            }),
            ["CGET", hash] => Ok(StreamMsg::ClientGet { hash: hash.parse()? }),
            ["CPUT", payload] => Ok(StreamMsg::ClientPut { payload: BASE64.decode(payload)? }),
            ["CSHOW"] => Ok(StreamMsg::ClientShow),
            ["CDATA", payload] => Ok(StreamMsg::ClientData { payload: BASE64.decode(payload)? }),
            ["CERROR", reason] => Ok(StreamMsg::ClientError { reason: (*reason).to_string() }),
            ["COK", hash] => Ok(StreamMsg::ClientOk { hash: hash.parse()? }),
            ["CPEER", hash, addr] => Ok(StreamMsg::ClientPeer {
                hash: hash.parse()?,
                addr: (*addr).to_string(),
            }),
            [verb, ..]
                if matches!(
                    *verb,
                    "GET" | "DATA" | "ERROR" | "PUT" | "OK" | "RETR" | "XFER" | "CGET" | "CPUT"
                        | "CSHOW" | "CDATA" | "CERROR" | "COK" | "CPEER"
                ) =>
            {
                Err(ParseError::Arity((*verb).to_string()))
            }
            [verb, ..] => Err(ParseError::UnknownVerb((*verb).to_string())),
            [] => Err(ParseError::UnknownVerb(String::new())),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            StreamMsg::Get { hash, trans } => format!("GET {hash} {trans}"),
            StreamMsg::Data { payload, trans } => {
                format!("DATA {} {trans}", BASE64.encode(payload))
            }
            StreamMsg::Error { reason, trans } => format!("ERROR {reason} {trans}"),
            StreamMsg::Put { payload, trans } => {
                format!("PUT {} {trans}", BASE64.encode(payload))
            }
            StreamMsg::StoreOk { hash, trans } => format!("OK {hash} {trans}"),
            StreamMsg::Retr { low, high } => format!("RETR {low} {high}"),
            StreamMsg::Xfer { hash, payload } => {
                format!("XFER {hash} {}", BASE64.encode(payload))
            }
            StreamMsg::ClientGet { hash } => format!("CGET {hash}"),
            StreamMsg::ClientPut { payload } => format!("CPUT {}", BASE64.encode(payload)),
            StreamMsg::ClientShow => "CSHOW".to_string(),
            StreamMsg::ClientData { payload } => format!("CDATA {}", BASE64.encode(payload)),
            StreamMsg::ClientError { reason } => format!("CERROR {reason}"),
            StreamMsg::ClientOk { hash } => format!("COK {hash}"),
            StreamMsg::ClientPeer { hash, addr } => format!("CPEER {hash} {addr}"),
        }
    }

    /// Wire verb, for logging.
    pub fn verb(&self) -> &'static str {
        match self {
            StreamMsg::Get { .. } => "GET",
            StreamMsg::Data { .. } => "DATA",
            StreamMsg::Error { .. } => "ERROR",
            StreamMsg::Put { .. } => "PUT",
            StreamMsg::StoreOk { .. } => "OK",
            StreamMsg::Retr { .. } => "RETR",
            StreamMsg::Xfer { .. } => "XFER",
            StreamMsg::ClientGet { .. } => "CGET",
            StreamMsg::ClientPut { .. } => "CPUT",
            StreamMsg::ClientShow => "CSHOW",
            StreamMsg::ClientData { .. } => "CDATA",
            StreamMsg::ClientError { .. } => "CERROR",
            StreamMsg::ClientOk { .. } => "COK",
            StreamMsg::ClientPeer { .. } => "CPEER",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_find_packet() {
        let packet =
            Packet::parse("FIND 3e9e9237d1e739a6bbd59275f551d88ed638da2e 127.0.0.1:4000 127.0.0.1:4000-7")
                .unwrap();
        assert_eq!(
            packet,
            Packet::Find {
                hash: "3e9e9237d1e739a6bbd59275f551d88ed638da2e".parse().unwrap(),
                origin: "127.0.0.1:4000".to_string(),
                trans: "127.0.0.1:4000-7".to_string(),
            }
        );
    }

    #[test]
    fn packet_encoding_round_trips() {
        let packets = [
            Packet::Notify { from: "127.0.0.1:4000".to_string() },
            Packet::Show {
                origin: "127.0.0.1:4000".to_string(),
                trans: "127.0.0.1:4000-0".to_string(),
            },
            Packet::Pong { from: "10.0.0.7:12001".to_string() },
        ];
        for packet in packets {
            assert_eq!(Packet::parse(&packet.encode()).unwrap(), packet);
        }
    }

    #[test]
    fn rejects_unknown_verbs_and_bad_arity() {
        assert!(matches!(Packet::parse("FROB 1 2"), Err(ParseError::UnknownVerb(_))));
        assert!(matches!(Packet::parse("PING"), Err(ParseError::Arity(_))));
        assert!(matches!(
            StreamMsg::parse("GET deadbeef"),
            Err(ParseError::Arity(_))
        ));
        assert!(matches!(StreamMsg::parse(""), Err(ParseError::UnknownVerb(_))));
    }

    #[test]
    fn decodes_base64_payloads() {
        let msg = StreamMsg::parse("CPUT aGVsbG8=").unwrap();
        assert_eq!(msg, StreamMsg::ClientPut { payload: b"hello".to_vec() });
        assert!(StreamMsg::parse("CPUT not*base64!").is_err());
    }

    #[test]
    fn data_reply_carries_payload_and_transaction() {
        let msg = StreamMsg::Data {
            payload: b"hello".to_vec(),
            trans: "127.0.0.1:4000-3".to_string(),
        };
        assert_eq!(msg.encode(), "DATA aGVsbG8= 127.0.0.1:4000-3");
    }

    #[test]
    fn tolerates_a_trailing_newline() {
        assert!(Packet::parse("PING 127.0.0.1:4000\n").is_ok());
    }
}
