//! The two MQTT 3.1.1 packets the disconnect handshake needs: an
//! outgoing CONNECT and the broker's CONNACK. Nothing else of the
//! protocol is spoken on this control channel.

use std::io;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

pub const CONNECT_TYPE: u8 = 0x10;
pub const CONNACK_TYPE: u8 = 0x20;
pub const DISCONNECT_TYPE: u8 = 0xE0;

/// CONNACK return code for an accepted connection.
pub const ACCEPTED: u8 = 0x00;

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4;

const FLAG_CLEAN_SESSION: u8 = 0x02;
const FLAG_PASSWORD: u8 = 0x40;
const FLAG_USERNAME: u8 = 0x80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub return_code: u8,
}

pub fn encode_connect(connect: &Connect) -> BytesMut {
    let mut payload = BytesMut::new();
    put_string(&mut payload, &connect.client_id);

    let mut flags = 0u8;
    if connect.clean_session {
        flags |= FLAG_CLEAN_SESSION;
    }
    if let Some(username) = &connect.username {
        flags |= FLAG_USERNAME;
        put_string(&mut payload, username);
        // the password flag is only valid together with a username
        if let Some(password) = &connect.password {
            flags |= FLAG_PASSWORD;
            put_string(&mut payload, password);
        }
    }

    let mut variable = BytesMut::new();
    put_string(&mut variable, PROTOCOL_NAME);
    variable.put_u8(PROTOCOL_LEVEL);
    variable.put_u8(flags);
    variable.put_u16(connect.keep_alive_secs);

    let remaining = variable.len() + payload.len();
    let mut packet = BytesMut::with_capacity(remaining + 5);
    packet.put_u8(CONNECT_TYPE);
    put_remaining_length(&mut packet, remaining);
    packet.extend_from_slice(&variable);
    packet.extend_from_slice(&payload);
    packet
}

pub fn encode_disconnect() -> [u8; 2] {
    [DISCONNECT_TYPE, 0]
}

/// Reads a CONNACK off the stream, rejecting any other packet type.
pub async fn read_connack<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<ConnAck> {
    let first = stream.read_u8().await?;
    if first & 0xF0 != CONNACK_TYPE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected CONNACK, got packet type {first:#04x}"),
        ));
    }
    let remaining = read_remaining_length(stream).await?;
    if remaining < 2 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "CONNACK is too short",
        ));
    }
    let mut body = vec![0u8; remaining];
    stream.read_exact(&mut body).await?;
    Ok(ConnAck {
        session_present: body[0] & 0x01 == 1,
        return_code: body[1],
    })
}

/// Reads and decodes a CONNECT packet. Used by the in-process broker
/// the tests run against.
pub async fn read_connect<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<Connect> {
    let first = stream.read_u8().await?;
    if first & 0xF0 != CONNECT_TYPE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected CONNECT, got packet type {first:#04x}"),
        ));
    }
    let remaining = read_remaining_length(stream).await?;
    let mut body = vec![0u8; remaining];
    stream.read_exact(&mut body).await?;

    let mut cursor = Cursor::new(&body);
    let protocol = cursor.take_string()?;
    if protocol != PROTOCOL_NAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected protocol name {protocol}"),
        ));
    }
    let _level = cursor.take_u8()?;
    let flags = cursor.take_u8()?;
    let keep_alive_secs = cursor.take_u16()?;
    let client_id = cursor.take_string()?;
    let username = if flags & FLAG_USERNAME != 0 {
        Some(cursor.take_string()?)
    } else {
        None
    };
    let password = if flags & FLAG_PASSWORD != 0 {
        Some(cursor.take_string()?)
    } else {
        None
    };
    Ok(Connect {
        client_id,
        clean_session: flags & FLAG_CLEAN_SESSION != 0,
        username,
        password,
        keep_alive_secs,
    })
}

pub fn encode_connack(ack: &ConnAck) -> [u8; 4] {
    [
        CONNACK_TYPE,
        2,
        if ack.session_present { 1 } else { 0 },
        ack.return_code,
    ]
}

fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u16(value.len() as u16);
    buf.extend_from_slice(value.as_bytes());
}

async fn read_remaining_length<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<usize> {
    let mut multiplier: usize = 1;
    let mut value: usize = 0;
    for _ in 0..4 {
        let byte = stream.read_u8().await?;
        value += (byte & 0x7F) as usize * multiplier;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        multiplier *= 128;
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "remaining length is malformed",
    ))
}

fn put_remaining_length(buf: &mut BytesMut, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take_u8(&mut self) -> io::Result<u8> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "packet truncated"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn take_u16(&mut self) -> io::Result<u16> {
        let high = self.take_u8()?;
        let low = self.take_u8()?;
        Ok(u16::from_be_bytes([high, low]))
    }

    fn take_string(&mut self) -> io::Result<String> {
        let len = self.take_u16()? as usize;
        let end = self.pos + len;
        let bytes = self
            .data
            .get(self.pos..end)
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "packet truncated"))?;
        self.pos = end;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "string is not utf-8"))
    }
}
