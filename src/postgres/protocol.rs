//! Minimal frontend for the PostgreSQL wire protocol.
//!
//! tokio-postgres 0.7 cannot enter CopyBoth mode, which logical replication
//! needs, so replication connections speak the protocol directly. Message
//! encoding and authentication come from `postgres-protocol`; this module
//! only does framing and the handful of flows replication uses.

use bytes::{Buf, Bytes, BytesMut};
use postgres_protocol::authentication::sasl::{ChannelBinding, ScramSha256, SCRAM_SHA_256};
use postgres_protocol::authentication::md5_hash;
use postgres_protocol::message::frontend;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, trace};

use crate::{Error, Result};

const AUTH_OK: i32 = 0;
const AUTH_CLEARTEXT: i32 = 3;
const AUTH_MD5: i32 = 5;
const AUTH_SASL: i32 = 10;
const AUTH_SASL_CONTINUE: i32 = 11;
const AUTH_SASL_FINAL: i32 = 12;

#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub connect_timeout: Duration,
}

/// Result of a simple query, all values in text form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl QueryResult {
    pub fn get(&self, row: usize, column: &str) -> Option<&str> {
        let index = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(index)?.as_deref()
    }
}

pub struct WireConnection {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl WireConnection {
    /// Wraps a socket that is already past startup, for driving the
    /// streaming half against a scripted peer.
    #[cfg(test)]
    pub(crate) fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(8 * 1024),
            write_buf: BytesMut::with_capacity(1024),
        }
    }

    /// Opens a `replication=database` session and authenticates.
    pub async fn connect_replication(params: &ConnectParams) -> Result<Self> {
        let address = format!("{}:{}", params.host, params.port);
        let stream = tokio::time::timeout(params.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| Error::Timeout {
                message: format!("connecting to {}", address),
            })??;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            stream,
            read_buf: BytesMut::with_capacity(8 * 1024),
            write_buf: BytesMut::with_capacity(1024),
        };

        frontend::startup_message(
            [
                ("user", params.user.as_str()),
                ("database", params.database.as_str()),
                ("replication", "database"),
                ("application_name", "wikigraph-cdc"),
            ],
            &mut conn.write_buf,
        )?;
        conn.flush().await?;
        conn.authenticate(&params.user, &params.password).await?;
        conn.wait_ready().await?;

        info!(host = %params.host, database = %params.database, "Replication session established");
        Ok(conn)
    }

    async fn authenticate(&mut self, user: &str, password: &str) -> Result<()> {
        let mut scram: Option<ScramSha256> = None;

        loop {
            let (tag, mut body) = self.read_message().await?;
            match tag {
                b'R' => {}
                b'E' => return Err(parse_error_response(body)),
                other => {
                    return Err(Error::Protocol(format!(
                        "Unexpected message {:?} during authentication",
                        other as char
                    )))
                }
            }

            if body.remaining() < 4 {
                return Err(Error::Protocol("Truncated authentication request".to_string()));
            }
            match body.get_i32() {
                AUTH_OK => {
                    debug!("Authenticated");
                    return Ok(());
                }
                AUTH_CLEARTEXT => {
                    frontend::password_message(password.as_bytes(), &mut self.write_buf)?;
                }
                AUTH_MD5 => {
                    if body.remaining() < 4 {
                        return Err(Error::Protocol("Truncated MD5 salt".to_string()));
                    }
                    let mut salt = [0u8; 4];
                    body.copy_to_slice(&mut salt);
                    let hash = md5_hash(user.as_bytes(), password.as_bytes(), salt);
                    frontend::password_message(hash.as_bytes(), &mut self.write_buf)?;
                }
                AUTH_SASL => {
                    let mechanisms = read_cstrings(&mut body);
                    if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                        return Err(Error::Authentication(format!(
                            "No supported SASL mechanism in {:?}",
                            mechanisms
                        )));
                    }
                    let client = ScramSha256::new(password.as_bytes(), ChannelBinding::unsupported());
                    frontend::sasl_initial_response(SCRAM_SHA_256, client.message(), &mut self.write_buf)?;
                    scram = Some(client);
                }
                AUTH_SASL_CONTINUE => {
                    let client = scram
                        .as_mut()
                        .ok_or_else(|| Error::Authentication("SASL continue without start".to_string()))?;
                    client
                        .update(&body)
                        .map_err(|e| Error::Authentication(e.to_string()))?;
                    frontend::sasl_response(client.message(), &mut self.write_buf)?;
                }
                AUTH_SASL_FINAL => {
                    let client = scram
                        .as_mut()
                        .ok_or_else(|| Error::Authentication("SASL final without start".to_string()))?;
                    client
                        .finish(&body)
                        .map_err(|e| Error::Authentication(e.to_string()))?;
                    continue;
                }
                other => {
                    return Err(Error::Authentication(format!(
                        "Unsupported authentication method {}",
                        other
                    )))
                }
            }
            self.flush().await?;
        }
    }

    async fn wait_ready(&mut self) -> Result<()> {
        loop {
            let (tag, body) = self.read_message().await?;
            match tag {
                b'Z' => return Ok(()),
                b'E' => return Err(parse_error_response(body)),
                b'S' => {
                    let mut body = body;
                    let values = read_cstrings(&mut body);
                    if let [name, value, ..] = values.as_slice() {
                        trace!(parameter = %name, value = %value, "Server parameter");
                    }
                }
                b'K' | b'N' => {}
                other => trace!(tag = %(other as char), "Ignoring message before ready"),
            }
        }
    }

    /// Runs a replication command that returns rows or nothing.
    pub async fn simple_query(&mut self, sql: &str) -> Result<QueryResult> {
        debug!(sql, "Simple query");
        frontend::query(sql, &mut self.write_buf)?;
        self.flush().await?;

        let mut result = QueryResult::default();
        let mut failure = None;
        loop {
            let (tag, body) = self.read_message().await?;
            match tag {
                b'T' => result.columns = parse_row_description(body)?,
                b'D' => result.rows.push(parse_data_row(body)?),
                b'E' => failure = Some(parse_error_response(body)),
                b'Z' => break,
                _ => {}
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(result),
        }
    }

    /// Issues a command that switches the session into CopyBoth mode.
    pub async fn start_copy_both(&mut self, sql: &str) -> Result<()> {
        debug!(sql, "Starting CopyBoth");
        frontend::query(sql, &mut self.write_buf)?;
        self.flush().await?;

        loop {
            let (tag, body) = self.read_message().await?;
            match tag {
                b'W' => return Ok(()),
                b'E' => {
                    let err = parse_error_response(body);
                    // Drain to ReadyForQuery so the session stays usable.
                    self.wait_ready().await?;
                    return Err(err);
                }
                b'N' => {}
                other => trace!(tag = %(other as char), "Ignoring message before CopyBoth"),
            }
        }
    }

    /// Next CopyData payload. `None` means the server ended the copy.
    pub async fn recv_copy_data(&mut self) -> Result<Option<Bytes>> {
        loop {
            let (tag, body) = self.read_message().await?;
            match tag {
                b'd' => return Ok(Some(body)),
                b'c' => return Ok(None),
                b'E' => return Err(parse_error_response(body)),
                b'N' => {}
                other => trace!(tag = %(other as char), "Ignoring message in CopyBoth"),
            }
        }
    }

    pub async fn send_copy_data(&mut self, payload: &[u8]) -> Result<()> {
        frontend::CopyData::new(payload)?.write(&mut self.write_buf);
        self.flush().await
    }

    pub async fn terminate(&mut self) -> Result<()> {
        frontend::copy_done(&mut self.write_buf);
        frontend::terminate(&mut self.write_buf);
        self.flush().await?;
        self.stream.shutdown().await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if !self.write_buf.is_empty() {
            self.stream.write_all(&self.write_buf).await?;
            self.write_buf.clear();
        }
        Ok(())
    }

    /// Reads one backend message. Cancel-safe: partial frames stay buffered.
    async fn read_message(&mut self) -> Result<(u8, Bytes)> {
        loop {
            if let Some(frame) = split_frame(&mut self.read_buf)? {
                return Ok(frame);
            }
            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Err(Error::Connection("Server closed the connection".to_string()));
            }
        }
    }
}

/// Splits one `tag + i32 length + body` frame off the front of `buf`.
pub fn split_frame(buf: &mut BytesMut) -> Result<Option<(u8, Bytes)>> {
    if buf.len() < 5 {
        return Ok(None);
    }

    let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    let len = usize::try_from(len)
        .ok()
        .filter(|len| *len >= 4)
        .ok_or_else(|| Error::Protocol(format!("Invalid message length {}", len)))?;

    if buf.len() < len + 1 {
        buf.reserve(len + 1 - buf.len());
        return Ok(None);
    }

    let mut frame = buf.split_to(len + 1);
    let tag = frame[0];
    frame.advance(5);
    Ok(Some((tag, frame.freeze())))
}

fn read_cstrings(body: &mut Bytes) -> Vec<String> {
    let mut values = Vec::new();
    while let Some(end) = body.iter().position(|&b| b == 0) {
        if end == 0 {
            body.advance(1);
            break;
        }
        values.push(String::from_utf8_lossy(&body[..end]).into_owned());
        body.advance(end + 1);
    }
    values
}

/// ErrorResponse fields are `(code byte, cstring)` pairs ending with 0.
pub fn parse_error_response(mut body: Bytes) -> Error {
    let mut code = String::new();
    let mut message = String::new();

    while body.has_remaining() {
        let field = body.get_u8();
        if field == 0 {
            break;
        }
        let Some(end) = body.iter().position(|&b| b == 0) else {
            break;
        };
        let value = String::from_utf8_lossy(&body[..end]).into_owned();
        body.advance(end + 1);
        match field {
            b'C' => code = value,
            b'M' => message = value,
            _ => {}
        }
    }

    Error::PgServer { code, message }
}

fn parse_row_description(mut body: Bytes) -> Result<Vec<String>> {
    if body.remaining() < 2 {
        return Err(Error::Protocol("Truncated RowDescription".to_string()));
    }
    let count = body.get_i16();
    let mut columns = Vec::with_capacity(count.max(0) as usize);

    for _ in 0..count {
        let end = body
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::Protocol("Unterminated column name".to_string()))?;
        columns.push(String::from_utf8_lossy(&body[..end]).into_owned());
        body.advance(end + 1);
        // table oid, attnum, type oid, typlen, typmod, format
        if body.remaining() < 18 {
            return Err(Error::Protocol("Truncated RowDescription field".to_string()));
        }
        body.advance(18);
    }

    Ok(columns)
}

fn parse_data_row(mut body: Bytes) -> Result<Vec<Option<String>>> {
    if body.remaining() < 2 {
        return Err(Error::Protocol("Truncated DataRow".to_string()));
    }
    let count = body.get_i16();
    let mut values = Vec::with_capacity(count.max(0) as usize);

    for _ in 0..count {
        if body.remaining() < 4 {
            return Err(Error::Protocol("Truncated DataRow value".to_string()));
        }
        let len = body.get_i32();
        if len < 0 {
            values.push(None);
            continue;
        }
        let len = len as usize;
        if body.remaining() < len {
            return Err(Error::Protocol("Truncated DataRow value".to_string()));
        }
        values.push(Some(String::from_utf8_lossy(&body[..len]).into_owned()));
        body.advance(len);
    }

    Ok(values)
}
