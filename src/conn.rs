/*!
 * Per-Connection State
 *
 * A `Connection` owns the bytes received so far on one client socket. It is
 * independent of the transport: the network loop hands it each chunk it
 * reads and writes out whatever replies it produces. Commands are executed
 * and answered strictly in arrival order.
 */

use crate::dispatch::dispatch;
use crate::protocol::{parse_command, write_error, write_value};
use crate::storage::Store;
use bytes::{Buf, BytesMut};
use std::sync::Arc;
use std::time::Instant;

/// Initial capacity of the accumulation buffer
pub const READ_BUF: usize = 4096;

/// Reply sent before closing on an unframeable request
pub const PROTOCOL_ERROR: &str = "ERR protocol error";

/// What the transport should do after a chunk has been processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading
    Continue,
    /// Flush pending output, then close the socket
    Close,
}

/// Decoder state for one client
pub struct Connection {
    store: Arc<Store>,
    rbuf: BytesMut,
    closed: bool,
}

impl Connection {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            rbuf: BytesMut::with_capacity(READ_BUF),
            closed: false,
        }
    }

    /// Feed one received chunk and append every resulting reply to `out`
    ///
    /// All complete commands in the buffer are run, so a single chunk may
    /// yield several replies and a partial command yields none until the
    /// rest arrives. After a protocol error the connection is finished and
    /// further input is ignored.
    pub fn process(&mut self, chunk: &[u8], out: &mut BytesMut) -> Flow {
        if self.closed {
            return Flow::Close;
        }
        self.rbuf.extend_from_slice(chunk);

        loop {
            match parse_command(&self.rbuf[..]) {
                Ok(Some((consumed, Some(cmd)))) => {
                    log::trace!("cmd {:?}", String::from_utf8_lossy(cmd.name()));
                    let reply = dispatch(&cmd, &self.store, Instant::now());
                    write_value(&reply, out);
                    self.rbuf.advance(consumed);
                }
                // Empty or null array: nothing to run, no reply
                Ok(Some((consumed, None))) => self.rbuf.advance(consumed),
                Ok(None) => return Flow::Continue,
                Err(e) => {
                    log::debug!("protocol error: {}", e);
                    write_error(PROTOCOL_ERROR, out);
                    self.closed = true;
                    self.rbuf.clear();
                    return Flow::Close;
                }
            }
        }
    }

    /// Bytes received but not yet part of a complete command
    pub fn pending(&self) -> usize {
        self.rbuf.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
