//! Sends a few commands to a running server and prints each reply.
//!
//! `cargo run --example client [addr]`

use bytes::BytesMut;
use ferrokv::{read_frame, Value};
use std::io::{self, Write};
use std::net::TcpStream;
use std::thread::sleep;
use std::time::Duration;

fn roundtrip(s: &mut TcpStream, buf: &mut BytesMut, cmd: &[u8]) -> io::Result<()> {
    s.write_all(cmd)?;
    let reply = read_frame(s, buf)?;
    print!("{}", String::from_utf8_lossy(&Value::to_bytes(&reply)));
    Ok(())
}

fn main() -> io::Result<()> {
    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| ferrokv::DEFAULT_ADDR.to_string());
    let mut s = TcpStream::connect(addr)?;
    let mut buf = BytesMut::new();

    roundtrip(&mut s, &mut buf, b"*1\r\n$4\r\nPING\r\n")?;
    roundtrip(&mut s, &mut buf, b"*2\r\n$4\r\nECHO\r\n$5\r\nhello\r\n")?;
    // SET greeting world PX 100
    roundtrip(
        &mut s,
        &mut buf,
        b"*5\r\n$3\r\nSET\r\n$8\r\ngreeting\r\n$5\r\nworld\r\n$2\r\nPX\r\n$3\r\n100\r\n",
    )?;
    roundtrip(&mut s, &mut buf, b"*2\r\n$3\r\nGET\r\n$8\r\ngreeting\r\n")?;

    sleep(Duration::from_millis(150));
    roundtrip(&mut s, &mut buf, b"*2\r\n$3\r\nGET\r\n$8\r\ngreeting\r\n")?;
    Ok(())
}
