use bytes::BytesMut;
use ferrokv::{parse_one, Connection, Flow, Store, Value};
use rand::Rng;
use std::sync::Arc;

const SCRIPT: &[u8] = b"*1\r\n$4\r\nPING\r\n\
*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$7\r\nb\r\na\r\nr\r\n\
*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n\
*2\r\n$4\r\nECHO\r\n$0\r\n\r\n\
*1\r\n$7\r\nCOMMAND\r\n\
*2\r\n$3\r\nGET\r\n$4\r\nnone\r\n";

const REPLIES: &[u8] = b"+PONG\r\n\
+OK\r\n\
$7\r\nb\r\na\r\nr\r\n\
$0\r\n\r\n\
-ERR unknown command 'COMMAND'\r\n\
$-1\r\n";

fn feed(chunks: &[&[u8]]) -> (Vec<u8>, Flow) {
    let mut conn = Connection::new(Arc::new(Store::new()));
    let mut out = BytesMut::new();
    let mut flow = Flow::Continue;
    for chunk in chunks {
        flow = conn.process(chunk, &mut out);
    }
    (out.to_vec(), flow)
}

#[test]
fn pipelined_commands_reply_in_order() {
    let (out, flow) = feed(&[SCRIPT]);
    assert_eq!(flow, Flow::Continue);
    assert_eq!(out, REPLIES);
}

#[test]
fn one_byte_at_a_time() {
    let chunks: Vec<&[u8]> = SCRIPT.chunks(1).collect();
    let (out, _) = feed(&chunks);
    assert_eq!(out, REPLIES);
}

#[test]
fn every_two_way_split() {
    for cut in 0..=SCRIPT.len() {
        let (a, b) = SCRIPT.split_at(cut);
        let (out, _) = feed(&[a, b]);
        assert_eq!(out, REPLIES, "split at {}", cut);
    }
}

#[test]
fn random_splits() {
    let mut rng = rand::thread_rng();
    for _ in 0..200 {
        let mut chunks = Vec::new();
        let mut rest = SCRIPT;
        while !rest.is_empty() {
            let n = rng.gen_range(1..=rest.len().min(16));
            let (head, tail) = rest.split_at(n);
            chunks.push(head);
            rest = tail;
        }
        let (out, _) = feed(&chunks);
        assert_eq!(out, REPLIES);
    }
}

#[test]
fn protocol_error_closes_and_keeps_store() {
    let store = Arc::new(Store::new());
    let mut conn = Connection::new(store.clone());
    let mut out = BytesMut::new();

    let flow = conn.process(
        b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n\
*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$2\r\nlonger\r\n",
        &mut out,
    );
    assert_eq!(flow, Flow::Close);
    assert_eq!(&out[..], b"+OK\r\n-ERR protocol error\r\n");

    let mut other = Connection::new(store);
    out.clear();
    other.process(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n", &mut out);
    assert_eq!(&out[..], b"$1\r\nv\r\n");
}

#[test]
fn connections_share_the_store() {
    let store = Arc::new(Store::new());
    let mut a = Connection::new(store.clone());
    let mut b = Connection::new(store);
    let mut out = BytesMut::new();

    a.process(b"*3\r\n$3\r\nSET\r\n$1\r\nx\r\n$1\r\n1\r\n", &mut out);
    // Unknown command on one client leaves the other unaffected
    assert_eq!(a.process(b"*1\r\n$5\r\nBOGUS\r\n", &mut out), Flow::Continue);
    out.clear();
    b.process(b"*2\r\n$3\r\nGET\r\n$1\r\nx\r\n", &mut out);
    assert_eq!(&out[..], b"$1\r\n1\r\n");
}

#[test]
fn line_breaks_in_unknown_name_give_one_reply() {
    let (out, flow) = feed(&[b"*1\r\n$6\r\nX\r\n+OK\r\n"]);
    assert_eq!(flow, Flow::Continue);

    let (n, reply) = parse_one(&out).unwrap().unwrap();
    assert_eq!(n, out.len());
    assert_eq!(reply, Value::error("ERR unknown command 'X  +OK'"));
}
