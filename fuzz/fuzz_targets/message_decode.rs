//! Fuzz harness for the stream binding decoder.
//!
//! Feeds arbitrary bytes to `MessageCodec`, split at an arbitrary point to
//! exercise partial reads. The decoder must never panic and never yield a
//! message outside the size bounds.

#![no_main]
use bytes::BytesMut;
use ceod::protocol::{MAX_MESSAGE_SIZE, MessageCodec};
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    let split = data.first().map_or(0, |b| usize::from(*b)).min(data.len());
    let (head, tail) = data.split_at(split);

    let mut codec = MessageCodec::new();
    let mut buf = BytesMut::new();

    for chunk in [head, tail] {
        buf.extend_from_slice(chunk);
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(msg)) => {
                    assert!(!msg.payload.is_empty());
                    assert!(msg.payload.len() <= MAX_MESSAGE_SIZE);
                },
                Ok(None) => break,
                Err(_) => return,
            }
        }
    }

    let _ = codec.decode_eof(&mut buf);
});
