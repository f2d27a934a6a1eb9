//! Fuzz target for pkt-line framing and side-band demultiplexing.
//!
//! Neither the reader nor the demultiplexer may panic on arbitrary input.

#![no_main]

use libfuzzer_sys::fuzz_target;
use sluice_git::{demux, PktLineReader};
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    let mut reader = PktLineReader::new(Cursor::new(data));

    // Bounded so crafted input cannot loop forever.
    for _ in 0..100 {
        match reader.read() {
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => break,
        }
    }

    let _ = demux(&mut PktLineReader::new(Cursor::new(data)));
});
