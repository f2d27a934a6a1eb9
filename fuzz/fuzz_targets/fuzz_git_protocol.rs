//! Fuzz target for smart HTTP message decoding.
//!
//! Feeds the same bytes to every decoder a server or client runs on
//! untrusted input. A request that decodes and re-encodes must decode again.
//! Re-encoding may fail: a full-length line leaves no room for the newline
//! the encoder appends.

#![no_main]

use libfuzzer_sys::fuzz_target;
use sluice_git::{
    AdvertisedReferences, ReceivePackResult, ReferenceUpdateRequest, ReportStatus, SideBand,
    UploadPackRequest, UploadPackResult,
};

fuzz_target!(|data: &[u8]| {
    if let Ok(request) = UploadPackRequest::decode(data) {
        let mut out = Vec::new();
        if request.encode(&mut out).is_ok() {
            UploadPackRequest::decode(&out[..]).expect("re-encoded request decodes");
        }
    }

    if let Ok(request) = ReferenceUpdateRequest::decode(data) {
        let mut out = Vec::new();
        if request.encode(&mut out).is_ok() {
            ReferenceUpdateRequest::decode(&out[..]).expect("re-encoded commands decode");
        }
    }

    if let Ok(advertised) = AdvertisedReferences::decode(data) {
        let _ = advertised.encode(&mut Vec::new());
    }

    let _ = ReportStatus::decode(data);
    for side_band in [SideBand::None, SideBand::SideBand, SideBand::SideBand64k] {
        let _ = UploadPackResult::decode(data, side_band);
        let _ = ReceivePackResult::decode(data, side_band);
    }
});
