// Tracker UDP protocol: text requests, binary PEERS_LIST responses with the
// legacy ASCII ACK/ERROR forms, and the peer-side client that keeps the
// known-peers snapshot fresh.

mod client;
mod wire;

pub use client::{Advertiser, InventorySource, TrackerClient, TrackerClientOptions};
pub use wire::{
    FileSet, PeerEntry, Request, RequestParseError, Response, WireError, build_files_info,
    decode_response, encode_response, error_codes, parse_files_info, parse_request,
};
